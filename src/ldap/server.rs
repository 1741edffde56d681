//! TCP server framework dispatching decoded requests to a [`Handler`].
use std::{
	collections::HashMap,
	net::SocketAddr,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
	io::{AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
	net::{TcpListener, TcpStream},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use super::{
	ber,
	control::Control,
	message::{Message, Operation, SearchEntry},
	paging::PagingContext,
	result::{LdapResult, ResultCode},
	Error,
};

/// OID of the unsolicited notice of disconnection.
pub const NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serves the requests of a connection.
#[async_trait]
pub trait Handler: Send + Sync {
	/// Perform one operation. Searches return their entries in the
	/// response, every other operation only the result.
	async fn serve(&self, ctx: &mut Context, request: Request) -> Response;
}

/// State of one client connection, handed to every request it makes.
#[derive(Debug)]
pub struct Context {
	/// Address of the client.
	pub peer: SocketAddr,
	/// Continuation points of paged searches on this connection.
	pub paging: PagingContext,
	/// DN of the last successful bind, empty for anonymous.
	pub bind_dn: String,
	/// Cancelled when the connection or the server shuts down.
	pub token: CancellationToken,
}

impl Context {
	/// A fresh, anonymous connection context.
	#[must_use]
	pub fn new(peer: SocketAddr, token: CancellationToken) -> Self {
		Self { peer, paging: PagingContext::new(), bind_dn: String::new(), token }
	}
}

/// A request as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
	/// Message id of the request.
	pub message_id: i32,
	/// The operation to perform.
	pub operation: Operation,
	/// Request controls.
	pub controls: Vec<Control>,
}

/// Reply of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
	/// Outcome of the operation.
	pub result: LdapResult,
	/// Entries found by a search.
	pub entries: Vec<SearchEntry>,
	/// Response controls.
	pub controls: Vec<Control>,
}

impl Response {
	/// A reply carrying only a result.
	#[must_use]
	pub fn new(result: LdapResult) -> Self {
		Self { result, entries: Vec::new(), controls: Vec::new() }
	}

	/// A reply with a bare result code.
	#[must_use]
	pub fn code(code: ResultCode) -> Self {
		Self::new(LdapResult::new(code))
	}

	/// The reply of a search.
	#[must_use]
	pub fn search(entries: Vec<SearchEntry>, result: LdapResult) -> Self {
		Self { result, entries, controls: Vec::new() }
	}

	/// Attach response controls.
	#[must_use]
	pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
		self.controls = controls;
		self
	}
}

impl From<LdapResult> for Response {
	fn from(result: LdapResult) -> Self {
		Self::new(result)
	}
}

/// Accepts connections and runs one sequential request loop per
/// connection.
pub struct Server {
	/// Serves all connections.
	handler: Arc<dyn Handler>,
	/// Cancelled by [`Server::close`].
	token: CancellationToken,
	/// Tracks connection tasks.
	tracker: TaskTracker,
	/// Open connections by id.
	connections: Arc<Mutex<HashMap<u64, SocketAddr>>>,
	/// Id of the next connection.
	next: AtomicU64,
	/// Whether [`Server::close`] has run.
	closed: AtomicBool,
}

impl std::fmt::Debug for Server {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Server")
			.field("connections", &self.connections.lock().len())
			.field("closed", &self.closed.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

impl Server {
	/// Create a server for `handler`.
	#[must_use]
	pub fn new(handler: Arc<dyn Handler>) -> Self {
		Self {
			handler,
			token: CancellationToken::new(),
			tracker: TaskTracker::new(),
			connections: Arc::new(Mutex::new(HashMap::new())),
			next: AtomicU64::new(0),
			closed: AtomicBool::new(false),
		}
	}

	/// Bind `addr` and serve until closed.
	pub async fn listen_and_serve(&self, addr: &str) -> Result<(), Error> {
		let listener = TcpListener::bind(addr).await?;
		info!("LDAP server listening on {}", listener.local_addr()?);
		self.serve(listener).await
	}

	/// Accept connections from `listener` until the server is closed, which
	/// is reported as [`Error::ServerClosed`].
	pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::ServerClosed);
		}
		loop {
			tokio::select! {
				() = self.token.cancelled() => return Err(Error::ServerClosed),
				accepted = listener.accept() => match accepted {
					Ok((stream, peer)) => self.spawn(stream, peer),
					Err(err) => {
						warn!("Failed to accept LDAP connection: {err}");
						tokio::select! {
							() = self.token.cancelled() => return Err(Error::ServerClosed),
							() = tokio::time::sleep(ACCEPT_BACKOFF) => {}
						}
					}
				},
			}
		}
	}

	/// Addresses of the currently open connections.
	#[must_use]
	pub fn connections(&self) -> Vec<SocketAddr> {
		self.connections.lock().values().copied().collect()
	}

	/// Stop accepting, cancel every connection and wait for them to end.
	/// Closing twice is harmless.
	pub async fn close(&self) {
		if !self.closed.swap(true, Ordering::AcqRel) {
			debug!("Closing LDAP server");
		}
		self.token.cancel();
		self.tracker.close();
		self.tracker.wait().await;
	}

	/// Start the request loop of a new connection.
	fn spawn(&self, stream: TcpStream, peer: SocketAddr) {
		let id = self.next.fetch_add(1, Ordering::Relaxed);
		self.connections.lock().insert(id, peer);
		debug!("Accepted LDAP connection {id} from {peer}");

		let handler = self.handler.clone();
		let connections = self.connections.clone();
		let token = self.token.child_token();
		self.tracker.spawn(async move {
			let ctx = Context::new(peer, token);
			if let Err(err) = connection(handler.as_ref(), stream, ctx).await {
				debug!("LDAP connection {id} from {peer} failed: {err}");
			}
			connections.lock().remove(&id);
			debug!("Closed LDAP connection {id} from {peer}");
		});
	}
}

/// What to do after a request.
enum Next {
	/// Write the replies and read the next request.
	Reply(Vec<Message>),
	/// Close the connection.
	Close,
}

/// Request loop of one connection. A request is fully answered before the
/// next one is read.
async fn connection(
	handler: &dyn Handler,
	stream: TcpStream,
	mut ctx: Context,
) -> Result<(), Error> {
	let (reader, writer) = stream.into_split();
	let mut reader = BufReader::new(reader);
	let mut writer = BufWriter::new(writer);

	loop {
		let frame = tokio::select! {
			() = ctx.token.cancelled() => break,
			frame = ber::read_frame(&mut reader) => frame,
		};
		let tag = match frame {
			Ok(Some(tag)) => tag,
			Ok(None) => break,
			Err(Error::Protocol(reason)) => {
				warn!("Malformed PDU from {}: {reason}", ctx.peer);
				disconnect(&mut writer, &reason).await?;
				break;
			}
			Err(err) => return Err(err),
		};

		let id = Message::peek_id(&tag);
		let message = match Message::decode(tag) {
			Ok(message) => message,
			Err(Error::Filter(err)) if id.is_some() => {
				warn!("Rejecting search from {} with invalid filter: {err}", ctx.peer);
				let done =
					LdapResult::new(ResultCode::PROTOCOL_ERROR).with_message(err.to_string());
				let reply = Message::new(id.unwrap_or_default(), Operation::SearchResultDone(done));
				write(&mut writer, &[reply]).await?;
				continue;
			}
			Err(err) => {
				warn!("Invalid request from {}: {err}", ctx.peer);
				disconnect(&mut writer, &err.to_string()).await?;
				break;
			}
		};

		match dispatch(handler, &mut ctx, message).await {
			Next::Reply(replies) => write(&mut writer, &replies).await?,
			Next::Close => break,
		}
	}
	writer.shutdown().await.or_else(|err| match err.kind() {
		std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => Ok(()),
		_ => Err(err),
	})?;
	Ok(())
}

/// Answer one decoded request.
async fn dispatch(handler: &dyn Handler, ctx: &mut Context, message: Message) -> Next {
	let Message { id, operation, controls } = message;
	let respond: fn(LdapResult) -> Operation = match &operation {
		Operation::UnbindRequest => return Next::Close,
		Operation::AbandonRequest(_) => {
			return Next::Reply(vec![Message::new(
				id,
				Operation::ExtendedResponse {
					result: LdapResult::new(ResultCode::CANNOT_CANCEL),
					name: None,
					value: None,
				},
			)]);
		}
		Operation::ExtendedRequest { name, .. } => {
			let result = LdapResult::new(ResultCode::PROTOCOL_ERROR)
				.with_message(format!("unsupported extended operation {name}"));
			return Next::Reply(vec![Message::new(
				id,
				Operation::ExtendedResponse { result, name: None, value: None },
			)]);
		}
		Operation::BindRequest(_) => Operation::BindResponse,
		Operation::SearchRequest(_) => Operation::SearchResultDone,
		Operation::ModifyRequest(_) => Operation::ModifyResponse,
		Operation::AddRequest(_) => Operation::AddResponse,
		Operation::DeleteRequest(_) => Operation::DeleteResponse,
		Operation::ModifyDnRequest(_) => Operation::ModifyDnResponse,
		Operation::CompareRequest(_) => Operation::CompareResponse,
		other => {
			warn!("Client {} sent a {} which is not a request", ctx.peer, other.name());
			return Next::Close;
		}
	};

	let bind_dn = match &operation {
		Operation::BindRequest(bind) => Some(bind.name.clone()),
		_ => None,
	};
	let response = handler.serve(ctx, Request { message_id: id, operation, controls }).await;
	if let Some(name) = bind_dn {
		if response.result.is_success() {
			ctx.bind_dn = name;
		}
	}

	let mut replies: Vec<Message> = response
		.entries
		.into_iter()
		.map(|entry| Message::new(id, Operation::SearchResultEntry(entry)))
		.collect();
	replies.push(Message::new(id, respond(response.result)).with_controls(response.controls));
	Next::Reply(replies)
}

/// Write and flush a batch of messages.
async fn write<W: AsyncWrite + Unpin>(writer: &mut W, messages: &[Message]) -> Result<(), Error> {
	for message in messages {
		writer.write_all(&message.to_bytes()?).await?;
	}
	writer.flush().await?;
	Ok(())
}

/// Send the notice of disconnection before dropping a misbehaving client.
async fn disconnect<W: AsyncWrite + Unpin>(writer: &mut W, reason: &str) -> Result<(), Error> {
	let notice = Message::new(
		0,
		Operation::ExtendedResponse {
			result: LdapResult::new(ResultCode::PROTOCOL_ERROR).with_message(reason),
			name: Some(NOTICE_OF_DISCONNECTION.to_owned()),
			value: None,
		},
	);
	write(writer, &[notice]).await
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use async_trait::async_trait;
	use tokio::{
		io::{AsyncReadExt, AsyncWriteExt},
		net::{TcpListener, TcpStream},
	};

	use super::{Context, Handler, Request, Response, Server, NOTICE_OF_DISCONNECTION};
	use crate::ldap::{
		ber,
		message::{Message, Operation, PartialAttribute, Scope, SearchEntry, SearchRequest},
		result::{LdapResult, ResultCode},
		Error,
	};

	/// Answers searches with two fixed entries and everything else with
	/// success.
	struct Fixed;

	#[async_trait]
	impl Handler for Fixed {
		async fn serve(&self, _ctx: &mut Context, request: Request) -> Response {
			match request.operation {
				Operation::SearchRequest(_) => Response::search(
					["cn=a", "cn=b"]
						.into_iter()
						.map(|dn| SearchEntry {
							dn: dn.to_owned(),
							attributes: vec![PartialAttribute::new("cn", [&dn[3..]])],
						})
						.collect(),
					LdapResult::success(),
				),
				_ => Response::code(ResultCode::SUCCESS),
			}
		}
	}

	/// Start a server on an ephemeral port.
	async fn start() -> Result<(Arc<Server>, TcpStream), Box<dyn std::error::Error>> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		let server = Arc::new(Server::new(Arc::new(Fixed)));
		let serving = server.clone();
		tokio::spawn(async move { serving.serve(listener).await });
		Ok((server, TcpStream::connect(addr).await?))
	}

	/// Read one message.
	async fn receive(stream: &mut TcpStream) -> Result<Message, Box<dyn std::error::Error>> {
		let tag = ber::read_frame(stream).await?.ok_or("connection closed")?;
		Ok(Message::decode(tag)?)
	}

	#[tokio::test]
	async fn search_yields_entries_then_done() -> Result<(), Box<dyn std::error::Error>> {
		let (server, mut stream) = start().await?;
		let search = SearchRequest::new("", Scope::WholeSubtree, "(cn=*)")?;
		stream.write_all(&Message::new(7, Operation::SearchRequest(search)).to_bytes()?).await?;

		let mut names = Vec::new();
		loop {
			let message = receive(&mut stream).await?;
			assert_eq!(message.id, 7);
			match message.operation {
				Operation::SearchResultEntry(entry) => names.push(entry.dn),
				Operation::SearchResultDone(result) => {
					assert!(result.is_success());
					break;
				}
				other => return Err(format!("unexpected {}", other.name()).into()),
			}
		}
		assert_eq!(names, ["cn=a", "cn=b"]);
		server.close().await;
		Ok(())
	}

	#[tokio::test]
	async fn abandon_cannot_cancel_and_unbind_closes() -> Result<(), Box<dyn std::error::Error>> {
		let (server, mut stream) = start().await?;
		stream.write_all(&Message::new(3, Operation::AbandonRequest(2)).to_bytes()?).await?;
		let reply = receive(&mut stream).await?;
		assert_eq!(reply.id, 3);
		let code = reply.operation.result().map(|result| result.code);
		assert_eq!(code, Some(ResultCode::CANNOT_CANCEL));

		stream.write_all(&Message::new(4, Operation::UnbindRequest).to_bytes()?).await?;
		let mut rest = Vec::new();
		stream.read_to_end(&mut rest).await?;
		assert!(rest.is_empty());
		server.close().await;
		Ok(())
	}

	#[tokio::test]
	async fn malformed_pdu_gets_notice_and_eof() -> Result<(), Box<dyn std::error::Error>> {
		let (server, mut stream) = start().await?;
		let garbage = ber::sequence(vec![ber::integer(5), ber::octet_string("not an operation")]);
		stream.write_all(&ber::encode(garbage)?).await?;

		let notice = receive(&mut stream).await?;
		assert_eq!(notice.id, 0);
		match notice.operation {
			Operation::ExtendedResponse { result, name, .. } => {
				assert_eq!(result.code, ResultCode::PROTOCOL_ERROR);
				assert_eq!(name.as_deref(), Some(NOTICE_OF_DISCONNECTION));
			}
			other => return Err(format!("unexpected {}", other.name()).into()),
		}
		assert_eq!(ber::read_frame(&mut stream).await?, None);
		server.close().await;
		Ok(())
	}

	#[tokio::test]
	async fn close_is_idempotent_and_stops_serving() -> Result<(), Box<dyn std::error::Error>> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let server = Arc::new(Server::new(Arc::new(Fixed)));
		let serving = server.clone();
		let task = tokio::spawn(async move { serving.serve(listener).await });
		server.close().await;
		server.close().await;
		assert!(matches!(task.await?, Err(Error::ServerClosed)));
		Ok(())
	}
}
