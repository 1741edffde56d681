//! Asynchronous LDAP client speaking the same codec as the server.
use std::{
	sync::atomic::{AtomicI32, Ordering},
	time::Duration,
};

use tokio::{
	io::{AsyncWriteExt, BufReader},
	net::{
		tcp::{OwnedReadHalf, OwnedWriteHalf},
		TcpStream, ToSocketAddrs,
	},
	sync::Mutex,
};
use tracing::debug;

use super::{
	ber,
	control::{Control, PagedResults},
	message::{
		AddRequest, BindRequest, Change, CompareRequest, Message, ModifyDnRequest, ModifyRequest,
		Operation, PartialAttribute, SearchEntry, SearchRequest,
	},
	result::LdapResult,
	server::NOTICE_OF_DISCONNECTION,
	Error,
};

/// Everything a search returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
	/// Matching entries.
	pub entries: Vec<SearchEntry>,
	/// Continuation references.
	pub references: Vec<String>,
	/// The result of the final `searchResDone`.
	pub result: LdapResult,
	/// Controls of the final `searchResDone`.
	pub controls: Vec<Control>,
}

/// The two halves of the socket.
#[derive(Debug)]
struct Connection {
	/// Incoming PDUs.
	reader: BufReader<OwnedReadHalf>,
	/// Outgoing PDUs.
	writer: OwnedWriteHalf,
}

/// A connection to an LDAP server. Operations are sent one at a time; each
/// waits for its complete reply before the next is written.
#[derive(Debug)]
pub struct Client {
	/// The socket, held for a whole exchange.
	connection: Mutex<Connection>,
	/// Message id of the next request.
	next_id: AtomicI32,
	/// Limit for reading a single PDU.
	timeout: Option<Duration>,
}

impl Client {
	/// Connect to `addr`.
	pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, Error> {
		let stream = TcpStream::connect(addr).await?;
		stream.set_nodelay(true)?;
		let (reader, writer) = stream.into_split();
		Ok(Self {
			connection: Mutex::new(Connection { reader: BufReader::new(reader), writer }),
			next_id: AtomicI32::new(1),
			timeout: None,
		})
	}

	/// Fail reads that take longer than `timeout`.
	#[must_use]
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	/// Simple bind. An empty name and password bind anonymously.
	pub async fn bind(&self, name: &str, password: &str) -> Result<LdapResult, Error> {
		let request = Operation::BindRequest(BindRequest::simple(name, password));
		match self.exchange(request, Vec::new()).await?.operation {
			Operation::BindResponse(result) => Ok(result),
			other => Err(unexpected(&other)),
		}
	}

	/// Run a search and collect all entries up to its `searchResDone`.
	pub async fn search(
		&self,
		request: SearchRequest,
		controls: Vec<Control>,
	) -> Result<SearchResult, Error> {
		let mut connection = self.connection.lock().await;
		let id = self.send(&mut connection, Operation::SearchRequest(request), controls).await?;

		let mut entries = Vec::new();
		let mut references = Vec::new();
		loop {
			let message = self.receive(&mut connection, id).await?;
			match message.operation {
				Operation::SearchResultEntry(entry) => entries.push(entry),
				Operation::SearchResultReference(urls) => references.extend(urls),
				Operation::SearchResultDone(result) => {
					let controls = message.controls;
					return Ok(SearchResult { entries, references, result, controls });
				}
				other => return Err(unexpected(&other)),
			}
		}
	}

	/// Run a search page by page until the server hands out an empty
	/// cookie. The result is that of the last page.
	pub async fn search_paged(
		&self,
		request: SearchRequest,
		page_size: i32,
	) -> Result<SearchResult, Error> {
		let mut cookie = Vec::new();
		let mut entries = Vec::new();
		let mut references = Vec::new();
		loop {
			let control = PagedResults::new(page_size, cookie).to_control()?;
			let mut page = self.search(request.clone(), vec![control]).await?;
			entries.append(&mut page.entries);
			references.append(&mut page.references);

			let next =
				PagedResults::find(&page.controls)?.map(|paged| paged.cookie).unwrap_or_default();
			if next.is_empty() || !page.result.is_success() {
				return Ok(SearchResult {
					entries,
					references,
					result: page.result,
					controls: page.controls,
				});
			}
			debug!("Fetched page of {} entries, continuing", entries.len());
			cookie = next;
		}
	}

	/// Add an entry.
	pub async fn add(
		&self,
		dn: &str,
		attributes: Vec<PartialAttribute>,
	) -> Result<LdapResult, Error> {
		let request = Operation::AddRequest(AddRequest { dn: dn.to_owned(), attributes });
		match self.exchange(request, Vec::new()).await?.operation {
			Operation::AddResponse(result) => Ok(result),
			other => Err(unexpected(&other)),
		}
	}

	/// Modify an entry.
	pub async fn modify(&self, dn: &str, changes: Vec<Change>) -> Result<LdapResult, Error> {
		let request = Operation::ModifyRequest(ModifyRequest { dn: dn.to_owned(), changes });
		match self.exchange(request, Vec::new()).await?.operation {
			Operation::ModifyResponse(result) => Ok(result),
			other => Err(unexpected(&other)),
		}
	}

	/// Rename or move an entry.
	pub async fn modify_dn(&self, request: ModifyDnRequest) -> Result<LdapResult, Error> {
		match self.exchange(Operation::ModifyDnRequest(request), Vec::new()).await?.operation {
			Operation::ModifyDnResponse(result) => Ok(result),
			other => Err(unexpected(&other)),
		}
	}

	/// Delete an entry.
	pub async fn delete(&self, dn: &str) -> Result<LdapResult, Error> {
		match self.exchange(Operation::DeleteRequest(dn.to_owned()), Vec::new()).await?.operation {
			Operation::DeleteResponse(result) => Ok(result),
			other => Err(unexpected(&other)),
		}
	}

	/// Compare an attribute value. The result code is `compareTrue` or
	/// `compareFalse` on success.
	pub async fn compare(
		&self,
		dn: &str,
		attribute: &str,
		value: &str,
	) -> Result<LdapResult, Error> {
		let request = Operation::CompareRequest(CompareRequest {
			dn: dn.to_owned(),
			attribute: attribute.to_owned(),
			value: value.as_bytes().to_vec(),
		});
		match self.exchange(request, Vec::new()).await?.operation {
			Operation::CompareResponse(result) => Ok(result),
			other => Err(unexpected(&other)),
		}
	}

	/// Ask the server to abandon the operation with `message_id`.
	pub async fn abandon_search(&self, message_id: i32) -> Result<LdapResult, Error> {
		match self.exchange(Operation::AbandonRequest(message_id), Vec::new()).await?.operation {
			Operation::ExtendedResponse { result, .. } => Ok(result),
			other => Err(unexpected(&other)),
		}
	}

	/// Say goodbye and close the connection.
	pub async fn unbind(self) -> Result<(), Error> {
		let mut connection = self.connection.into_inner();
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let unbind = Message::new(id, Operation::UnbindRequest).to_bytes()?;
		connection.writer.write_all(&unbind).await?;
		connection.writer.shutdown().await?;
		Ok(())
	}

	/// Send one request and read its single response.
	async fn exchange(
		&self,
		operation: Operation,
		controls: Vec<Control>,
	) -> Result<Message, Error> {
		let mut connection = self.connection.lock().await;
		let id = self.send(&mut connection, operation, controls).await?;
		self.receive(&mut connection, id).await
	}

	/// Write a request under a fresh message id.
	async fn send(
		&self,
		connection: &mut Connection,
		operation: Operation,
		controls: Vec<Control>,
	) -> Result<i32, Error> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let bytes = Message::new(id, operation).with_controls(controls).to_bytes()?;
		connection.writer.write_all(&bytes).await?;
		Ok(id)
	}

	/// Read the next message, which must answer request `id`.
	async fn receive(&self, connection: &mut Connection, id: i32) -> Result<Message, Error> {
		let read = ber::read_frame(&mut connection.reader);
		let frame = match self.timeout {
			Some(timeout) => {
				tokio::time::timeout(timeout, read).await.map_err(|_| Error::Timeout)??
			}
			None => read.await?,
		};
		let message = Message::decode(frame.ok_or(Error::ConnectionClosed)?)?;

		if message.id == 0 {
			if let Operation::ExtendedResponse { name: Some(name), result, .. } = &message.operation
			{
				if name == NOTICE_OF_DISCONNECTION {
					debug!("Server disconnected: {result}");
					return Err(Error::ConnectionClosed);
				}
			}
		}
		if message.id != id {
			return Err(Error::UnexpectedResponse(format!(
				"{} for message {} while waiting for {id}",
				message.operation.name(),
				message.id
			)));
		}
		Ok(message)
	}
}

/// Error for a reply of the wrong type.
fn unexpected(operation: &Operation) -> Error {
	Error::UnexpectedResponse(operation.name().to_owned())
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::{io::AsyncWriteExt, net::TcpListener};

	use super::Client;
	use crate::ldap::{
		ber,
		message::{Message, Operation},
		result::{LdapResult, ResultCode},
		server::NOTICE_OF_DISCONNECTION,
		Error,
	};

	/// A peer that answers the first request with `reply`.
	async fn peer(reply: Message) -> Result<std::net::SocketAddr, Box<dyn std::error::Error>> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		tokio::spawn(async move {
			if let Ok((mut stream, _)) = listener.accept().await {
				if ber::read_frame(&mut stream).await.is_ok() {
					if let Ok(bytes) = reply.to_bytes() {
						let _ = stream.write_all(&bytes).await;
					}
				}
				tokio::time::sleep(Duration::from_millis(500)).await;
			}
		});
		Ok(addr)
	}

	#[tokio::test]
	async fn mismatched_message_id() -> Result<(), Box<dyn std::error::Error>> {
		let addr = peer(Message::new(42, Operation::DeleteResponse(LdapResult::success()))).await?;
		let client = Client::connect(addr).await?;
		assert!(matches!(client.delete("cn=foo").await, Err(Error::UnexpectedResponse(_))));
		Ok(())
	}

	#[tokio::test]
	async fn notice_of_disconnection() -> Result<(), Box<dyn std::error::Error>> {
		let notice = Message::new(
			0,
			Operation::ExtendedResponse {
				result: LdapResult::new(ResultCode::PROTOCOL_ERROR),
				name: Some(NOTICE_OF_DISCONNECTION.to_owned()),
				value: None,
			},
		);
		let client = Client::connect(peer(notice).await?).await?;
		assert!(matches!(client.bind("", "").await, Err(Error::ConnectionClosed)));
		Ok(())
	}

	#[tokio::test]
	async fn read_timeout() -> Result<(), Box<dyn std::error::Error>> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		let silent = tokio::spawn(async move {
			let accepted = listener.accept().await;
			tokio::time::sleep(Duration::from_secs(2)).await;
			drop(accepted);
		});
		let client = Client::connect(addr).await?.with_timeout(Duration::from_millis(100));
		assert!(matches!(client.bind("", "").await, Err(Error::Timeout)));
		silent.abort();
		Ok(())
	}
}
