//! An in-memory LDAP directory served from `ldap` configuration documents.
//!
//! A [`DirectoryConfig`] names a listen address and the entries to serve.
//! [`Directories`] listens on a [`Watcher`] for such documents and keeps
//! one [`Server`] per address running, swapping the served content when a
//! document changes.
use std::{
	collections::{BTreeMap, HashMap},
	net::{SocketAddr, TcpListener as StdListener},
	sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::{
	control::{Control, PagedResults},
	entry::{self, normalize_dn, split_dn, Entry},
	message::{
		AddRequest, Authentication, BindRequest, CompareRequest, ModifyDnRequest, ModifyOperation,
		ModifyRequest, Operation, Scope, SearchRequest,
	},
	paging::PagingContext,
	result::{LdapResult, ResultCode},
	server::{Context, Handler, Request, Response, Server},
	Error,
};
use crate::{
	dynamic::{self, Addressable, Config, Document, Reader, Reference, Shape},
	pool::Pool,
	watcher::Watcher,
};

/// Attribute values by attribute name, as written in a document.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Descriptive information of a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
	/// Display name.
	#[serde(default)]
	pub name: String,
	/// Free text description.
	#[serde(default)]
	pub description: String,
}

/// Default listen address.
fn default_host() -> String {
	":389".to_owned()
}

/// Accept the document version as a string or a number.
fn version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
	use serde::de::Error as _;

	match serde_json::Value::deserialize(deserializer)? {
		serde_json::Value::String(version) => Ok(version),
		serde_json::Value::Number(version) => Ok(version.to_string()),
		other => Err(D::Error::custom(format!("invalid ldap version {other}"))),
	}
}

/// A directory configuration document, recognized by its `ldap` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryConfig {
	/// Document format version.
	#[serde(deserialize_with = "version")]
	pub ldap: String,
	/// Descriptive information.
	#[serde(default)]
	pub info: Info,
	/// Listen address. A bare `:port` listens on all interfaces.
	#[serde(default = "default_host")]
	pub host: String,
	/// Maximum number of entries a search returns, 0 for unlimited.
	#[serde(default)]
	pub size_limit: i32,
	/// Attributes added to or overriding the synthetic root DSE.
	#[serde(default)]
	pub root_dse: Option<Attributes>,
	/// Entries by DN, each inline or by `$ref`.
	#[serde(default)]
	pub entries: BTreeMap<String, Reference<Attributes>>,
}

impl Addressable for DirectoryConfig {
	fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
		match token {
			"entries" => Some(&self.entries),
			"host" => Some(&self.host),
			_ => None,
		}
	}

	fn to_value(&self) -> Option<serde_json::Value> {
		serde_json::to_value(self).ok()
	}
}

impl Document for DirectoryConfig {
	fn shape(&self) -> Shape {
		Shape::of::<Self>()
	}

	fn clone_document(&self) -> Box<dyn Document> {
		Box::new(self.clone())
	}

	fn as_addressable(&self) -> &dyn Addressable {
		self
	}

	fn parse(&mut self, config: &Config, reader: &dyn Reader) -> Result<(), dynamic::Error> {
		for entry in self.entries.values_mut() {
			entry.resolve(config, reader)?;
		}
		Ok(())
	}
}

/// The values of one attribute in a document.
fn values(value: &serde_json::Value) -> Vec<String> {
	match value {
		serde_json::Value::Null => Vec::new(),
		serde_json::Value::String(value) => vec![value.clone()],
		serde_json::Value::Array(items) => items.iter().flat_map(values).collect(),
		other => vec![other.to_string()],
	}
}

/// An entry from document attributes.
fn entry_from(dn: &str, attributes: &Attributes) -> Entry {
	let mut entry = Entry::new(dn);
	for (name, value) in attributes {
		entry.set(name, values(value));
	}
	entry
}

/// An entry together with its normalized DN.
#[derive(Debug, Clone)]
struct Stored {
	/// Normalized DN.
	key: String,
	/// The entry.
	entry: Entry,
}

/// The content of a directory and the operations on it.
#[derive(Debug, Clone, Default)]
pub struct Directory {
	/// Entries in insertion order.
	entries: Vec<Stored>,
	/// Attributes overriding the synthetic root DSE.
	root_dse: Attributes,
	/// Server side search limit, 0 for unlimited.
	size_limit: usize,
}

impl Directory {
	/// An empty directory.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// The directory described by a document. Entries that failed to
	/// resolve are skipped.
	#[must_use]
	pub fn from_config(config: &DirectoryConfig) -> Self {
		let mut directory = Self {
			entries: Vec::with_capacity(config.entries.len()),
			root_dse: config.root_dse.clone().unwrap_or_default(),
			size_limit: usize::try_from(config.size_limit).unwrap_or(0),
		};
		for (dn, attributes) in &config.entries {
			match attributes.value() {
				Some(attributes) => directory.insert(entry_from(dn, attributes)),
				None => warn!("Skipping unresolved directory entry {dn}"),
			}
		}
		directory
	}

	/// Insert or replace an entry without any checks.
	pub fn insert(&mut self, entry: Entry) {
		let key = normalize_dn(&entry.dn);
		match self.position(&key) {
			Some(at) => self.entries[at] = Stored { key, entry },
			None => self.entries.push(Stored { key, entry }),
		}
	}

	/// Look up an entry by DN.
	#[must_use]
	pub fn get(&self, dn: &str) -> Option<&Entry> {
		self.position(&normalize_dn(dn)).map(|at| &self.entries[at].entry)
	}

	/// Number of entries.
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the directory holds no entries.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Index of the entry with normalized DN `key`.
	fn position(&self, key: &str) -> Option<usize> {
		self.entries.iter().position(|stored| stored.key == key)
	}

	/// Whether any entry lies directly below normalized `key`.
	fn has_children(&self, key: &str) -> bool {
		self.entries.iter().any(|stored| split_dn(&stored.key).1 == key)
	}

	/// The synthetic root DSE.
	#[must_use]
	pub fn root_dse(&self) -> Entry {
		let mut root = Entry::new("");
		root.set("objectClass", vec!["top".to_owned()]);
		let contexts = self
			.entries
			.iter()
			.filter(|stored| {
				let parent = split_dn(&stored.key).1;
				parent.is_empty() || self.position(parent).is_none()
			})
			.map(|stored| stored.entry.dn.clone())
			.collect();
		root.set("namingContexts", contexts);
		root.set("supportedLDAPVersion", vec!["3".to_owned()]);
		root.set("supportedControl", vec![PagedResults::OID.to_owned()]);
		for (name, value) in &self.root_dse {
			root.set(name, values(value));
		}
		root
	}

	/// Authenticate a bind. Anonymous binds always succeed; an entry
	/// without `userPassword` accepts any password.
	#[must_use]
	pub fn bind(&self, request: &BindRequest) -> LdapResult {
		let password = match &request.authentication {
			Authentication::Simple(password) => password,
			Authentication::Sasl { mechanism, .. } => {
				return LdapResult::new(ResultCode::AUTH_METHOD_NOT_SUPPORTED)
					.with_message(format!("SASL mechanism {mechanism} is not supported"))
			}
		};
		if request.name.is_empty() {
			return LdapResult::success();
		}
		let Some(entry) = self.get(&request.name) else {
			return LdapResult::new(ResultCode::INVALID_CREDENTIALS);
		};
		let stored = entry.values("userPassword");
		let matches = |candidate: &String| candidate.as_bytes() == password.as_slice();
		if stored.is_empty() || stored.iter().any(matches) {
			LdapResult::success()
		} else {
			LdapResult::new(ResultCode::INVALID_CREDENTIALS)
		}
	}

	/// Run a search, paging through `paging` when the request carries the
	/// paged results control.
	#[must_use]
	pub fn search(
		&self,
		paging: &mut PagingContext,
		request: &SearchRequest,
		controls: &[Control],
	) -> Response {
		if let Some(control) =
			controls.iter().find(|control| control.criticality && control.oid != PagedResults::OID)
		{
			return Response::new(
				LdapResult::new(ResultCode::UNAVAILABLE_CRITICAL_EXTENSION)
					.with_message(format!("unsupported control {}", control.oid)),
			);
		}
		let paged = match PagedResults::find(controls) {
			Ok(paged) => paged,
			Err(err) => {
				return Response::new(
					LdapResult::new(ResultCode::PROTOCOL_ERROR).with_message(err.to_string()),
				)
			}
		};

		let base = normalize_dn(&request.base);
		if base.is_empty() && request.scope == Scope::BaseObject {
			let root = self.root_dse();
			let entries = if root.matches(&request.filter) {
				vec![root.to_search_entry(&request.attributes, request.types_only)]
			} else {
				Vec::new()
			};
			return Response::search(entries, LdapResult::success());
		}
		if !base.is_empty() && self.position(&base).is_none() {
			return Response::new(LdapResult::new(ResultCode::NO_SUCH_OBJECT).with_matched_dn(
				self.closest_ancestor(&base).map(|entry| entry.dn.clone()).unwrap_or_default(),
			));
		}

		let results: Vec<_> = self
			.entries
			.iter()
			.filter(|stored| match request.scope {
				Scope::BaseObject => stored.key == base,
				Scope::SingleLevel => split_dn(&stored.key).1 == base,
				Scope::WholeSubtree => {
					stored.key == base || entry::is_descendant(&stored.key, &base)
				}
			})
			.filter(|stored| stored.entry.matches(&request.filter))
			.map(|stored| stored.entry.to_search_entry(&request.attributes, request.types_only))
			.collect();

		if let Some(paged) = paged {
			let total = i32::try_from(results.len()).unwrap_or(i32::MAX);
			return match paging.page(results, &paged) {
				Ok((page, cookie)) => {
					let control = PagedResults { size: total, cookie, criticality: false };
					match control.to_control() {
						Ok(control) => Response::search(page, LdapResult::success())
							.with_controls(vec![control]),
						Err(err) => Response::new(
							LdapResult::new(ResultCode::OPERATIONS_ERROR)
								.with_message(err.to_string()),
						),
					}
				}
				Err(code) => {
					Response::new(LdapResult::new(code).with_message("invalid paging cookie"))
				}
			};
		}

		let limit = [usize::try_from(request.size_limit).unwrap_or(0), self.size_limit]
			.into_iter()
			.filter(|limit| *limit > 0)
			.min();
		match limit {
			Some(limit) if results.len() > limit => {
				let mut results = results;
				results.truncate(limit);
				Response::search(results, LdapResult::new(ResultCode::SIZE_LIMIT_EXCEEDED))
			}
			_ => Response::search(results, LdapResult::success()),
		}
	}

	/// The nearest existing entry above normalized `key`.
	fn closest_ancestor(&self, key: &str) -> Option<&Entry> {
		let mut parent = split_dn(key).1;
		while !parent.is_empty() {
			if let Some(at) = self.position(parent) {
				return Some(&self.entries[at].entry);
			}
			parent = split_dn(parent).1;
		}
		None
	}

	/// Add an entry below an existing parent.
	pub fn add(&mut self, request: AddRequest, now: OffsetDateTime) -> LdapResult {
		let key = normalize_dn(&request.dn);
		if key.is_empty() {
			return LdapResult::new(ResultCode::INVALID_DN_SYNTAX);
		}
		if self.position(&key).is_some() {
			return LdapResult::new(ResultCode::ENTRY_ALREADY_EXISTS);
		}
		let parent = split_dn(&key).1;
		if !parent.is_empty() && self.position(parent).is_none() {
			return LdapResult::new(ResultCode::NO_SUCH_OBJECT).with_matched_dn(
				self.closest_ancestor(&key).map(|entry| entry.dn.clone()).unwrap_or_default(),
			);
		}
		let mut entry = Entry::from_attributes(request.dn, request.attributes);
		entry.created(now);
		self.entries.push(Stored { key, entry });
		LdapResult::success()
	}

	/// Delete a leaf entry.
	pub fn delete(&mut self, dn: &str) -> LdapResult {
		let key = normalize_dn(dn);
		let Some(at) = self.position(&key) else {
			return LdapResult::new(ResultCode::NO_SUCH_OBJECT);
		};
		if self.has_children(&key) {
			return LdapResult::new(ResultCode::NOT_ALLOWED_ON_NON_LEAF);
		}
		self.entries.remove(at);
		LdapResult::success()
	}

	/// Apply all changes of a modify request, or none of them.
	pub fn modify(&mut self, request: ModifyRequest, now: OffsetDateTime) -> LdapResult {
		let Some(at) = self.position(&normalize_dn(&request.dn)) else {
			return LdapResult::new(ResultCode::NO_SUCH_OBJECT);
		};
		let mut entry = self.entries[at].entry.clone();
		for change in request.changes {
			let name = change.modification.name;
			let values: Vec<String> = change
				.modification
				.values
				.iter()
				.map(|value| String::from_utf8_lossy(value).into_owned())
				.collect();
			let applied = match change.operation {
				ModifyOperation::Add => entry.add_values(&name, values),
				ModifyOperation::Delete => entry.remove_values(&name, &values),
				ModifyOperation::Replace => {
					entry.set(&name, values);
					Ok(())
				}
			};
			if let Err(code) = applied {
				return LdapResult::new(code).with_message(format!("attribute {name}"));
			}
		}
		entry.modified(now);
		self.entries[at].entry = entry;
		LdapResult::success()
	}

	/// Rename a leaf entry and optionally move it below a new superior.
	pub fn modify_dn(&mut self, request: ModifyDnRequest, now: OffsetDateTime) -> LdapResult {
		let key = normalize_dn(&request.dn);
		let Some(at) = self.position(&key) else {
			return LdapResult::new(ResultCode::NO_SUCH_OBJECT);
		};
		if self.has_children(&key) {
			return LdapResult::new(ResultCode::NOT_ALLOWED_ON_NON_LEAF);
		}
		let Some((rdn_name, rdn_value)) = request.new_rdn.split_once('=') else {
			return LdapResult::new(ResultCode::INVALID_DN_SYNTAX);
		};

		let old_dn = self.entries[at].entry.dn.clone();
		let parent = match &request.new_superior {
			Some(superior) => {
				if !superior.is_empty() && self.position(&normalize_dn(superior)).is_none() {
					return LdapResult::new(ResultCode::NO_SUCH_OBJECT).with_message("new superior");
				}
				superior.clone()
			}
			None => split_dn(&old_dn).1.to_owned(),
		};
		let dn = if parent.is_empty() {
			request.new_rdn.clone()
		} else {
			format!("{},{parent}", request.new_rdn)
		};
		let new_key = normalize_dn(&dn);
		if new_key != key && self.position(&new_key).is_some() {
			return LdapResult::new(ResultCode::ENTRY_ALREADY_EXISTS);
		}

		let mut entry = self.entries[at].entry.clone();
		if request.delete_old_rdn {
			if let Some((old_name, old_value)) = split_dn(&old_dn).0.split_once('=') {
				let old_value = old_value.trim().to_owned();
				if let Err(code) = entry.remove_values(old_name.trim(), &[old_value]) {
					debug!("{old_dn}: keeping attributes, old RDN value not removed: {code}");
				}
			}
		}
		let (rdn_name, rdn_value) = (rdn_name.trim(), rdn_value.trim());
		if !entry.has_value(rdn_name, rdn_value) {
			if let Err(code) = entry.add_values(rdn_name, vec![rdn_value.to_owned()]) {
				debug!("{old_dn}: new RDN value not added: {code}");
			}
		}
		entry.dn = dn;
		entry.modified(now);
		self.entries[at] = Stored { key: new_key, entry };
		LdapResult::success()
	}

	/// Compare an attribute value.
	#[must_use]
	pub fn compare(&self, request: &CompareRequest) -> LdapResult {
		let Some(entry) = self.get(&request.dn) else {
			return LdapResult::new(ResultCode::NO_SUCH_OBJECT);
		};
		if entry.get(&request.attribute).is_none() {
			return LdapResult::new(ResultCode::NO_SUCH_ATTRIBUTE);
		}
		if entry.has_value(&request.attribute, &String::from_utf8_lossy(&request.value)) {
			LdapResult::new(ResultCode::COMPARE_TRUE)
		} else {
			LdapResult::new(ResultCode::COMPARE_FALSE)
		}
	}
}

/// Serves a [`Directory`] whose content can be replaced while running.
#[derive(Debug, Default)]
pub struct DirectoryHandler {
	/// The served content.
	directory: RwLock<Directory>,
}

impl DirectoryHandler {
	/// A handler serving `directory`.
	#[must_use]
	pub fn new(directory: Directory) -> Self {
		Self { directory: RwLock::new(directory) }
	}

	/// Swap in new content.
	pub fn replace(&self, directory: Directory) {
		*self.directory.write() = directory;
	}

	/// A copy of the current content.
	#[must_use]
	pub fn snapshot(&self) -> Directory {
		self.directory.read().clone()
	}
}

#[async_trait]
impl Handler for DirectoryHandler {
	async fn serve(&self, ctx: &mut Context, request: Request) -> Response {
		let now = OffsetDateTime::now_utc();
		debug!("{} from {} (message {})", request.operation.name(), ctx.peer, request.message_id);
		match request.operation {
			Operation::BindRequest(bind) => self.directory.read().bind(&bind).into(),
			Operation::SearchRequest(search) => {
				self.directory.read().search(&mut ctx.paging, &search, &request.controls)
			}
			Operation::AddRequest(add) => self.directory.write().add(add, now).into(),
			Operation::DeleteRequest(dn) => self.directory.write().delete(&dn).into(),
			Operation::ModifyRequest(modify) => self.directory.write().modify(modify, now).into(),
			Operation::ModifyDnRequest(modify) => {
				self.directory.write().modify_dn(modify, now).into()
			}
			Operation::CompareRequest(compare) => self.directory.read().compare(&compare).into(),
			other => Response::new(
				LdapResult::new(ResultCode::PROTOCOL_ERROR)
					.with_message(format!("{} is not handled", other.name())),
			),
		}
	}
}

/// A running directory server.
#[derive(Debug)]
struct Running {
	/// Content of the server.
	handler: Arc<DirectoryHandler>,
	/// Address the server listens on.
	addr: SocketAddr,
}

/// The directory servers started from configuration documents, one per
/// listen address.
#[derive(Debug)]
pub struct Directories {
	/// Running servers by configured host.
	servers: Mutex<HashMap<String, Running>>,
	/// Runs the servers.
	pool: Pool,
}

impl Directories {
	/// No servers yet.
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::new(Self { servers: Mutex::new(HashMap::new()), pool: Pool::new() })
	}

	/// Serve every directory document the watcher loads.
	pub fn attach(self: &Arc<Self>, watcher: &Watcher) {
		let this: Weak<Self> = Arc::downgrade(self);
		watcher.on_document::<DirectoryConfig, _>(move |config, document| {
			if let Some(this) = this.upgrade() {
				if let Err(err) = this.apply(document) {
					error!("Failed to serve directory of {}: {err}", config.url());
				}
			}
		});
	}

	/// Start a server for `document`, or replace the content of the one
	/// already listening on its host. Must be called within a Tokio runtime.
	pub fn apply(&self, document: &DirectoryConfig) -> Result<(), Error> {
		let directory = Directory::from_config(document);
		let mut servers = self.servers.lock();
		if let Some(running) = servers.get(&document.host) {
			info!("Updating directory on {} with {} entries", running.addr, directory.len());
			running.handler.replace(directory);
			return Ok(());
		}

		let listener = StdListener::bind(listen_address(&document.host))?;
		listener.set_nonblocking(true)?;
		let listener = tokio::net::TcpListener::from_std(listener)?;
		let addr = listener.local_addr()?;
		let name = &document.info.name;
		info!("Serving directory {name:?} with {} entries on {addr}", directory.len());

		let handler = Arc::new(DirectoryHandler::new(directory));
		let server = Arc::new(Server::new(handler.clone()));
		self.pool
			.go(move |token| async move {
				tokio::select! {
					result = server.serve(listener) => match result {
						Err(Error::ServerClosed) | Ok(()) => {}
						Err(err) => error!("LDAP server on {addr} stopped: {err}"),
					},
					() = token.cancelled() => {}
				}
				server.close().await;
			})
			.map_err(|_| Error::ServerClosed)?;
		servers.insert(document.host.clone(), Running { handler, addr });
		Ok(())
	}

	/// Content handler of the server configured for `host`.
	#[must_use]
	pub fn handler(&self, host: &str) -> Option<Arc<DirectoryHandler>> {
		self.servers.lock().get(host).map(|running| running.handler.clone())
	}

	/// Bound address of the server configured for `host`.
	#[must_use]
	pub fn local_addr(&self, host: &str) -> Option<SocketAddr> {
		self.servers.lock().get(host).map(|running| running.addr)
	}

	/// Stop every server.
	pub async fn close(&self) {
		self.pool.stop().await;
		self.servers.lock().clear();
	}
}

/// Socket address for a configured host; `:port` binds all interfaces.
fn listen_address(host: &str) -> String {
	match host.strip_prefix(':') {
		Some(port) => format!("0.0.0.0:{port}"),
		None => host.to_owned(),
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use time::macros::datetime;

	use super::{listen_address, Directory, DirectoryConfig};
	use crate::ldap::{
		control::{Control, PagedResults},
		message::{
			AddRequest, Authentication, BindRequest, Change, CompareRequest, ModifyDnRequest,
			ModifyOperation, ModifyRequest, PartialAttribute, Scope, SearchRequest,
		},
		paging::PagingContext,
		result::ResultCode,
	};

	const DOCUMENT: &str = "
ldap: 1
info:
  name: Example
host: 127.0.0.1:0
sizeLimit: 3
rootDse:
  vendorName: mimic
entries:
  dc=example,dc=com:
    objectClass: [top, domain]
    dc: example
  ou=people,dc=example,dc=com:
    objectClass: organizationalUnit
    ou: people
  cn=alice,ou=people,dc=example,dc=com:
    objectClass: person
    cn: alice
    userPassword: secret
  cn=bob,ou=people,dc=example,dc=com:
    objectClass: person
    cn: bob
    uidNumber: 1002
  cn=carol,ou=people,dc=example,dc=com:
    objectClass: person
    cn: carol
";

	fn directory() -> Directory {
		let config: DirectoryConfig = serde_yaml::from_str(DOCUMENT).unwrap();
		assert_eq!(config.ldap, "1");
		Directory::from_config(&config)
	}

	fn search(
		directory: &Directory,
		base: &str,
		scope: Scope,
		filter: &str,
	) -> (ResultCode, Vec<String>) {
		let request = SearchRequest::new(base, scope, filter).unwrap();
		let response = directory.search(&mut PagingContext::new(), &request, &[]);
		(response.result.code, response.entries.into_iter().map(|entry| entry.dn).collect())
	}

	#[test]
	fn binds() {
		let directory = directory();
		let bind =
			|name: &str, password: &str| directory.bind(&BindRequest::simple(name, password)).code;
		assert_eq!(bind("", ""), ResultCode::SUCCESS);
		assert_eq!(bind("cn=alice,ou=people,dc=example,dc=com", "secret"), ResultCode::SUCCESS);
		assert_eq!(
			bind("cn=alice,ou=people,dc=example,dc=com", "wrong"),
			ResultCode::INVALID_CREDENTIALS
		);
		assert_eq!(bind("cn=bob,ou=people,dc=example,dc=com", "anything"), ResultCode::SUCCESS);
		assert_eq!(bind("cn=nobody,dc=example,dc=com", "x"), ResultCode::INVALID_CREDENTIALS);

		let sasl = BindRequest {
			version: 3,
			name: String::new(),
			authentication: Authentication::Sasl {
				mechanism: "PLAIN".to_owned(),
				credentials: None,
			},
		};
		assert_eq!(directory.bind(&sasl).code, ResultCode::AUTH_METHOD_NOT_SUPPORTED);
	}

	#[test]
	fn searches_by_scope() {
		let directory = directory();
		let people = "ou=people,dc=example,dc=com";
		assert_eq!(
			search(&directory, people, Scope::BaseObject, "(objectClass=*)"),
			(ResultCode::SUCCESS, vec![people.to_owned()])
		);
		assert_eq!(
			search(&directory, people, Scope::SingleLevel, "(cn=b*)").1,
			["cn=bob,ou=people,dc=example,dc=com"]
		);
		let either = "(|(dc=example)(cn=alice))";
		assert_eq!(
			search(&directory, "DC=Example, DC=Com", Scope::WholeSubtree, either).1,
			["cn=alice,ou=people,dc=example,dc=com", "dc=example,dc=com"]
		);
		assert_eq!(
			search(&directory, "dc=nowhere", Scope::WholeSubtree, "(cn=*)").0,
			ResultCode::NO_SUCH_OBJECT
		);

		let (code, entries) =
			search(&directory, "dc=example,dc=com", Scope::WholeSubtree, "(objectClass=*)");
		assert_eq!((code, entries.len()), (ResultCode::SIZE_LIMIT_EXCEEDED, 3));
	}

	#[test]
	fn root_dse() {
		let directory = directory();
		let request = SearchRequest::new("", Scope::BaseObject, "(objectClass=*)").unwrap();
		let response = directory.search(&mut PagingContext::new(), &request, &[]);
		let root = &response.entries[0];
		assert_eq!(root.dn, "");
		assert_eq!(root.values("namingContexts"), ["dc=example,dc=com"]);
		assert_eq!(root.first("supportedControl"), Some(PagedResults::OID));
		assert_eq!(root.first("vendorName"), Some("mimic"));
	}

	#[test]
	fn pages_and_rejects_unknown_critical_controls() {
		let directory = directory();
		let mut paging = PagingContext::new();
		let people = "ou=people,dc=example,dc=com";
		let request = SearchRequest::new(people, Scope::SingleLevel, "(cn=*)").unwrap();

		let control = PagedResults::new(2, Vec::new()).to_control().unwrap();
		let first = directory.search(&mut paging, &request, &[control]);
		assert_eq!(first.entries.len(), 2);
		let cookie = PagedResults::find(&first.controls).unwrap().unwrap().cookie;
		assert!(!cookie.is_empty());

		let control = PagedResults::new(2, cookie).to_control().unwrap();
		let second = directory.search(&mut paging, &request, &[control]);
		assert_eq!(second.entries.len(), 1);
		assert!(PagedResults::find(&second.controls).unwrap().unwrap().cookie.is_empty());

		let critical = Control { oid: "1.2.3.4".to_owned(), criticality: true, value: None };
		let rejected = directory.search(&mut paging, &request, &[critical]);
		assert_eq!(rejected.result.code, ResultCode::UNAVAILABLE_CRITICAL_EXTENSION);
	}

	#[test]
	fn updates_entries() {
		let mut directory = directory();
		let now = datetime!(2024-01-02 03:04:05 UTC);
		let add = |dn: &str| AddRequest {
			dn: dn.to_owned(),
			attributes: vec![PartialAttribute::new("cn", ["dave"])],
		};

		let dave = "cn=dave,ou=people,dc=example,dc=com";
		assert_eq!(directory.add(add(dave), now).code, ResultCode::SUCCESS);
		assert_eq!(directory.add(add(dave), now).code, ResultCode::ENTRY_ALREADY_EXISTS);
		let ghost = "cn=dave,ou=ghosts,dc=example,dc=com";
		assert_eq!(directory.add(add(ghost), now).code, ResultCode::NO_SUCH_OBJECT);
		let dave = directory.get("cn=dave,ou=people,dc=example,dc=com").unwrap();
		assert_eq!(dave.first("createTimestamp"), Some("20240102030405Z"));

		let modify = ModifyRequest {
			dn: "cn=dave,ou=people,dc=example,dc=com".to_owned(),
			changes: vec![
				Change {
					operation: ModifyOperation::Add,
					modification: PartialAttribute::new("mail", ["d@example.com"]),
				},
				Change {
					operation: ModifyOperation::Replace,
					modification: PartialAttribute::new("sn", ["Smith"]),
				},
			],
		};
		assert_eq!(directory.modify(modify, now).code, ResultCode::SUCCESS);
		let missing = ModifyRequest {
			dn: "cn=dave,ou=people,dc=example,dc=com".to_owned(),
			changes: vec![
				Change {
					operation: ModifyOperation::Replace,
					modification: PartialAttribute::new("sn", ["Jones"]),
				},
				Change {
					operation: ModifyOperation::Delete,
					modification: PartialAttribute::new("telephoneNumber", Vec::<String>::new()),
				},
			],
		};
		assert_eq!(directory.modify(missing, now).code, ResultCode::NO_SUCH_ATTRIBUTE);
		let dave = directory.get("cn=dave,ou=people,dc=example,dc=com").unwrap();
		assert_eq!((dave.first("mail"), dave.first("sn")), (Some("d@example.com"), Some("Smith")));

		let rename = ModifyDnRequest {
			dn: "cn=dave,ou=people,dc=example,dc=com".to_owned(),
			new_rdn: "cn=david".to_owned(),
			delete_old_rdn: true,
			new_superior: None,
		};
		assert_eq!(directory.modify_dn(rename, now).code, ResultCode::SUCCESS);
		let david = directory.get("cn=david,ou=people,dc=example,dc=com").unwrap();
		assert_eq!(david.values("cn"), ["david"]);

		let people = "ou=people,dc=example,dc=com";
		assert_eq!(directory.delete(people).code, ResultCode::NOT_ALLOWED_ON_NON_LEAF);
		let david = "cn=david,ou=people,dc=example,dc=com";
		assert_eq!(directory.delete(david).code, ResultCode::SUCCESS);
		assert_eq!(directory.delete(david).code, ResultCode::NO_SUCH_OBJECT);
	}

	#[test]
	fn rename_tolerates_missing_old_rdn_value() {
		let mut directory = directory();
		let now = datetime!(2024-01-01 0:00 UTC);
		let carol = "cn=carol,ou=people,dc=example,dc=com";
		let replace = ModifyRequest {
			dn: carol.to_owned(),
			changes: vec![Change {
				operation: ModifyOperation::Replace,
				modification: PartialAttribute::new("cn", ["caroline"]),
			}],
		};
		assert_eq!(directory.modify(replace, now).code, ResultCode::SUCCESS);

		let rename = ModifyDnRequest {
			dn: carol.to_owned(),
			new_rdn: "cn=carrie".to_owned(),
			delete_old_rdn: true,
			new_superior: None,
		};
		assert_eq!(directory.modify_dn(rename, now).code, ResultCode::SUCCESS);
		let carrie = directory.get("cn=carrie,ou=people,dc=example,dc=com").unwrap();
		assert_eq!(carrie.values("cn"), ["caroline", "carrie"]);
		assert!(directory.get(carol).is_none());
	}

	#[test]
	fn compares() {
		let directory = directory();
		let compare = |attribute: &str, value: &str| {
			directory
				.compare(&CompareRequest {
					dn: "cn=bob,ou=people,dc=example,dc=com".to_owned(),
					attribute: attribute.to_owned(),
					value: value.as_bytes().to_vec(),
				})
				.code
		};
		assert_eq!(compare("cn", "bob"), ResultCode::COMPARE_TRUE);
		assert_eq!(compare("cn", "bar"), ResultCode::COMPARE_FALSE);
		assert_eq!(compare("mail", "bob"), ResultCode::NO_SUCH_ATTRIBUTE);
	}

	#[test]
	fn bare_port_listens_everywhere() {
		assert_eq!(listen_address(":389"), "0.0.0.0:389");
		assert_eq!(listen_address("127.0.0.1:1389"), "127.0.0.1:1389");
	}
}
