//! The in-memory record of one configuration document.
use std::{
	cell::RefCell,
	fmt,
	sync::{Arc, Weak},
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use url::Url;

use super::{url as location, Data, Shape};

/// Callback fired after a config's data has been updated.
pub type Listener = Arc<dyn Fn(&Config) + Send + Sync>;

thread_local! {
	/// Addresses of the configs whose listeners run on this thread.
	static NOTIFYING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a config as notifying on this thread until dropped.
struct Notifying(usize);

impl Notifying {
	/// Mark `config`, or `None` when this thread is already notifying it.
	fn enter(config: &Config) -> Option<Self> {
		let address = std::ptr::from_ref(config) as usize;
		NOTIFYING.with_borrow_mut(|active| {
			if active.contains(&address) {
				return None;
			}
			active.push(address);
			Some(Self(address))
		})
	}
}

impl Drop for Notifying {
	fn drop(&mut self) {
		NOTIFYING.with_borrow_mut(|active| active.retain(|address| *address != self.0));
	}
}

/// Content fingerprint of a raw payload.
#[must_use]
pub fn checksum(raw: &[u8]) -> Vec<u8> {
	Sha256::digest(raw).to_vec()
}

/// Where a config came from.
///
/// Providers that delegate to another provider wrap the inner descriptor:
/// a file surfaced by the git provider is described as `git` wrapping
/// `file`. The innermost descriptor identifies the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigInfo {
	/// Name of the emitting provider.
	pub provider: String,
	/// Location as seen by that provider.
	pub url: Url,
	/// When this revision was observed.
	pub time: OffsetDateTime,
	/// The descriptor this one wraps.
	pub inner: Option<Box<ConfigInfo>>,
}

impl ConfigInfo {
	/// A descriptor observed now.
	#[must_use]
	pub fn new(provider: impl Into<String>, url: Url) -> Self {
		Self { provider: provider.into(), url, time: OffsetDateTime::now_utc(), inner: None }
	}

	/// Wrap this descriptor into an outer one.
	#[must_use]
	pub fn wrap(self, provider: impl Into<String>, url: Url) -> Self {
		let time = self.time;
		Self { provider: provider.into(), url, time, inner: Some(Box::new(self)) }
	}

	/// The innermost descriptor.
	#[must_use]
	pub fn kernel(&self) -> &ConfigInfo {
		let mut info = self;
		while let Some(inner) = &info.inner {
			info = inner;
		}
		info
	}

	/// The URL identifying the document.
	#[must_use]
	pub fn document_url(&self) -> &Url {
		&self.kernel().url
	}

	/// Identity key of the document.
	#[must_use]
	pub fn key(&self) -> String {
		location::key(self.document_url())
	}
}

impl fmt::Display for ConfigInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.inner {
			Some(inner) => write!(f, "{} ({}) via {inner}", self.url, self.provider),
			None => write!(f, "{} ({})", self.url, self.provider),
		}
	}
}

/// How raw bytes are turned into [`Data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseMode {
	/// Typed documents through the registry; unrecognized structured
	/// documents stay without data.
	#[default]
	Default,
	/// Like `Default`, but unrecognized structured documents become
	/// [`Data::Value`].
	Any,
	/// Never decode, always [`Data::Text`].
	Plaintext,
}

/// The mutable per-revision part of a config.
#[derive(Debug)]
pub(crate) struct Revision {
	/// Origin of this revision.
	pub(crate) info: ConfigInfo,
	/// Unparsed payload.
	pub(crate) raw: Bytes,
	/// Fingerprint of `raw`.
	pub(crate) checksum: Vec<u8>,
	/// Parsed payload.
	pub(crate) data: Option<Arc<Data>>,
}

/// One configuration document: raw bytes, parsed data, fingerprint, and
/// the keyed set of listeners interested in its changes.
pub struct Config {
	/// Identity key, the normalized URL without fragment.
	key: String,
	/// Parse behavior fixed at creation.
	pub(crate) parse_mode: ParseMode,
	/// Destination shape seeded at creation.
	pub(crate) shape: Option<Shape>,
	/// Current revision.
	pub(crate) revision: RwLock<Revision>,
	/// Serializes parsing of this config.
	pub(crate) parse_lock: Mutex<()>,
	/// Change callbacks by key, in registration order.
	listeners: Mutex<Vec<(String, Listener)>>,
	/// Handle to the owning `Arc`, for parent listeners.
	this: Weak<Config>,
}

impl Config {
	/// Create a config for a raw payload.
	#[must_use]
	pub fn new(info: ConfigInfo, raw: impl Into<Bytes>) -> Arc<Self> {
		ReadOptions::new().with_raw(raw).create(info)
	}

	/// Identity key of this config.
	#[must_use]
	pub fn key(&self) -> &str {
		&self.key
	}

	/// Origin of the current revision.
	#[must_use]
	pub fn info(&self) -> ConfigInfo {
		self.revision.read().info.clone()
	}

	/// The URL identifying the document.
	#[must_use]
	pub fn url(&self) -> Url {
		self.revision.read().info.document_url().clone()
	}

	/// Unparsed payload of the current revision.
	#[must_use]
	pub fn raw(&self) -> Bytes {
		self.revision.read().raw.clone()
	}

	/// Fingerprint of the current revision.
	#[must_use]
	pub fn checksum(&self) -> Vec<u8> {
		self.revision.read().checksum.clone()
	}

	/// Parsed payload of the current revision.
	#[must_use]
	pub fn data(&self) -> Option<Arc<Data>> {
		self.revision.read().data.clone()
	}

	/// Parse behavior of this config.
	#[must_use]
	pub fn parse_mode(&self) -> ParseMode {
		self.parse_mode
	}

	/// Replace the raw payload with a new revision. Returns `false`, leaving
	/// the config untouched, when the fingerprint did not change.
	pub fn update(&self, info: ConfigInfo, raw: impl Into<Bytes>) -> bool {
		let raw = raw.into();
		let checksum = checksum(&raw);
		let mut revision = self.revision.write();
		if revision.checksum == checksum {
			return false;
		}
		revision.info = info;
		revision.raw = raw;
		revision.checksum = checksum;
		true
	}

	/// Replace the parsed payload.
	pub(crate) fn set_data(&self, data: Option<Data>) {
		self.revision.write().data = data.map(Arc::new);
	}

	/// Add a listener, replacing any listener previously added under `key`.
	pub fn add_listener(&self, key: impl Into<String>, listener: Listener) {
		let key = key.into();
		let mut listeners = self.listeners.lock();
		match listeners.iter_mut().find(|(k, _)| *k == key) {
			Some(slot) => slot.1 = listener,
			None => listeners.push((key, listener)),
		}
	}

	/// Remove the listener registered under `key`.
	pub fn remove_listener(&self, key: &str) {
		self.listeners.lock().retain(|(k, _)| k != key);
	}

	/// Keys of all registered listeners, in registration order.
	#[must_use]
	pub fn listener_keys(&self) -> Vec<String> {
		self.listeners.lock().iter().map(|(k, _)| k.clone()).collect()
	}

	/// Drop every listener.
	pub fn clear_listeners(&self) {
		self.listeners.lock().clear();
	}

	/// Fire every listener in registration order.
	///
	/// Listeners run without any lock of this config held. A notification
	/// reaching a config that is already notifying on the same thread, i.e.
	/// through a reference cycle, is dropped.
	pub fn changed(&self) {
		let Some(_notifying) = Notifying::enter(self) else {
			return;
		};
		let listeners: Vec<Listener> =
			self.listeners.lock().iter().map(|(_, listener)| listener.clone()).collect();
		for listener in listeners {
			listener(self);
		}
	}

	/// A weak handle to this config.
	#[must_use]
	pub fn downgrade(&self) -> Weak<Config> {
		self.this.clone()
	}
}

impl fmt::Debug for Config {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let revision = self.revision.read();
		f.debug_struct("Config")
			.field("key", &self.key)
			.field("provider", &revision.info.provider)
			.field("parse_mode", &self.parse_mode)
			.field("checksum", &hex::encode(&revision.checksum))
			.field("data", &revision.data)
			.field("listeners", &self.listener_keys())
			.finish_non_exhaustive()
	}
}

/// Options for [`Reader::read`](super::Reader::read).
///
/// Two families: the seed (raw payload, data, shape, checksum, parse mode)
/// only shapes a config being created, while listeners are attached on
/// every read.
#[derive(Clone, Default)]
pub struct ReadOptions {
	/// Initial raw payload.
	raw: Option<Bytes>,
	/// Initial parsed payload.
	data: Option<Data>,
	/// Destination shape for decoding.
	shape: Option<Shape>,
	/// Initial fingerprint.
	checksum: Option<Vec<u8>>,
	/// Parse behavior.
	mode: ParseMode,
	/// Listeners to attach.
	listeners: Vec<(String, Listener)>,
}

impl ReadOptions {
	/// No options.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed the raw payload.
	#[must_use]
	pub fn with_raw(mut self, raw: impl Into<Bytes>) -> Self {
		self.raw = Some(raw.into());
		self
	}

	/// Seed the parsed payload. A typed document also fixes the shape later
	/// revisions decode into.
	#[must_use]
	pub fn with_data(mut self, data: Data) -> Self {
		if let Data::Document(doc) = &data {
			self.shape = Some(doc.shape());
		}
		self.data = Some(data);
		self
	}

	/// Decode into the given document shape instead of consulting the
	/// registry.
	#[must_use]
	pub fn with_shape(mut self, shape: Shape) -> Self {
		self.shape = Some(shape);
		self
	}

	/// Seed the fingerprint.
	#[must_use]
	pub fn with_checksum(mut self, checksum: Vec<u8>) -> Self {
		self.checksum = Some(checksum);
		self
	}

	/// Notify `parent` whenever the read config changes. Keyed by the
	/// parent's identity so a parent is attached at most once.
	#[must_use]
	pub fn with_parent(self, parent: &Config) -> Self {
		let weak = parent.downgrade();
		let key = parent.key().to_owned();
		self.with_listener(
			key,
			Arc::new(move |_: &Config| {
				if let Some(parent) = weak.upgrade() {
					parent.changed();
				}
			}),
		)
	}

	/// Attach a listener under `key`.
	#[must_use]
	pub fn with_listener(mut self, key: impl Into<String>, listener: Listener) -> Self {
		self.listeners.push((key.into(), listener));
		self
	}

	/// Decode unrecognized structured documents into [`Data::Value`].
	#[must_use]
	pub fn allow_parsing_any(mut self) -> Self {
		self.mode = ParseMode::Any;
		self
	}

	/// Never decode, keep the payload as text.
	#[must_use]
	pub fn as_plaintext(mut self) -> Self {
		self.mode = ParseMode::Plaintext;
		self
	}

	/// Build a new config from the seed and attach the listeners.
	#[must_use]
	pub fn create(self, info: ConfigInfo) -> Arc<Config> {
		let raw = self.raw.unwrap_or_default();
		let checksum = self.checksum.unwrap_or_else(|| checksum(&raw));
		let key = info.key();
		let config = Arc::new_cyclic(|this| Config {
			key,
			parse_mode: self.mode,
			shape: self.shape,
			revision: RwLock::new(Revision { info, raw, checksum, data: self.data.map(Arc::new) }),
			parse_lock: Mutex::new(()),
			listeners: Mutex::new(Vec::new()),
			this: this.clone(),
		});
		for (key, listener) in self.listeners {
			config.add_listener(key, listener);
		}
		config
	}

	/// Apply the options that also affect an existing config.
	pub fn attach(self, config: &Config) {
		for (key, listener) in self.listeners {
			config.add_listener(key, listener);
		}
	}
}

impl fmt::Debug for ReadOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ReadOptions")
			.field("raw", &self.raw.as_ref().map(Bytes::len))
			.field("shape", &self.shape)
			.field("mode", &self.mode)
			.field("listeners", &self.listeners.iter().map(|(k, _)| k).collect::<Vec<_>>())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc,
		},
		thread,
		time::Duration,
	};

	use url::Url;

	use super::{Config, ConfigInfo, ReadOptions};

	fn info(path: &str) -> ConfigInfo {
		ConfigInfo::new("file", Url::parse(&format!("file://{path}")).unwrap())
	}

	#[test]
	fn listener_keys_are_unique() {
		let config = Config::new(info("/a.yml"), "a: 1");
		let calls = Arc::new(AtomicUsize::new(0));
		for _ in 0..3 {
			let calls = calls.clone();
			config.add_listener(
				"parent",
				Arc::new(move |_: &Config| {
					calls.fetch_add(1, Ordering::SeqCst);
				}),
			);
		}
		assert_eq!(config.listener_keys(), ["parent"]);
		config.changed();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn update_ignores_identical_payload() {
		let config = Config::new(info("/a.yml"), "a: 1");
		let before = config.checksum();
		assert!(!config.update(info("/a.yml"), "a: 1"));
		assert!(config.update(info("/a.yml"), "a: 2"));
		assert_ne!(config.checksum(), before);
		assert_eq!(&config.raw()[..], b"a: 2");
	}

	#[test]
	fn parent_is_notified_once_through_cycles() {
		let a = Config::new(info("/a.yml"), "");
		let b = Config::new(info("/b.yml"), "");
		ReadOptions::new().with_parent(&a).attach(&b);
		ReadOptions::new().with_parent(&b).attach(&a);

		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		a.add_listener(
			"count",
			Arc::new(move |_: &Config| {
				counter.fetch_add(1, Ordering::SeqCst);
			}),
		);
		b.changed();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(b.listener_keys(), ["file:///a.yml"]);
	}

	#[test]
	fn concurrent_notifications_are_all_delivered() {
		let config = Config::new(info("/a.yml"), "");
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		config.add_listener(
			"slow",
			Arc::new(move |_: &Config| {
				counter.fetch_add(1, Ordering::SeqCst);
				thread::sleep(Duration::from_millis(200));
			}),
		);
		thread::scope(|scope| {
			scope.spawn(|| config.changed());
			scope.spawn(|| config.changed());
		});
		assert_eq!(calls.load(Ordering::SeqCst), 2);
		config.changed();
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn wrapped_info_is_identified_by_kernel() {
		let file = info("/tmp/clone/api.yml");
		let git = file.clone().wrap("git", Url::parse("https://example.com/repo.git").unwrap());
		assert_eq!(git.key(), "file:///tmp/clone/api.yml");
		assert_eq!(git.kernel(), &file);
	}
}
