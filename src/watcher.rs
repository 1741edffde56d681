//! Composition of providers into one stream of parsed configs.
//!
//! The [`Watcher`] owns every [`Config`] it has seen, keyed by document URL.
//! Provider events update the matching config, reparse it with the watcher
//! as [`Reader`] so references can load sibling documents, and notify the
//! config's listeners. One of those listeners belongs to the watcher itself
//! and dispatches to the callbacks registered through
//! [`Watcher::add_listener`] and [`Watcher::on_document`]. When a change is
//! propagated from a referenced document, that listener reparses the
//! referencing config first so its resolved values are current.
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Weak,
	},
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
	dynamic::{self, url as location, Config, Document, Listener, ReadOptions, Reader, Registry},
	pool::Pool,
	provider::{self, ConfigEvent, FileProvider, HttpProvider, Provider},
};

/// Key of the listener the watcher installs on every config it owns.
const WATCHER_LISTENER: &str = "mimic:watcher";

/// Capacity of the channel between providers and the watcher.
const EVENT_BUFFER: usize = 100;

/// A config owned by the watcher.
#[derive(Debug)]
struct Entry {
	/// The record.
	config: Arc<Config>,
	/// Set while the current revision has been parsed but not yet
	/// dispatched, so the watcher listener does not parse it again.
	fresh: Arc<AtomicBool>,
	/// Whether a provider has emitted this document. Configs first loaded
	/// as reference targets are dispatched on their first event even when
	/// the payload did not change.
	emitted: bool,
}

/// What an event requires of the watcher.
enum Step {
	/// Parse the new revision and notify listeners.
	Parse(Arc<Config>, Arc<AtomicBool>),
	/// Dispatch an unchanged config seen for the first time.
	Announce(Arc<Config>),
	/// Nothing, the payload is unchanged.
	Drop,
}

/// Drives providers and dispatches parsed configs to listeners.
pub struct Watcher {
	/// Recognizes typed documents.
	registry: Registry,
	/// Sources of events.
	providers: Vec<Arc<dyn Provider>>,
	/// Serves reads of `file:` URLs.
	file: Arc<dyn Provider>,
	/// Serves reads of `http:` and `https:` URLs.
	http: Arc<dyn Provider>,
	/// Known configs by key.
	configs: Mutex<HashMap<String, Entry>>,
	/// Callbacks for every dispatched config.
	listeners: RwLock<Vec<Listener>>,
	/// Runs the provider loops and the event loop.
	pool: Pool,
	/// Handle to the owning `Arc`, captured by config listeners.
	this: Weak<Watcher>,
}

impl Watcher {
	/// Create a watcher over `providers`. Reads of `file:` and `http(s):` URLs
	/// go to the provider of that name, or a default one.
	#[must_use]
	pub fn new(registry: Registry, providers: Vec<Arc<dyn Provider>>) -> Arc<Self> {
		let named = |name: &str| providers.iter().find(|provider| provider.name() == name).cloned();
		let file = named("file").unwrap_or_else(|| Arc::new(FileProvider::default()));
		let http = named("http").unwrap_or_else(|| Arc::new(HttpProvider::default()));
		Arc::new_cyclic(|this| Self {
			registry,
			providers,
			file,
			http,
			configs: Mutex::new(HashMap::new()),
			listeners: RwLock::new(Vec::new()),
			pool: Pool::new(),
			this: this.clone(),
		})
	}

	/// Call `listener` for every dispatched config.
	pub fn add_listener(&self, listener: Listener) {
		self.listeners.write().push(listener);
	}

	/// Call `listener` for every dispatched config holding a `T` document.
	pub fn on_document<T, F>(&self, listener: F)
	where
		T: Document,
		F: Fn(&Config, &T) + Send + Sync + 'static,
	{
		self.add_listener(Arc::new(move |config: &Config| {
			if let Some(data) = config.data() {
				if let Some(document) = data.document::<T>() {
					listener(config, document);
				}
			}
		}));
	}

	/// The config of a document, if the watcher knows it.
	#[must_use]
	pub fn config(&self, url: &Url) -> Option<Arc<Config>> {
		self.configs.lock().get(&location::key(url)).map(|entry| entry.config.clone())
	}

	/// Start every provider and the event loop. Must be called from within a
	/// Tokio runtime.
	pub fn start(&self) -> Result<(), provider::Error> {
		let (events, mut rx) = mpsc::channel::<ConfigEvent>(EVENT_BUFFER);
		for provider in &self.providers {
			provider.start(events.clone(), &self.pool)?;
			debug!("started {} provider", provider.name());
		}
		drop(events);

		let this = self.this.clone();
		self.pool.go(move |token| async move {
			loop {
				let event = tokio::select! {
					() = token.cancelled() => return,
					event = rx.recv() => match event {
						Some(event) => event,
						None => return,
					},
				};
				let Some(watcher) = this.upgrade() else {
					return;
				};
				if let Err(err) = tokio::task::spawn_blocking(move || watcher.update(event)).await {
					error!("processing config event failed: {err}");
				}
			}
		})?;
		info!("watching {} providers", self.providers.len());
		Ok(())
	}

	/// Stop every provider and the event loop, then release every config
	/// and listener.
	pub async fn close(&self) {
		self.pool.stop().await;
		let configs: Vec<Entry> = self.configs.lock().drain().map(|(_, entry)| entry).collect();
		for entry in &configs {
			entry.config.clear_listeners();
		}
		self.listeners.write().clear();
		debug!("released {} configs", configs.len());
	}

	/// Apply one provider event. Blocks on parsing.
	pub fn update(&self, event: ConfigEvent) {
		let key = event.info.key();
		let step = {
			let mut configs = self.configs.lock();
			match configs.get_mut(&key) {
				Some(entry) => {
					let changed = entry.config.update(event.info, event.raw);
					let first = !entry.emitted;
					entry.emitted = true;
					match (changed, first) {
						(true, _) => Step::Parse(entry.config.clone(), entry.fresh.clone()),
						// Already parsed as a reference target, only announce it.
						(false, true) => Step::Announce(entry.config.clone()),
						(false, false) => Step::Drop,
					}
				}
				None => {
					let config = ReadOptions::new().with_raw(event.raw).create(event.info);
					let fresh = self.own(&config);
					configs.insert(
						key.clone(),
						Entry { config: config.clone(), fresh: fresh.clone(), emitted: true },
					);
					Step::Parse(config, fresh)
				}
			}
		};

		match step {
			Step::Parse(config, fresh) => {
				if let Err(err) = config.parse(self) {
					warn!("{err}");
					return;
				}
				debug!("{key} updated");
				fresh.store(true, Ordering::Release);
				config.changed();
			}
			Step::Announce(config) => self.dispatch(&config),
			Step::Drop => debug!("{key} unchanged"),
		}
	}

	/// Install the watcher listener on a new config.
	fn own(&self, config: &Config) -> Arc<AtomicBool> {
		let fresh = Arc::new(AtomicBool::new(false));
		let this = self.this.clone();
		let parsed = fresh.clone();
		config.add_listener(
			WATCHER_LISTENER,
			Arc::new(move |config: &Config| {
				let Some(watcher) = this.upgrade() else {
					return;
				};
				if !parsed.swap(false, Ordering::AcqRel) {
					// Reached through a referenced document: resolve again.
					if let Err(err) = config.parse(&*watcher) {
						warn!("{err}");
						return;
					}
				}
				watcher.dispatch(config);
			}),
		);
		fresh
	}

	/// Run the registered callbacks for `config`.
	fn dispatch(&self, config: &Config) {
		let listeners = self.listeners.read().clone();
		for listener in listeners {
			listener(config);
		}
	}
}

impl Reader for Watcher {
	fn read(&self, url: &Url, options: ReadOptions) -> Result<Arc<Config>, dynamic::Error> {
		let key = location::key(url);
		let cached = self.configs.lock().get(&key).map(|entry| entry.config.clone());
		if let Some(config) = cached {
			options.attach(&config);
			return Ok(config);
		}

		let provider = match url.scheme() {
			"file" => &self.file,
			"http" | "https" => &self.http,
			scheme => return Err(dynamic::Error::UnsupportedScheme(scheme.to_owned())),
		};
		let mut document = url.clone();
		document.set_fragment(None);
		let event = provider
			.read(&document)
			.map_err(|err| dynamic::Error::Read { url: key.clone(), source: Box::new(err) })?;
		let created = options.with_raw(event.raw).create(event.info);

		let config = {
			let mut configs = self.configs.lock();
			if let Some(entry) = configs.get(&key) {
				// Lost a race against another reader or the event loop.
				return Ok(entry.config.clone());
			}
			let fresh = self.own(&created);
			configs.insert(key, Entry { config: created.clone(), fresh, emitted: false });
			created
		};
		config.parse(self)?;
		Ok(config)
	}

	fn registry(&self) -> &Registry {
		&self.registry
	}
}

impl std::fmt::Debug for Watcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Watcher")
			.field("providers", &self.providers)
			.field("configs", &self.configs.lock().keys().collect::<Vec<_>>())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{
		collections::BTreeMap,
		fs,
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc,
		},
		time::Duration,
	};

	use serde::{Deserialize, Serialize};
	use tokio::sync::mpsc;
	use url::Url;

	use super::Watcher;
	use crate::{
		dynamic::{
			Addressable, Config, Document, Error, ReadOptions, Reader, Reference, Registry, Shape,
		},
		provider::{FileConfig, FileProvider, Provider},
	};

	#[derive(Debug, Clone, Serialize, Deserialize)]
	struct Catalog {
		catalog: String,
		#[serde(default)]
		items: BTreeMap<String, Reference<serde_json::Value>>,
	}

	impl Addressable for Catalog {
		fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
			match token {
				"items" => Some(&self.items),
				_ => None,
			}
		}
	}

	impl Document for Catalog {
		fn shape(&self) -> Shape {
			Shape::of::<Self>()
		}

		fn clone_document(&self) -> Box<dyn Document> {
			Box::new(self.clone())
		}

		fn as_addressable(&self) -> &dyn Addressable {
			self
		}

		fn parse(&mut self, config: &Config, reader: &dyn Reader) -> Result<(), Error> {
			for item in self.items.values_mut() {
				item.resolve(config, reader)?;
			}
			Ok(())
		}
	}

	fn watcher(providers: Vec<Arc<dyn Provider>>) -> Arc<Watcher> {
		Watcher::new(Registry::empty().register::<Catalog>("catalog"), providers)
	}

	#[test]
	fn reads_are_memoized() -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		fs::write(dir.path().join("a.yml"), "a: 1")?;
		let url = Url::from_file_path(dir.path().join("a.yml")).unwrap();

		let watcher = watcher(Vec::new());
		let first = watcher.read(&url, ReadOptions::new().allow_parsing_any())?;
		let mut fragment = url.clone();
		fragment.set_fragment(Some("/a"));
		let second = watcher.read(&fragment, ReadOptions::new())?;
		assert!(Arc::ptr_eq(&first, &second));
		assert!(matches!(
			watcher.read(&Url::parse("ftp://example.com/a.yml")?, ReadOptions::new()),
			Err(Error::UnsupportedScheme(scheme)) if scheme == "ftp"
		));
		Ok(())
	}

	#[tokio::test]
	async fn dispatches_changes_and_propagates_references(
	) -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		fs::write(
			dir.path().join("catalog.yml"),
			"catalog: shop\nitems:\n  pen:\n    $ref: items.yml#/pen\n",
		)?;
		fs::write(dir.path().join("items.yml"), "pen:\n  price: 1\n")?;

		let provider: Arc<dyn Provider> =
			Arc::new(FileProvider::new(FileConfig::directory(dir.path())));
		let watcher = watcher(vec![provider]);
		let (tx, mut rx) = mpsc::unbounded_channel();
		let dispatched = Arc::new(AtomicUsize::new(0));
		let counter = dispatched.clone();
		watcher.on_document::<Catalog, _>(move |_, catalog| {
			counter.fetch_add(1, Ordering::SeqCst);
			let price =
				catalog.items.get("pen").and_then(Reference::value).map(|pen| pen["price"].clone());
			let _ = tx.send(price);
		});
		watcher.start()?;

		let price = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await?.unwrap();
		assert_eq!(price, Some(serde_json::json!(1)));

		fs::write(dir.path().join("items.yml"), "pen:\n  price: 2\n")?;
		let price = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await?.unwrap();
		assert_eq!(price, Some(serde_json::json!(2)));

		// Same payload again: no notification.
		let before = dispatched.load(Ordering::SeqCst);
		fs::write(dir.path().join("items.yml"), "pen:\n  price: 2\n")?;
		tokio::time::sleep(Duration::from_secs(3)).await;
		assert_eq!(dispatched.load(Ordering::SeqCst), before);

		watcher.close().await;
		Ok(())
	}

	#[tokio::test]
	async fn close_releases_configs() -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		fs::write(dir.path().join("a.yml"), "catalog: shop\n")?;
		let url = Url::from_file_path(dir.path().join("a.yml")).unwrap();

		let provider: Arc<dyn Provider> =
			Arc::new(FileProvider::new(FileConfig::directory(dir.path())));
		let watcher = watcher(vec![provider]);
		let (tx, mut rx) = mpsc::unbounded_channel();
		watcher.on_document::<Catalog, _>(move |_, catalog| {
			let _ = tx.send(catalog.catalog.clone());
		});
		watcher.start()?;
		let name = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await?.unwrap();
		assert_eq!(name, "shop");

		let config = watcher.config(&url).unwrap();
		assert_eq!(config.listener_keys(), [super::WATCHER_LISTENER]);

		watcher.close().await;
		assert!(watcher.config(&url).is_none());
		assert!(config.listener_keys().is_empty());
		assert_eq!(Arc::strong_count(&config), 1);
		assert!(watcher.listeners.read().is_empty());
		Ok(())
	}
}
