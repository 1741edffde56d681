//! Configuration documents on the local filesystem.
use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	time::Duration,
};

use bytes::Bytes;
use notify::{RecursiveMode, Watcher as _};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
	file_url,
	glob::Pattern,
	ignore::{IgnoreFiles, IGNORE_FILE},
	one_or_many, send, ConfigEvent, Error, Provider,
};
use crate::{
	dynamic::{url as location, ConfigInfo},
	pool::Pool,
};

/// Extensions of files the provider emits.
const EXTENSIONS: [&str; 6] = [".yml", ".yaml", ".json", ".tmpl", ".lua", ".js"];

/// How long filesystem events are collected before being processed.
const COALESCE_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration of the file provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
	/// Single files to load.
	#[serde(alias = "filename", deserialize_with = "one_or_many")]
	pub filenames: Vec<PathBuf>,
	/// Directories to scan recursively.
	#[serde(alias = "directory", deserialize_with = "one_or_many")]
	pub directories: Vec<PathBuf>,
	/// Base name prefixes of skipped files and directories.
	#[serde(alias = "skipPrefix")]
	pub skip_prefixes: Vec<String>,
	/// When not empty, only files matching one of these globs relative to
	/// their root are emitted.
	pub include: Vec<String>,
}

impl Default for FileConfig {
	fn default() -> Self {
		Self {
			filenames: Vec::new(),
			directories: Vec::new(),
			skip_prefixes: vec!["_".to_owned()],
			include: Vec::new(),
		}
	}
}

impl FileConfig {
	/// Scan a single directory.
	#[must_use]
	pub fn directory(path: impl Into<PathBuf>) -> Self {
		Self { directories: vec![path.into()], ..Self::default() }
	}

	/// Load a single file.
	#[must_use]
	pub fn filename(path: impl Into<PathBuf>) -> Self {
		Self { filenames: vec![path.into()], ..Self::default() }
	}
}

/// Emits configuration files from directories and watches them for changes.
#[derive(Debug, Clone, Default)]
pub struct FileProvider {
	/// What to scan.
	config: FileConfig,
}

impl FileProvider {
	/// Create a provider.
	#[must_use]
	pub fn new(config: FileConfig) -> Self {
		Self { config }
	}
}

impl Provider for FileProvider {
	fn name(&self) -> &'static str {
		"file"
	}

	fn read(&self, url: &Url) -> Result<ConfigEvent, Error> {
		let path = location::to_path(url).ok_or_else(|| Error::Url(url.to_string()))?;
		Scanner::read(&path)
	}

	fn start(&self, events: mpsc::Sender<ConfigEvent>, pool: &Pool) -> Result<(), Error> {
		if self.config.filenames.is_empty() && self.config.directories.is_empty() {
			return Ok(());
		}
		let config = self.config.clone();
		pool.go(move |token| async move {
			if let Err(err) = watch(config, events, token).await {
				error!("file provider stopped: {err}");
			}
		})?;
		Ok(())
	}
}

/// Scan state owned by the watching task.
#[derive(Debug)]
struct Scanner {
	/// Scanned directories, as absolute paths.
	roots: Vec<PathBuf>,
	/// Files loaded individually, as absolute paths.
	files: Vec<PathBuf>,
	/// Base name prefixes of skipped entries.
	skip_prefixes: Vec<String>,
	/// Globs a file must match, if any.
	include: Vec<Pattern>,
	/// Ignore files by directory.
	ignores: IgnoreFiles,
}

/// The outcome of a blocking scan step.
#[derive(Debug, Default)]
struct Scan {
	/// Documents to emit.
	events: Vec<ConfigEvent>,
	/// Directories to watch.
	directories: Vec<PathBuf>,
}

impl Scanner {
	/// Build the scanner for a configuration, anchoring relative paths at
	/// the working directory.
	fn new(config: &FileConfig) -> Result<Self, Error> {
		let cwd = std::env::current_dir()?;
		let include = config
			.include
			.iter()
			.filter_map(|glob| match Pattern::new(glob) {
				Ok(pattern) => Some(pattern),
				Err(err) => {
					warn!("skipping invalid include pattern {glob:?}: {err}");
					None
				}
			})
			.collect();
		Ok(Self {
			roots: config.directories.iter().map(|dir| cwd.join(dir)).collect(),
			files: config.filenames.iter().map(|file| cwd.join(file)).collect(),
			skip_prefixes: config.skip_prefixes.clone(),
			include,
			ignores: IgnoreFiles::default(),
		})
	}

	/// The scanned directory containing `path`.
	fn root_of(&self, path: &Path) -> Option<&Path> {
		self.roots
			.iter()
			.filter(|root| path.starts_with(root))
			.max_by_key(|root| root.as_os_str().len())
			.map(PathBuf::as_path)
	}

	/// Whether a base name carries a skip prefix.
	fn skipped_name(&self, name: &str) -> bool {
		self.skip_prefixes
			.iter()
			.any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
	}

	/// Whether a directory below a root is excluded from scanning.
	fn skip_dir(&self, dir: &Path) -> bool {
		let Some(root) = self.root_of(dir) else {
			return true;
		};
		let relative = dir.strip_prefix(root).unwrap_or(dir);
		relative.iter().any(|name| self.skipped_name(&name.to_string_lossy()))
			|| self.ignores.is_ignored(dir, true)
	}

	/// Whether a file is emitted.
	fn accepts(&self, path: &Path) -> bool {
		if self.files.iter().any(|file| file == path) {
			return true;
		}
		let Some(name) = path.file_name().map(|name| name.to_string_lossy()) else {
			return false;
		};
		if !EXTENSIONS.iter().any(|ext| name.ends_with(ext)) || self.skipped_name(&name) {
			return false;
		}
		let Some(root) = self.root_of(path) else {
			return false;
		};
		let relative = path.strip_prefix(root).unwrap_or(path);
		if relative.parent().is_some_and(|parent| {
			parent.iter().any(|name| self.skipped_name(&name.to_string_lossy()))
		}) {
			return false;
		}
		if self.ignores.is_ignored(path, false) {
			return false;
		}
		self.include.is_empty() || {
			let relative = relative.to_string_lossy().replace('\\', "/");
			self.include.iter().any(|pattern| pattern.matches(&relative, false))
		}
	}

	/// Read a file into an event.
	fn read(path: &Path) -> Result<ConfigEvent, Error> {
		let raw = std::fs::read(path)?;
		Ok(ConfigEvent { info: ConfigInfo::new("file", file_url(path)?), raw: Bytes::from(raw) })
	}

	/// Initial scan of every root and single file.
	fn scan_all(&mut self) -> Scan {
		let mut scan = Scan::default();
		for file in self.files.clone() {
			match Self::read(&file) {
				Ok(event) => scan.events.push(event),
				Err(err) => warn!("reading {}: {err}", file.display()),
			}
			if let Some(parent) = file.parent() {
				scan.directories.push(parent.to_path_buf());
			}
		}
		for root in self.roots.clone() {
			self.walk(&root, &mut scan);
		}
		scan
	}

	/// Recursively scan `dir`. The directory's own ignore file applies to
	/// its entries, so it is loaded first.
	fn walk(&mut self, dir: &Path, scan: &mut Scan) {
		if self.skip_dir(dir) {
			debug!("skipping directory {}", dir.display());
			return;
		}
		self.ignores.load(dir);
		let mut entries = match std::fs::read_dir(dir) {
			Ok(entries) => entries
				.filter_map(Result::ok)
				.filter_map(|entry| Some((entry.path(), entry.file_type().ok()?)))
				.collect::<Vec<_>>(),
			Err(err) => {
				warn!("reading directory {}: {err}", dir.display());
				return;
			}
		};
		entries.sort_by(|(a, _), (b, _)| a.cmp(b));
		scan.directories.push(dir.to_path_buf());
		for (path, file_type) in entries {
			if file_type.is_dir() {
				self.walk(&path, scan);
			} else if file_type.is_symlink() && path.is_dir() {
				debug!("not following directory link {}", path.display());
			} else if self.accepts(&path) {
				match Self::read(&path) {
					Ok(event) => scan.events.push(event),
					Err(err) => warn!("reading {}: {err}", path.display()),
				}
			}
		}
	}

	/// Process one coalesced batch of changed paths.
	fn changed(&mut self, paths: Vec<PathBuf>) -> Scan {
		let mut scan = Scan::default();
		for path in paths {
			if path.file_name().is_some_and(|name| name == IGNORE_FILE) {
				if let Some(dir) = path.parent() {
					self.ignores.load(dir);
				}
				continue;
			}
			if path.is_dir() {
				if self.root_of(&path).is_some() {
					self.walk(&path, &mut scan);
				}
			} else if path.is_file() && self.accepts(&path) {
				match Self::read(&path) {
					Ok(event) => scan.events.push(event),
					Err(err) => warn!("reading {}: {err}", path.display()),
				}
			}
		}
		scan
	}
}

/// Scan the configured files and directories, then keep watching them until
/// `token` fires.
pub(crate) async fn watch(
	config: FileConfig,
	events: mpsc::Sender<ConfigEvent>,
	token: CancellationToken,
) -> Result<(), Error> {
	let scanner = Scanner::new(&config)?;
	let (mut scanner, scan) = tokio::task::spawn_blocking(move || {
		let mut scanner = scanner;
		let scan = scanner.scan_all();
		(scanner, scan)
	})
	.await
	.map_err(|err| Error::Io(std::io::Error::other(err)))?;

	let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
	let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
		// The receiver is gone once the task below stops.
		let _ = notify_tx.send(event);
	})?;
	let mut watched = HashSet::new();
	if !emit(scan, &events, &token, &mut watcher, &mut watched).await {
		return Ok(());
	}
	info!("watching {} directories for configuration changes", watched.len());

	// Events collected during one tick, first event per path wins. Only this
	// task touches it.
	let mut pending: Vec<PathBuf> = Vec::new();
	let mut seen: HashSet<PathBuf> = HashSet::new();
	let mut ticker = tokio::time::interval(COALESCE_INTERVAL);
	loop {
		tokio::select! {
			() = token.cancelled() => return Ok(()),
			event = notify_rx.recv() => match event {
				Some(Ok(event)) => {
					for path in event.paths {
						let temporary = path
							.file_name()
							.is_some_and(|name| name.to_string_lossy().ends_with('~'));
						if !temporary && seen.insert(path.clone()) {
							pending.push(path);
						}
					}
				}
				Some(Err(err)) => warn!("filesystem watcher: {err}"),
				None => return Ok(()),
			},
			_ = ticker.tick() => {
				if pending.is_empty() {
					continue;
				}
				let batch = std::mem::take(&mut pending);
				seen.clear();
				let (returned, scan) = tokio::task::spawn_blocking(move || {
					let scan = scanner.changed(batch);
					(scanner, scan)
				})
				.await
				.map_err(|err| Error::Io(std::io::Error::other(err)))?;
				scanner = returned;
				if !emit(scan, &events, &token, &mut watcher, &mut watched).await {
					return Ok(());
				}
			}
		}
	}
}

/// Watch new directories and send the scanned documents. Returns `false`
/// once the receiving side is gone or `token` fired.
async fn emit(
	scan: Scan,
	events: &mpsc::Sender<ConfigEvent>,
	token: &CancellationToken,
	watcher: &mut notify::RecommendedWatcher,
	watched: &mut HashSet<PathBuf>,
) -> bool {
	for dir in scan.directories {
		if watched.contains(&dir) {
			continue;
		}
		match watcher.watch(&dir, RecursiveMode::NonRecursive) {
			Ok(()) => {
				watched.insert(dir);
			}
			Err(err) => warn!("watching {}: {err}", dir.display()),
		}
	}
	for event in scan.events {
		debug!("emitting {}", event.info.url);
		if !send(events, event, token).await {
			return false;
		}
	}
	true
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{fs, path::Path, time::Duration};

	use tokio::sync::mpsc;

	use super::{FileConfig, FileProvider};
	use crate::{
		pool::Pool,
		provider::{ConfigEvent, Provider},
	};

	/// Collect events until none arrive for a while.
	async fn drain(rx: &mut mpsc::Receiver<ConfigEvent>) -> Vec<String> {
		let mut names = Vec::new();
		while let Ok(Some(event)) =
			tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
		{
			let path = event.info.url.to_file_path().unwrap();
			names.push(path.file_name().unwrap().to_string_lossy().into_owned());
		}
		names.sort();
		names
	}

	fn write(dir: &Path, name: &str, contents: &str) {
		let path = dir.join(name);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(path, contents).unwrap();
	}

	#[tokio::test]
	async fn ignore_file_negation_keeps_file() -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		write(dir.path(), ".mokapiignore", "!keep.yml\n*.yml\n");
		write(dir.path(), "keep.yml", "a: 1");
		write(dir.path(), "drop.yml", "a: 1");
		write(dir.path(), "nested/also-dropped.yml", "a: 1");

		let pool = Pool::new();
		let (tx, mut rx) = mpsc::channel(16);
		FileProvider::new(FileConfig::directory(dir.path())).start(tx, &pool)?;
		assert_eq!(drain(&mut rx).await, ["keep.yml"]);
		pool.stop().await;
		Ok(())
	}

	#[tokio::test]
	async fn skip_prefixes_and_extensions() -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		write(dir.path(), "api.json", "{}");
		write(dir.path(), "handler.js", "1");
		write(dir.path(), "users.yml.tmpl", "a: 1");
		write(dir.path(), "_draft.yml", "a: 1");
		write(dir.path(), "_private/secret.yml", "a: 1");
		write(dir.path(), "README.md", "# docs");

		let pool = Pool::new();
		let (tx, mut rx) = mpsc::channel(16);
		FileProvider::new(FileConfig::directory(dir.path())).start(tx, &pool)?;
		assert_eq!(drain(&mut rx).await, ["api.json", "handler.js", "users.yml.tmpl"]);
		pool.stop().await;
		Ok(())
	}

	#[tokio::test]
	async fn include_globs_limit_files() -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		write(dir.path(), "specs/a.yml", "a: 1");
		write(dir.path(), "specs/deep/b.yml", "a: 1");
		write(dir.path(), "other/c.yml", "a: 1");

		let pool = Pool::new();
		let (tx, mut rx) = mpsc::channel(16);
		let config = FileConfig {
			include: vec!["specs/**/*.yml".to_owned()],
			..FileConfig::directory(dir.path())
		};
		FileProvider::new(config).start(tx, &pool)?;
		assert_eq!(drain(&mut rx).await, ["a.yml", "b.yml"]);
		pool.stop().await;
		Ok(())
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn directory_links_are_not_followed() -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		write(dir.path(), "a.yml", "a: 1");
		std::os::unix::fs::symlink(dir.path(), dir.path().join("loop"))?;
		std::os::unix::fs::symlink(dir.path().join("a.yml"), dir.path().join("link.yml"))?;

		let pool = Pool::new();
		let (tx, mut rx) = mpsc::channel(16);
		FileProvider::new(FileConfig::directory(dir.path())).start(tx, &pool)?;
		assert_eq!(drain(&mut rx).await, ["a.yml", "link.yml"]);
		pool.stop().await;
		Ok(())
	}

	#[tokio::test]
	async fn stop_interrupts_blocked_send() -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		for name in ["a.yml", "b.yml", "c.yml"] {
			write(dir.path(), name, "a: 1");
		}

		let pool = Pool::new();
		let (tx, mut rx) = mpsc::channel(1);
		FileProvider::new(FileConfig::directory(dir.path())).start(tx, &pool)?;
		assert!(tokio::time::timeout(Duration::from_secs(10), rx.recv()).await?.is_some());
		// One event fills the buffer, the next send waits for a reader.
		tokio::time::sleep(Duration::from_millis(300)).await;
		tokio::time::timeout(Duration::from_secs(5), pool.stop()).await?;
		drop(rx);
		Ok(())
	}

	#[tokio::test]
	async fn emits_changes_and_new_directories() -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		write(dir.path(), "a.yml", "a: 1");

		let pool = Pool::new();
		let (tx, mut rx) = mpsc::channel(16);
		FileProvider::new(FileConfig::directory(dir.path())).start(tx, &pool)?;
		assert_eq!(drain(&mut rx).await, ["a.yml"]);

		write(dir.path(), "b.yml", "b: 1");
		write(dir.path(), "b.yml~", "editor backup");
		let event = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await?.unwrap();
		assert!(event.info.url.path().ends_with("/b.yml"));
		assert_eq!(&event.raw[..], b"b: 1");

		fs::create_dir(dir.path().join("sub"))?;
		tokio::time::sleep(Duration::from_millis(1500)).await;
		write(dir.path(), "sub/c.yml", "c: 1");
		let mut found = false;
		while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
			if event.info.url.path().ends_with("/sub/c.yml") {
				found = true;
				break;
			}
		}
		assert!(found, "file in new directory was not emitted");
		pool.stop().await;
		Ok(())
	}

	#[test]
	fn provider_reads_single_file() -> Result<(), Box<dyn std::error::Error>> {
		let dir = tempfile::tempdir()?;
		write(dir.path(), "x.json", "{\"x\": 1}");
		let url = url::Url::from_file_path(dir.path().join("x.json")).unwrap();
		let event = FileProvider::default().read(&url)?;
		assert_eq!(event.info.provider, "file");
		assert_eq!(&event.raw[..], b"{\"x\": 1}");
		Ok(())
	}
}
