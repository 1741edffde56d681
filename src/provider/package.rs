//! Configuration documents shipped inside installed packages.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use super::{
	file, file_url, glob::Pattern, relative_path, send, ConfigEvent, Error, FileConfig,
	FileProvider, Provider,
};
use crate::pool::Pool;

/// Directory names searched for packages, in order, in every ancestor of
/// the working directory.
const MODULE_DIRS: [&str; 2] = ["node_modules", "modules"];

/// Configuration of the package provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageConfig {
	/// Packages to load.
	pub packages: Vec<Package>,
	/// Folders searched when no ancestor directory holds a package.
	pub global_folders: Vec<PathBuf>,
}

/// One package to load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Package {
	/// Name of the package directory.
	pub name: String,
	/// Paths relative to the package emitted as they are.
	pub files: Vec<String>,
	/// Globs relative to the package selecting further files.
	pub include: Vec<String>,
}

/// Find a package by walking up from `start`, then trying each global
/// folder.
pub fn locate(name: &str, start: &Path, global_folders: &[PathBuf]) -> Result<PathBuf, Error> {
	start
		.ancestors()
		.flat_map(|dir| MODULE_DIRS.iter().map(move |modules| dir.join(modules).join(name)))
		.chain(global_folders.iter().map(|folder| folder.join(name)))
		.find(|candidate| candidate.is_dir())
		.ok_or_else(|| Error::PackageNotFound(name.to_owned()))
}

/// Selects the files of a package that are forwarded.
#[derive(Debug, Clone)]
struct Selection {
	/// Exact relative paths.
	files: Vec<String>,
	/// Relative path globs.
	include: Vec<Pattern>,
}

impl Selection {
	/// Compile a package's filters. Invalid globs are logged and skipped.
	fn new(package: &Package) -> Self {
		let include = package
			.include
			.iter()
			.filter_map(|glob| match Pattern::new(glob) {
				Ok(pattern) => Some(pattern),
				Err(err) => {
					warn!("skipping invalid include pattern {glob:?} of {}: {err}", package.name);
					None
				}
			})
			.collect();
		let files =
			package.files.iter().map(|file| file.trim_start_matches("./").to_owned()).collect();
		Self { files, include }
	}

	/// Whether a relative path is forwarded. Without filters every file is.
	fn accepts(&self, relative: &str) -> bool {
		(self.files.is_empty() && self.include.is_empty())
			|| self.files.iter().any(|file| file == relative)
			|| self.include.iter().any(|pattern| pattern.matches(relative, false))
	}
}

/// Loads and watches configuration files of installed packages.
#[derive(Debug, Clone)]
pub struct PackageProvider {
	/// What to load.
	config: PackageConfig,
	/// Where the package search starts, the process working directory by
	/// default.
	working_dir: Option<PathBuf>,
}

impl PackageProvider {
	/// Create a provider.
	#[must_use]
	pub fn new(config: PackageConfig) -> Self {
		Self { config, working_dir: None }
	}

	/// Start the package search at `dir`.
	#[must_use]
	pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.working_dir = Some(dir.into());
		self
	}
}

impl Provider for PackageProvider {
	fn name(&self) -> &'static str {
		"npm"
	}

	fn read(&self, url: &Url) -> Result<ConfigEvent, Error> {
		FileProvider::default().read(url)
	}

	fn start(&self, events: mpsc::Sender<ConfigEvent>, pool: &Pool) -> Result<(), Error> {
		let start = match &self.working_dir {
			Some(dir) => dir.clone(),
			None => std::env::current_dir()?,
		};
		for package in &self.config.packages {
			let root = locate(&package.name, &start, &self.config.global_folders)?;
			info!("loading package {} from {}", package.name, root.display());
			let selection = Selection::new(package);
			let name = package.name.clone();
			let events = events.clone();
			pool.go(move |token| async move {
				if let Err(err) = forward(name, root, selection, events, token).await {
					error!("package provider stopped: {err}");
				}
			})?;
		}
		Ok(())
	}
}

/// Watch a package directory, forwarding its selected files.
async fn forward(
	name: String,
	root: PathBuf,
	selection: Selection,
	events: mpsc::Sender<ConfigEvent>,
	token: CancellationToken,
) -> Result<(), Error> {
	let package_url = file_url(&root)?;
	let (inner_tx, mut inner_rx) = mpsc::channel(100);
	let scan = file::watch(FileConfig::directory(&root), inner_tx, token.clone());
	let relay = async {
		while let Some(mut event) = inner_rx.recv().await {
			let Some(relative) = relative_path(&event.info.url, &root) else {
				continue;
			};
			if !selection.accepts(&relative) {
				continue;
			}
			let mut url = package_url.clone();
			url.query_pairs_mut().append_pair("package", &name).append_pair("file", &relative);
			event.info = event.info.wrap("npm", url);
			if !send(&events, event, &token).await {
				return;
			}
		}
	};
	let (scanned, ()) = tokio::join!(scan, relay);
	scanned
}
