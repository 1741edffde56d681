//! Configuration documents in git repositories.
//!
//! Every repository is cloned into a temporary directory which is then
//! scanned and watched like a local directory. The clone is refreshed by
//! pulling on an interval and removed when the provider stops.
use std::{
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
	file, one_or_many, relative_path, send, ConfigEvent, Error, FileConfig, FileProvider,
	Provider,
};
use crate::pool::Pool;

pub mod github;

pub use self::github::{GitHubApp, GitHubAuth};

/// Configuration of the git provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitConfig {
	/// Repositories to clone. A `//dir1,dir2` suffix of the path selects a
	/// sparse checkout and a `ref` query parameter the branch.
	#[serde(alias = "url", deserialize_with = "one_or_many")]
	pub urls: Vec<String>,
	/// Branch to check out when a URL names none.
	#[serde(rename = "ref")]
	pub reference: Option<String>,
	/// Delay between two pulls.
	#[serde(with = "humantime_serde")]
	pub pull_interval: Duration,
	/// Where clones are created, the system temporary directory by default.
	pub temp_dir: Option<PathBuf>,
	/// Credentials for private repositories.
	pub auth: Option<GitAuth>,
}

impl Default for GitConfig {
	fn default() -> Self {
		Self {
			urls: Vec::new(),
			reference: None,
			pull_interval: Duration::from_secs(5),
			temp_dir: None,
			auth: None,
		}
	}
}

/// Credentials for private repositories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAuth {
	/// GitHub App installation credentials.
	pub github: Option<GitHubAuth>,
}

/// A repository location split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
	/// What to clone.
	pub url: Url,
	/// Branch to check out.
	pub reference: Option<String>,
	/// Directories of a sparse checkout, empty for a full checkout.
	pub directories: Vec<String>,
}

impl Repository {
	/// Parse a repository location, falling back to `default_ref` when the
	/// location names no branch.
	pub fn parse(location: &str, default_ref: Option<&str>) -> Result<Self, Error> {
		let mut url = Url::parse(location).map_err(|err| Error::Url(format!("{location}: {err}")))?;

		let path = url.path().to_owned();
		let (path, directories) = match path.get(1..).and_then(|rest| rest.find("//")) {
			Some(offset) => {
				let split = offset + 1;
				let directories = path[split + 2..]
					.split(',')
					.map(|dir| dir.trim_matches('/').to_owned())
					.filter(|dir| !dir.is_empty())
					.collect();
				(path[..split].to_owned(), directories)
			}
			None => (path, Vec::new()),
		};
		url.set_path(&path);

		let mut reference = None;
		let rest: Vec<(String, String)> = url
			.query_pairs()
			.filter_map(|(key, value)| {
				if key == "ref" {
					reference = Some(value.into_owned());
					None
				} else {
					Some((key.into_owned(), value.into_owned()))
				}
			})
			.collect();
		if rest.is_empty() {
			url.set_query(None);
		} else {
			url.query_pairs_mut().clear().extend_pairs(rest);
		}

		Ok(Self {
			url,
			reference: reference.or_else(|| default_ref.map(str::to_owned)),
			directories,
		})
	}

	/// The location of a file inside the repository, used as outer
	/// descriptor of emitted documents.
	fn file_url(&self, relative: &str) -> Url {
		let mut url = self.url.clone();
		{
			let mut query = url.query_pairs_mut();
			if let Some(reference) = &self.reference {
				query.append_pair("ref", reference);
			}
			query.append_pair("file", relative);
		}
		url
	}
}

/// Clones repositories and emits their configuration files.
#[derive(Debug, Clone)]
pub struct GitProvider {
	/// What to clone.
	config: GitConfig,
}

impl GitProvider {
	/// Create a provider.
	#[must_use]
	pub fn new(config: GitConfig) -> Self {
		Self { config }
	}
}

impl Provider for GitProvider {
	fn name(&self) -> &'static str {
		"git"
	}

	fn read(&self, url: &Url) -> Result<ConfigEvent, Error> {
		// Files of a clone are addressed by their on-disk location.
		FileProvider::default().read(url)
	}

	fn start(&self, events: mpsc::Sender<ConfigEvent>, pool: &Pool) -> Result<(), Error> {
		let github = match self.config.auth.as_ref().and_then(|auth| auth.github.clone()) {
			Some(auth) => Some(Arc::new(GitHubApp::new(auth)?)),
			None => None,
		};
		for location in &self.config.urls {
			let repository = Repository::parse(location, self.config.reference.as_deref())?;
			let checkout = Checkout {
				repository,
				pull_interval: self.config.pull_interval,
				temp_dir: self.config.temp_dir.clone(),
				github: github.clone(),
			};
			let events = events.clone();
			pool.go(move |token| async move {
				if let Err(err) = checkout.run(events, token).await {
					error!("git provider stopped: {err}");
				}
			})?;
		}
		Ok(())
	}
}

/// One repository being tracked.
#[derive(Debug)]
struct Checkout {
	/// What to clone.
	repository: Repository,
	/// Delay between pulls and clone retries.
	pull_interval: Duration,
	/// Parent of the clone directory.
	temp_dir: Option<PathBuf>,
	/// Token source for authenticated access.
	github: Option<Arc<GitHubApp>>,
}

impl Checkout {
	/// Clone, then scan and pull until `token` fires.
	async fn run(
		self,
		events: mpsc::Sender<ConfigEvent>,
		token: CancellationToken,
	) -> Result<(), Error> {
		let mut builder = tempfile::Builder::new();
		builder.prefix("mimic-git-");
		let dir = match &self.temp_dir {
			Some(parent) => builder.tempdir_in(parent)?,
			None => builder.tempdir()?,
		};
		let url = &self.repository.url;

		let mut head = loop {
			match self.clone_into(dir.path()).await {
				Ok(head) => break head,
				Err(err) => warn!("cloning {url}: {err}"),
			}
			tokio::select! {
				() = token.cancelled() => return Ok(()),
				() = tokio::time::sleep(self.pull_interval) => {}
			}
		};
		info!("cloned {url} at {head}");

		let (inner_tx, mut inner_rx) = mpsc::channel(100);
		let files = FileConfig {
			skip_prefixes: vec!["_".to_owned(), ".git".to_owned()],
			..FileConfig::directory(dir.path())
		};
		let scan = file::watch(files, inner_tx, token.clone());
		let forward = async {
			while let Some(mut event) = inner_rx.recv().await {
				let relative = relative_path(&event.info.url, dir.path()).unwrap_or_default();
				event.info = event.info.wrap("git", self.repository.file_url(&relative));
				if !send(&events, event, &token).await {
					return;
				}
			}
		};
		let pull = async {
			let mut ticker = tokio::time::interval(self.pull_interval);
			ticker.tick().await;
			loop {
				tokio::select! {
					() = token.cancelled() => return,
					_ = ticker.tick() => {}
				}
				match self.pull(dir.path()).await {
					Ok(current) if current != head => {
						info!("pulled {url}: {head} -> {current}");
						head = current;
					}
					Ok(_) => debug!("{url} is up to date"),
					Err(err) => warn!("pulling {url}: {err}"),
				}
			}
		};
		let (scanned, (), ()) = tokio::join!(scan, forward, pull);
		scanned
	}

	/// Clone and check out, returning the checked out commit.
	async fn clone_into(&self, dir: &Path) -> Result<String, Error> {
		let header = self.auth_header().await?;
		let header = header.as_deref();
		let target = dir.to_string_lossy().into_owned();
		let url = self.repository.url.as_str();
		git(None, header, &["clone", "--quiet", "--no-checkout", url, target.as_str()]).await?;
		if !self.repository.directories.is_empty() {
			let mut args = vec!["sparse-checkout", "set"];
			args.extend(self.repository.directories.iter().map(String::as_str));
			git(Some(dir), header, &args).await?;
		}
		if let Some(reference) = &self.repository.reference {
			git(Some(dir), header, &["checkout", "--quiet", reference]).await?;
		}
		git(Some(dir), header, &["reset", "--quiet", "--hard"]).await?;
		git(Some(dir), None, &["rev-parse", "HEAD"]).await
	}

	/// Pull, returning the commit checked out afterwards.
	async fn pull(&self, dir: &Path) -> Result<String, Error> {
		let header = self.auth_header().await?;
		git(Some(dir), header.as_deref(), &["pull", "--quiet", "--ff-only"]).await?;
		git(Some(dir), None, &["rev-parse", "HEAD"]).await
	}

	/// The `http.extraHeader` value authenticating requests, if any.
	async fn auth_header(&self) -> Result<Option<String>, Error> {
		match &self.github {
			Some(app) => Ok(Some(app.header().await?)),
			None => Ok(None),
		}
	}
}

/// Run a git command, returning its trimmed standard output.
async fn git(dir: Option<&Path>, header: Option<&str>, args: &[&str]) -> Result<String, Error> {
	let mut command = tokio::process::Command::new("git");
	command.env("GIT_TERMINAL_PROMPT", "0").kill_on_drop(true);
	if let Some(header) = header {
		command.arg("-c").arg(format!("http.extraHeader={header}"));
	}
	if let Some(dir) = dir {
		command.arg("-C").arg(dir);
	}
	let output = command.args(args).output().await?;
	if !output.status.success() {
		return Err(Error::Git {
			command: args.first().copied().unwrap_or_default().to_owned(),
			message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
		});
	}
	Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{path::Path, process::Command, time::Duration};

	use tokio::sync::mpsc;

	use super::{GitConfig, GitProvider, Repository};
	use crate::{pool::Pool, provider::Provider};

	#[test]
	fn parses_sparse_directories_and_ref() -> Result<(), Box<dyn std::error::Error>> {
		let repo =
			Repository::parse("https://github.com/org/repo//specs,mocks/?ref=dev&depth=1", None)?;
		assert_eq!(repo.url.as_str(), "https://github.com/org/repo?depth=1");
		assert_eq!(repo.reference.as_deref(), Some("dev"));
		assert_eq!(repo.directories, ["specs", "mocks"]);

		let repo = Repository::parse("https://github.com/org/repo.git", Some("main"))?;
		assert_eq!(repo.url.as_str(), "https://github.com/org/repo.git");
		assert_eq!(repo.reference.as_deref(), Some("main"));
		assert!(repo.directories.is_empty());
		Ok(())
	}

	fn run(dir: &Path, args: &[&str]) -> bool {
		Command::new("git")
			.args(["-c", "user.name=mimic", "-c", "user.email=mimic@example.com"])
			.arg("-C")
			.arg(dir)
			.args(args)
			.output()
			.is_ok_and(|output| output.status.success())
	}

	#[tokio::test]
	async fn clones_and_follows_repository() -> Result<(), Box<dyn std::error::Error>> {
		let origin = tempfile::tempdir()?;
		if !run(origin.path(), &["init", "--quiet"]) {
			// git is not installed
			return Ok(());
		}
		assert!(run(origin.path(), &["checkout", "--quiet", "-b", "main"]));
		std::fs::write(origin.path().join("api.yml"), "a: 1")?;
		assert!(run(origin.path(), &["add", "."]));
		assert!(run(origin.path(), &["commit", "--quiet", "-m", "initial"]));

		let config = GitConfig {
			urls: vec![url::Url::from_file_path(origin.path()).unwrap().to_string()],
			reference: Some("main".to_owned()),
			pull_interval: Duration::from_millis(200),
			..GitConfig::default()
		};
		let pool = Pool::new();
		let (tx, mut rx) = mpsc::channel(16);
		GitProvider::new(config).start(tx, &pool)?;

		let event = tokio::time::timeout(Duration::from_secs(15), rx.recv()).await?.unwrap();
		assert_eq!(event.info.provider, "git");
		assert_eq!(event.info.kernel().provider, "file");
		assert!(event.info.url.query().unwrap_or_default().contains("file=api.yml"));
		assert_eq!(&event.raw[..], b"a: 1");

		std::fs::write(origin.path().join("api.yml"), "a: 2")?;
		assert!(run(origin.path(), &["commit", "--quiet", "-am", "change"]));
		let mut updated = false;
		while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(15), rx.recv()).await {
			if &event.raw[..] == b"a: 2" {
				updated = true;
				break;
			}
		}
		assert!(updated, "pulled change was not emitted");
		pool.stop().await;
		Ok(())
	}
}
