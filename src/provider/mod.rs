//! Sources of raw configuration documents.
//!
//! A [`Provider`] discovers documents in some backing store and emits a
//! [`ConfigEvent`] for every document it finds and for every later change.
//! Long-running discovery loops are submitted to the caller's [`Pool`] and
//! end when the pool stops.
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
	dynamic::ConfigInfo,
	pool::{Pool, PoolClosed},
};

pub mod file;
pub mod git;
pub mod glob;
pub mod http;
pub mod ignore;
pub mod package;

pub use self::{
	file::{FileConfig, FileProvider},
	git::{GitConfig, GitProvider},
	http::{HttpConfig, HttpProvider},
	package::{PackageConfig, PackageProvider},
};

/// One revision of a raw document.
#[derive(Debug, Clone)]
pub struct ConfigEvent {
	/// Where the revision came from.
	pub info: ConfigInfo,
	/// The document's bytes.
	pub raw: Bytes,
}

/// A source of configuration documents.
pub trait Provider: Send + Sync + fmt::Debug {
	/// Name used in [`ConfigInfo::provider`].
	fn name(&self) -> &'static str;

	/// Fetch a single document. Blocks the calling thread.
	fn read(&self, url: &Url) -> Result<ConfigEvent, Error>;

	/// Start discovery, sending every found document to `events`.
	fn start(&self, events: mpsc::Sender<ConfigEvent>, pool: &Pool) -> Result<(), Error>;
}

/// Errors of the providers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// Filesystem access failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// An HTTP request failed.
	#[error(transparent)]
	Http(#[from] reqwest::Error),
	/// A server answered with a non-success status.
	#[error("{url} responded with status {status}")]
	Status {
		/// Requested location.
		url: Url,
		/// Response status.
		status: reqwest::StatusCode,
	},
	/// A git command failed.
	#[error("git {command}: {message}")]
	Git {
		/// The git subcommand.
		command: String,
		/// Diagnostic output of git.
		message: String,
	},
	/// The filesystem watcher failed.
	#[error(transparent)]
	Notify(#[from] notify::Error),
	/// A package could not be located.
	#[error("package {0:?} not found")]
	PackageNotFound(String),
	/// Minting a GitHub App token failed.
	#[error("github app: {0}")]
	GitHub(String),
	/// Signing a GitHub App assertion failed.
	#[error(transparent)]
	Jwt(#[from] jsonwebtoken::errors::Error),
	/// A location could not be parsed or mapped.
	#[error("invalid url {0:?}")]
	Url(String),
	/// The worker pool is stopped.
	#[error(transparent)]
	PoolClosed(#[from] PoolClosed),
}

/// Accept either a single value or a list in configuration files.
pub(crate) fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
	D: Deserializer<'de>,
	T: Deserialize<'de>,
{
	/// Either shape of the field.
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum OneOrMany<T> {
		/// A single value.
		One(T),
		/// A list of values.
		Many(Vec<T>),
	}

	Ok(match OneOrMany::deserialize(deserializer)? {
		OneOrMany::One(value) => vec![value],
		OneOrMany::Many(values) => values,
	})
}

/// Send `event` unless `token` fires first. Returns `false` once the token
/// fired or the receiving side is gone.
pub(crate) async fn send(
	events: &mpsc::Sender<ConfigEvent>,
	event: ConfigEvent,
	token: &CancellationToken,
) -> bool {
	tokio::select! {
		() = token.cancelled() => false,
		sent = events.send(event) => sent.is_ok(),
	}
}

/// The `file:` URL of a path.
pub(crate) fn file_url(path: &std::path::Path) -> Result<Url, Error> {
	Url::from_file_path(path).map_err(|()| Error::Url(path.display().to_string()))
}

/// The `/` separated path of a `file:` URL relative to `root`.
pub(crate) fn relative_path(url: &Url, root: &std::path::Path) -> Option<String> {
	let path = url.to_file_path().ok()?;
	let relative = path.strip_prefix(root).ok()?;
	Some(relative.to_string_lossy().replace('\\', "/"))
}
