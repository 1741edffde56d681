//! The dynamic configuration plane.
//!
//! Providers surface raw documents, a [`Reader`] hands out memoized
//! [`Config`] records by URL, and parsing turns raw bytes into [`Data`]:
//! plaintext, arbitrary JSON-like values, scripts, or typed documents chosen
//! through the [`Registry`]. Typed documents may contain [`Reference`]s to
//! other documents, resolved through the same reader.

pub mod config;
pub mod data;
mod parse;
pub mod reference;
pub mod registry;
pub mod template;
pub mod url;

use std::sync::Arc;

pub use crate::dynamic::{
	config::{checksum, Config, ConfigInfo, Listener, ParseMode, ReadOptions},
	data::{Addressable, Data, Document, Script, Shape},
	reference::Reference,
	registry::{ConfigType, Registry},
};

/// Hands out [`Config`] records by URL.
///
/// Implementations memoize by [`url::key`]: repeated reads of one URL return
/// the same `Arc`. Creation-only options (raw bytes, seeded data, parse mode)
/// are ignored on a cache hit, listener options are always applied.
pub trait Reader: Send + Sync {
	/// Return the config for `url`, fetching and parsing it on first use.
	fn read(&self, url: &::url::Url, options: ReadOptions) -> Result<Arc<Config>, Error>;

	/// The registry used to recognize typed documents.
	fn registry(&self) -> &Registry {
		Registry::global()
	}
}

/// Errors of the configuration plane.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// Parsing a config failed.
	#[error("parsing {url} failed: {source}")]
	Parse {
		/// Identity of the config.
		url: String,
		/// Underlying failure.
		source: Box<Error>,
	},
	/// Rendering a template failed.
	#[error("template: {0}")]
	Template(String),
	/// A reference could not be resolved.
	#[error("resolve reference {reference:?}: {source}")]
	Reference {
		/// The textual reference.
		reference: String,
		/// Underlying failure.
		source: Box<Error>,
	},
	/// The reference target holds no addressable data.
	#[error("unresolved path: {0:?}")]
	UnresolvedPath(String),
	/// One token of a reference path did not resolve.
	#[error("invalid token reference {0:?}")]
	InvalidToken(String),
	/// The resolved node could not be assigned to the destination.
	#[error("expected type {expected}, got {got}")]
	TypeMismatch {
		/// Destination type.
		expected: &'static str,
		/// Type of the resolved node.
		got: &'static str,
	},
	/// Fetching a document failed.
	#[error("read {url}: {source}")]
	Read {
		/// Requested location.
		url: String,
		/// Underlying failure.
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	/// No provider can serve the URL's scheme.
	#[error("unsupported scheme {0:?}")]
	UnsupportedScheme(String),
	/// A location could not be parsed.
	#[error("invalid url {url:?}: {reason}")]
	InvalidUrl {
		/// The offending input.
		url: String,
		/// Parser diagnostics.
		reason: String,
	},
	/// A JSON document could not be decoded into its typed shape.
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	/// A YAML document could not be decoded.
	#[error(transparent)]
	Yaml(#[from] serde_yaml::Error),
	/// Filesystem access failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
}
