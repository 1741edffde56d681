//! Parsing, normalization, and relative resolution of configuration URLs.
//!
//! Configuration documents are identified by [`Url`]s. Filesystem locations
//! are always absolute `file:` URLs; relative filesystem anchors such as
//! `file:./api.yml` or a bare `./api.yml` are resolved against the working
//! directory when parsed.
use std::path::{Path, PathBuf};

use url::Url;

use super::Error;

/// Parse a location given either as URL or as filesystem path.
pub fn parse(location: &str) -> Result<Url, Error> {
	if let Some(opaque) = location.strip_prefix("file:") {
		if !opaque.starts_with('/') {
			return from_path(opaque);
		}
	}
	match Url::parse(location) {
		Ok(url) if url.scheme().len() > 1 => Ok(url),
		// A single letter scheme is a Windows drive, and a missing scheme is
		// a relative path.
		Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => from_path(location),
		Err(err) => Err(Error::InvalidUrl { url: location.to_owned(), reason: err.to_string() }),
	}
}

/// Build an absolute `file:` URL for a path, anchoring relative paths at the
/// current working directory. A `#fragment` suffix is preserved.
pub fn from_path(path: &str) -> Result<Url, Error> {
	let (path, fragment) = match path.split_once('#') {
		Some((path, fragment)) => (path, Some(fragment)),
		None => (path, None),
	};
	let path = Path::new(path);
	let absolute =
		if path.is_absolute() { path.to_path_buf() } else { std::env::current_dir()?.join(path) };
	let mut url = Url::from_file_path(clean(&absolute)).map_err(|()| Error::InvalidUrl {
		url: absolute.display().to_string(),
		reason: "not an absolute path".to_owned(),
	})?;
	url.set_fragment(fragment);
	Ok(url)
}

/// The identity key of a URL: its normalized form without fragment.
#[must_use]
pub fn key(url: &Url) -> String {
	let mut url = url.clone();
	url.set_fragment(None);
	url.to_string()
}

/// The file name used for format dispatch: the final path segment.
#[must_use]
pub fn file_name(url: &Url) -> &str {
	url.path_segments().and_then(Iterator::last).unwrap_or_default()
}

/// The filesystem path of a `file:` URL.
#[must_use]
pub fn to_path(url: &Url) -> Option<PathBuf> {
	if url.scheme() == "file" {
		url.to_file_path().ok()
	} else {
		None
	}
}

/// Resolve a reference against the URL of the document containing it.
///
/// Returns `None` when the reference is a pure fragment, i.e. it addresses
/// a location in the current document.
pub fn resolve(base: &Url, reference: &str) -> Result<Option<Url>, Error> {
	if reference.is_empty() || reference.starts_with('#') {
		return Ok(None);
	}
	match Url::parse(reference) {
		Ok(url) if url.scheme().len() > 1 => return Ok(Some(url)),
		Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {}
		Err(err) => {
			return Err(Error::InvalidUrl { url: reference.to_owned(), reason: err.to_string() })
		}
	}
	base.join(reference)
		.map(Some)
		.map_err(|err| Error::InvalidUrl { url: reference.to_owned(), reason: err.to_string() })
}

/// Remove `.` and `..` components without touching the filesystem.
fn clean(path: &Path) -> PathBuf {
	use std::path::Component;

	let mut cleaned = PathBuf::new();
	for component in path.components() {
		match component {
			Component::CurDir => {}
			Component::ParentDir => {
				cleaned.pop();
			}
			other => cleaned.push(other),
		}
	}
	cleaned
}
