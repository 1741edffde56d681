//! Format dispatch from raw bytes to [`Data`].
use bytes::Bytes;
use tracing::{debug, warn};

use super::{template, url as location, Config, Data, Error, ParseMode, Reader, Script, Shape};

/// Formats recognized by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
	/// `.yml` and `.yaml`.
	Yaml,
	/// `.json`.
	Json,
	/// `.lua` and `.js`.
	Script,
	/// Anything else.
	Text,
}

impl Format {
	/// Format of a file name, ignoring case.
	fn of(name: &str) -> Self {
		let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
		match extension.as_deref() {
			Some("yml" | "yaml") => Self::Yaml,
			Some("json") => Self::Json,
			Some("lua" | "js") => Self::Script,
			_ => Self::Text,
		}
	}

	/// Decode a structured payload into a generic value.
	fn decode(self, raw: &[u8]) -> Option<Result<serde_json::Value, Error>> {
		match self {
			Self::Yaml => Some(serde_yaml::from_slice(raw).map_err(Error::from)),
			Self::Json => Some(serde_json::from_slice(raw).map_err(Error::from)),
			Self::Script | Self::Text => None,
		}
	}
}

/// Split off a `.tmpl` suffix.
fn strip_template(name: &str) -> Option<&str> {
	let stem = name.len().checked_sub(".tmpl".len())?;
	name.get(stem..).filter(|ext| ext.eq_ignore_ascii_case(".tmpl")).and_then(|_| name.get(..stem))
}

/// Lossy text form of a payload.
fn text(raw: &[u8]) -> String {
	String::from_utf8_lossy(raw).into_owned()
}

impl Config {
	/// Parse the current raw payload into [`Data`].
	///
	/// Structured documents are decoded into the seeded shape, the shape of
	/// the previous revision, or a shape found through the reader's
	/// registry. A decode failure is logged and the payload kept as text.
	/// Typed documents then run their own [`Document::parse`] hook with this
	/// config's lock released, so references may read other configs.
	///
	/// [`Document::parse`]: super::Document::parse
	pub fn parse(&self, reader: &dyn Reader) -> Result<(), Error> {
		if self.parse_mode == ParseMode::Plaintext {
			self.set_data(Some(Data::Text(text(&self.raw()))));
			return Ok(());
		}

		let document = {
			let _guard = self.parse_lock.lock();
			let url = self.url();
			let mut name = location::file_name(&url).to_owned();
			let mut raw = self.raw();
			if let Some(stem) = strip_template(&name) {
				let rendered = match template::render(&text(&raw)) {
					Ok(rendered) => rendered,
					Err(err) => {
						self.set_data(None);
						let url = self.key().to_owned();
						return Err(Error::Parse { url, source: Box::new(err) });
					}
				};
				raw = Bytes::from(rendered);
				name = stem.to_owned();
			}

			let previous = self.data();
			let data = match Format::of(&name) {
				Format::Script => {
					let code = text(&raw);
					match previous.as_deref() {
						Some(Data::Script(script)) => {
							script.set_code(code);
							Data::Script(script.clone())
						}
						_ => Data::Script(Script::new(name, code)),
					}
				}
				Format::Text => Data::Text(text(&raw)),
				format => match format.decode(&raw) {
					Some(Ok(value)) => {
						match self.decode_structured(value, previous.as_deref(), reader) {
							Ok(Some(data)) => data,
							Ok(None) => {
								debug!("{}: no registered document type", self.key());
								self.set_data(None);
								return Ok(());
							}
							Err(err) => {
								let key = self.key();
								warn!("{key}: decoding typed document failed, keeping text: {err}");
								Data::Text(text(&raw))
							}
						}
					}
					Some(Err(err)) => {
						warn!("{}: decoding failed, keeping text: {err}", self.key());
						Data::Text(text(&raw))
					}
					None => Data::Text(text(&raw)),
				},
			};

			match data {
				Data::Document(document) => document,
				other => {
					self.set_data(Some(other));
					return Ok(());
				}
			}
		};

		// Readers reached from the hook may walk into this config while it
		// is still resolving, so the unresolved document is published first.
		self.set_data(Some(Data::Document(document.clone())));
		let mut document = document;
		document
			.parse(self, reader)
			.map_err(|err| Error::Parse { url: self.key().to_owned(), source: Box::new(err) })?;
		self.set_data(Some(Data::Document(document)));
		Ok(())
	}

	/// Route a decoded value to its destination shape.
	fn decode_structured(
		&self,
		value: serde_json::Value,
		previous: Option<&Data>,
		reader: &dyn Reader,
	) -> Result<Option<Data>, Error> {
		let previous_shape = match previous {
			Some(Data::Document(doc)) => Some(doc.shape()),
			_ => None,
		};
		let shape: Option<Shape> = self.shape.or(previous_shape).or_else(|| {
			value.as_object().and_then(|map| reader.registry().lookup(map)).map(|ty| ty.shape)
		});
		if let Some(shape) = shape {
			return Ok(Some(Data::Document(shape.decode(value)?)));
		}
		if matches!(previous, Some(Data::Value(_))) || self.parse_mode == ParseMode::Any {
			return Ok(Some(Data::Value(value)));
		}
		Ok(None)
	}

	/// The raw payload decoded as a generic structured value, bypassing the
	/// registry. Used to walk into documents no consumer asked to keep.
	pub(crate) fn structured_value(&self) -> Option<serde_json::Value> {
		let url = self.url();
		let name = location::file_name(&url);
		let name = strip_template(name).unwrap_or(name);
		Format::of(name).decode(&self.raw())?.ok()
	}
}
