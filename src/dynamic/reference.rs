//! `$ref` style references between and within documents.
//!
//! A reference is either a URL, optionally with a fragment path into the
//! target document (`b.yml#/components/foo`), or a pure fragment
//! addressing the current document (`#/components/foo`). Relative URLs are
//! resolved against the document containing the reference. Resolution
//! copies the target node into the reference; the target reports its later
//! changes to the referencing config, which resolves again.
use std::any::type_name;

use serde::{de::DeserializeOwned, ser::SerializeMap, Deserialize, Deserializer, Serialize};

use super::{url as location, Addressable, Config, Data, Error, ReadOptions, Reader};

/// A value given inline or by `$ref`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference<T> {
	/// The textual reference, when given by `$ref`.
	pub reference: Option<String>,
	/// The inline or resolved value.
	pub value: Option<T>,
}

impl<T> Reference<T> {
	/// An inline value.
	#[must_use]
	pub fn inline(value: T) -> Self {
		Self { reference: None, value: Some(value) }
	}

	/// An unresolved reference.
	#[must_use]
	pub fn to(reference: impl Into<String>) -> Self {
		Self { reference: Some(reference.into()), value: None }
	}

	/// The inline or resolved value.
	#[must_use]
	pub fn value(&self) -> Option<&T> {
		self.value.as_ref()
	}
}

impl<T> Reference<T>
where
	T: DeserializeOwned + Clone + 'static,
{
	/// Resolve the reference, if there is one, relative to `config`.
	pub fn resolve(&mut self, config: &Config, reader: &dyn Reader) -> Result<(), Error> {
		let Some(reference) = &self.reference else {
			return Ok(());
		};
		let value = resolve::<T>(reference, config, reader).map_err(|err| Error::Reference {
			reference: reference.clone(),
			source: Box::new(err),
		})?;
		self.value = Some(value);
		Ok(())
	}
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Reference<T> {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		use serde::de::Error as _;

		let value = serde_json::Value::deserialize(deserializer)?;
		if let Some(reference) = value.get("$ref").and_then(serde_json::Value::as_str) {
			return Ok(Self::to(reference));
		}
		serde_json::from_value(value).map(Self::inline).map_err(D::Error::custom)
	}
}

impl<T: Serialize> Serialize for Reference<T> {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match (&self.value, &self.reference) {
			(Some(value), _) => value.serialize(serializer),
			(None, Some(reference)) => {
				let mut map = serializer.serialize_map(Some(1))?;
				map.serialize_entry("$ref", reference)?;
				map.end()
			}
			(None, None) => serializer.serialize_none(),
		}
	}
}

impl<T: Addressable + Serialize + 'static> Addressable for Reference<T> {
	fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
		self.value.as_ref()?.resolve_token(token)
	}

	fn to_value(&self) -> Option<serde_json::Value> {
		self.value.as_ref()?.to_value()
	}

	fn type_name(&self) -> &'static str {
		type_name::<T>()
	}
}

/// Resolve `reference` relative to `config` into a copy of the target node.
///
/// The target config is read with `config` as parent, so its changes
/// propagate to `config`.
pub fn resolve<T>(reference: &str, config: &Config, reader: &dyn Reader) -> Result<T, Error>
where
	T: DeserializeOwned + Clone + 'static,
{
	let Some(target_url) = location::resolve(&config.url(), reference)? else {
		let fragment = reference.strip_prefix('#').unwrap_or(reference);
		let data = config.data();
		let root = data
			.as_deref()
			.and_then(Data::root)
			.ok_or_else(|| Error::UnresolvedPath(reference.to_owned()))?;
		return assign(walk(root, fragment)?);
	};

	let fragment = target_url.fragment().unwrap_or_default().to_owned();
	let options = ReadOptions::new().allow_parsing_any().with_parent(config);
	let target = reader.read(&target_url, options)?;
	let data = target.data();
	let decoded;
	let root = match data.as_deref().and_then(Data::root) {
		Some(root) => root,
		None => {
			// Documents no consumer claimed still hold their raw structure.
			decoded = target
				.structured_value()
				.ok_or_else(|| Error::UnresolvedPath(reference.to_owned()))?;
			&decoded as &dyn Addressable
		}
	};
	assign(walk(root, &fragment)?)
}

/// Walk a slash separated fragment path from `root`.
pub fn walk<'a>(root: &'a dyn Addressable, fragment: &str) -> Result<&'a dyn Addressable, Error> {
	let path = fragment.strip_prefix('/').unwrap_or(fragment);
	if path.is_empty() {
		return Ok(root);
	}
	let mut node = root;
	for token in path.split('/') {
		let token = token.replace("~1", "/").replace("~0", "~");
		node = node.resolve_token(&token).ok_or(Error::InvalidToken(token))?;
	}
	Ok(node)
}

/// Copy a resolved node into a value of the destination type.
fn assign<T>(node: &dyn Addressable) -> Result<T, Error>
where
	T: DeserializeOwned + Clone + 'static,
{
	if let Some(value) = node.as_any().downcast_ref::<T>() {
		return Ok(value.clone());
	}
	if let Some(Reference { value: Some(value), .. }) = node.as_any().downcast_ref::<Reference<T>>()
	{
		return Ok(value.clone());
	}
	let mismatch = || Error::TypeMismatch { expected: type_name::<T>(), got: node.type_name() };
	let value = node.to_value().ok_or_else(mismatch)?;
	serde_json::from_value(value).map_err(|_| mismatch())
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{
		collections::{BTreeMap, HashMap},
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc,
		},
	};

	use parking_lot::Mutex;
	use serde::{Deserialize, Serialize};
	use url::Url;

	use super::{
		super::{
			url as location, Addressable, Config, ConfigInfo, Document, Error, ReadOptions, Reader,
			Registry, Shape,
		},
		Reference,
	};

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct Kind {
		kind: String,
	}

	impl Addressable for Kind {
		fn to_value(&self) -> Option<serde_json::Value> {
			serde_json::to_value(self).ok()
		}
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	struct Api {
		api: String,
		components: BTreeMap<String, Reference<Kind>>,
	}

	impl Addressable for Api {
		fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
			match token {
				"components" => Some(&self.components),
				_ => None,
			}
		}
	}

	impl Document for Api {
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
			for component in self.components.values_mut() {
				component.resolve(config, reader)?;
			}
			Ok(())
		}
	}

	/// Memoizing reader over fixed file contents.
	struct Memory {
		files: HashMap<String, &'static str>,
		configs: Mutex<HashMap<String, Arc<Config>>>,
		registry: Registry,
	}

	impl Memory {
		fn new(files: &[(&str, &'static str)]) -> Self {
			Self {
				files: files.iter().map(|(url, raw)| ((*url).to_owned(), *raw)).collect(),
				configs: Mutex::default(),
				registry: Registry::empty().register::<Api>("api"),
			}
		}
	}

	impl Reader for Memory {
		fn read(&self, url: &Url, options: ReadOptions) -> Result<Arc<Config>, Error> {
			let key = location::key(url);
			let cached = self.configs.lock().get(&key).cloned();
			if let Some(config) = cached {
				options.attach(&config);
				return Ok(config);
			}
			let raw = *self.files.get(&key).ok_or_else(|| Error::UnsupportedScheme(key.clone()))?;
			let mut info_url = url.clone();
			info_url.set_fragment(None);
			let config = options.with_raw(raw).create(ConfigInfo::new("memory", info_url));
			self.configs.lock().insert(key, config.clone());
			config.parse(self)?;
			Ok(config)
		}

		fn registry(&self) -> &Registry {
			&self.registry
		}
	}

	const A: &str = "api: '1'
components:
  foo:
    $ref: b.yml#/components/foo
  bar:
    $ref: '#/components/baz'
  baz:
    kind: Z
";
	const B: &str = "components:\n  foo:\n    kind: X\n";

	fn kind(api: &Config, name: &str) -> Option<Kind> {
		let data = api.data()?;
		data.document::<Api>()?.components.get(name)?.value().cloned()
	}

	#[test]
	fn resolves_across_documents() -> Result<(), Box<dyn std::error::Error>> {
		let reader = Memory::new(&[("file:///a.yml", A), ("file:///b.yml", B)]);
		let a = reader.read(&Url::parse("file:///a.yml")?, ReadOptions::new())?;

		assert_eq!(kind(&a, "foo"), Some(Kind { kind: "X".to_owned() }));
		let b = reader.read(&Url::parse("file:///b.yml")?, ReadOptions::new())?;
		assert_eq!(b.listener_keys(), ["file:///a.yml"]);

		let notified = Arc::new(AtomicUsize::new(0));
		let counter = notified.clone();
		a.add_listener(
			"test",
			Arc::new(move |_: &Config| {
				counter.fetch_add(1, Ordering::SeqCst);
			}),
		);
		b.changed();
		assert_eq!(notified.load(Ordering::SeqCst), 1);
		Ok(())
	}

	#[test]
	fn resolves_within_document() -> Result<(), Box<dyn std::error::Error>> {
		let reader = Memory::new(&[("file:///a.yml", A), ("file:///b.yml", B)]);
		let a = reader.read(&Url::parse("file:///a.yml")?, ReadOptions::new())?;
		assert_eq!(kind(&a, "bar"), Some(Kind { kind: "Z".to_owned() }));
		Ok(())
	}

	#[test]
	fn missing_token_fails_parse() -> Result<(), Box<dyn std::error::Error>> {
		let reader = Memory::new(&[
			("file:///a.yml", "api: '1'\ncomponents:\n  foo:\n    $ref: b.yml#/components/nope\n"),
			("file:///b.yml", B),
		]);
		let err = reader.read(&Url::parse("file:///a.yml")?, ReadOptions::new()).unwrap_err();
		let Error::Parse { source, .. } = err else { panic!("expected a parse error") };
		let Error::Reference { reference, source } = *source else {
			panic!("not a reference error")
		};
		assert_eq!(reference, "b.yml#/components/nope");
		assert!(matches!(*source, Error::InvalidToken(ref token) if token == "nope"));
		Ok(())
	}

	#[test]
	fn plaintext_target_is_unresolved() -> Result<(), Box<dyn std::error::Error>> {
		let reader = Memory::new(&[
			("file:///a.yml", "api: '1'\ncomponents:\n  foo:\n    $ref: notes.txt#/x\n"),
			("file:///notes.txt", "just text"),
		]);
		let err = reader.read(&Url::parse("file:///a.yml")?, ReadOptions::new()).unwrap_err();
		assert!(err.to_string().contains("unresolved path"), "{err}");
		Ok(())
	}

	#[test]
	fn reference_serializes_back() -> Result<(), Box<dyn std::error::Error>> {
		let reference: Reference<Kind> = serde_json::from_str(r##"{"$ref": "#/a"}"##)?;
		assert_eq!(reference, Reference::to("#/a"));
		assert_eq!(serde_json::to_string(&reference)?, r##"{"$ref":"#/a"}"##);
		let inline: Reference<Kind> = serde_json::from_str(r#"{"kind": "X"}"#)?;
		assert_eq!(inline.value(), Some(&Kind { kind: "X".to_owned() }));
		Ok(())
	}
}
