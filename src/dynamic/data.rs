//! Parsed representations of configuration documents.
use std::{
	any::{type_name, Any},
	collections::{BTreeMap, HashMap},
	fmt,
	sync::Arc,
};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use super::{Config, Error, Reader};

/// Access to the concrete type behind a trait object.
pub trait AsAny {
	/// Upcast to [`Any`] for downcasting.
	fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// A value a reference path can walk into.
///
/// Containers resolve one path token at a time; leaves resolve nothing.
/// `to_value` exposes a serialized form so a resolved node can be assigned
/// into a destination of a different but compatible type.
pub trait Addressable: AsAny + Send + Sync + fmt::Debug {
	/// Resolve one token of a reference path.
	fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
		let _ = token;
		None
	}

	/// A serialized copy of the node, if it has one.
	fn to_value(&self) -> Option<serde_json::Value> {
		None
	}

	/// Name of the concrete type, used in diagnostics.
	fn type_name(&self) -> &'static str {
		type_name::<Self>()
	}
}

/// A typed document produced by the parser registry.
pub trait Document: Addressable + 'static {
	/// How to decode a fresh document of the same type.
	fn shape(&self) -> Shape;

	/// Clone into a new box.
	fn clone_document(&self) -> Box<dyn Document>;

	/// View as the addressable root of a reference walk.
	fn as_addressable(&self) -> &dyn Addressable;

	/// Post-decode hook, typically used to resolve references. `config` is
	/// the record this document belongs to.
	fn parse(&mut self, config: &Config, reader: &dyn Reader) -> Result<(), Error> {
		let _ = (config, reader);
		Ok(())
	}
}

impl Clone for Box<dyn Document> {
	fn clone(&self) -> Self {
		self.clone_document()
	}
}

/// Decodes a generic value into a particular document type.
#[derive(Clone, Copy)]
pub struct Shape {
	/// Name of the target type.
	name: &'static str,
	/// Decoder into the target type.
	decode: fn(serde_json::Value) -> Result<Box<dyn Document>, serde_json::Error>,
}

impl Shape {
	/// The shape of document type `T`.
	#[must_use]
	pub fn of<T: Document + DeserializeOwned>() -> Self {
		Self { name: type_name::<T>(), decode: decode_as::<T> }
	}

	/// Name of the target type.
	#[must_use]
	pub fn name(&self) -> &'static str {
		self.name
	}

	/// Decode `value` into the target type.
	pub fn decode(&self, value: serde_json::Value) -> Result<Box<dyn Document>, serde_json::Error> {
		(self.decode)(value)
	}
}

impl fmt::Debug for Shape {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("Shape").field(&self.name).finish()
	}
}

/// Monomorphized decoder behind [`Shape::of`].
fn decode_as<T: Document + DeserializeOwned>(
	value: serde_json::Value,
) -> Result<Box<dyn Document>, serde_json::Error> {
	Ok(Box::new(serde_json::from_value::<T>(value)?))
}

/// Source code of a script document. Clones share the code cell, so a new
/// revision updates every holder in place.
#[derive(Debug, Clone)]
pub struct Script {
	/// File name the script was loaded from.
	pub filename: String,
	/// Current source code.
	code: Arc<RwLock<String>>,
}

impl Script {
	/// A script with initial source.
	#[must_use]
	pub fn new(filename: impl Into<String>, code: impl Into<String>) -> Self {
		Self { filename: filename.into(), code: Arc::new(RwLock::new(code.into())) }
	}

	/// The current source.
	#[must_use]
	pub fn code(&self) -> String {
		self.code.read().clone()
	}

	/// Replace the source of this script and every clone of it.
	pub fn set_code(&self, code: impl Into<String>) {
		*self.code.write() = code.into();
	}

	/// Whether two handles refer to the same script.
	#[must_use]
	pub fn same(&self, other: &Script) -> bool {
		Arc::ptr_eq(&self.code, &other.code)
	}
}

/// The parsed content of one config revision.
#[derive(Debug, Clone)]
pub enum Data {
	/// Raw content as text.
	Text(String),
	/// Structured content without a registered shape.
	Value(serde_json::Value),
	/// A script body.
	Script(Script),
	/// A typed document.
	Document(Box<dyn Document>),
}

impl Data {
	/// The text, for plaintext data.
	#[must_use]
	pub fn as_text(&self) -> Option<&str> {
		match self {
			Data::Text(text) => Some(text),
			_ => None,
		}
	}

	/// The typed document, if it is a `T`.
	#[must_use]
	pub fn document<T: Document>(&self) -> Option<&T> {
		match self {
			Data::Document(doc) => (**doc).as_any().downcast_ref::<T>(),
			_ => None,
		}
	}

	/// The root of a reference walk into this data.
	#[must_use]
	pub fn root(&self) -> Option<&dyn Addressable> {
		match self {
			Data::Value(value) => Some(value),
			Data::Document(doc) => Some(doc.as_addressable()),
			Data::Text(_) | Data::Script(_) => None,
		}
	}
}

impl Addressable for serde_json::Value {
	fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
		match self {
			serde_json::Value::Object(map) => map.get(token).map(|v| v as &dyn Addressable),
			serde_json::Value::Array(items) => {
				let item = token.parse::<usize>().ok().and_then(|i| items.get(i));
				item.map(|v| v as &dyn Addressable)
			}
			_ => None,
		}
	}

	fn to_value(&self) -> Option<serde_json::Value> {
		Some(self.clone())
	}
}

/// Leaf types serialize to themselves and resolve nothing.
macro_rules! leaf {
	($($ty:ty),*) => {
		$(impl Addressable for $ty {
			fn to_value(&self) -> Option<serde_json::Value> {
				serde_json::to_value(self).ok()
			}
		})*
	};
}

leaf!(String, bool, i32, i64, u32, u64, f64);

impl<T: Addressable + Serialize + 'static> Addressable for Vec<T> {
	fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
		token.parse::<usize>().ok().and_then(|i| self.get(i)).map(|v| v as &dyn Addressable)
	}

	fn to_value(&self) -> Option<serde_json::Value> {
		serde_json::to_value(self).ok()
	}
}

impl<T: Addressable + Serialize + 'static> Addressable for BTreeMap<String, T> {
	fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
		self.get(token).map(|v| v as &dyn Addressable)
	}

	fn to_value(&self) -> Option<serde_json::Value> {
		serde_json::to_value(self).ok()
	}
}

impl<T: Addressable + Serialize + 'static> Addressable for HashMap<String, T> {
	fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
		self.get(token).map(|v| v as &dyn Addressable)
	}

	fn to_value(&self) -> Option<serde_json::Value> {
		serde_json::to_value(self).ok()
	}
}

impl<T: Addressable + 'static> Addressable for Option<T> {
	fn resolve_token(&self, token: &str) -> Option<&dyn Addressable> {
		self.as_ref()?.resolve_token(token)
	}

	fn to_value(&self) -> Option<serde_json::Value> {
		self.as_ref()?.to_value()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::{Addressable, Data, Script};

	#[test]
	fn value_walks_objects_and_arrays() {
		let value = json!({ "servers": [{ "url": "ldap://localhost" }] });
		let node = value
			.resolve_token("servers")
			.and_then(|n| n.resolve_token("0"))
			.and_then(|n| n.resolve_token("url"))
			.and_then(Addressable::to_value);
		assert_eq!(node, Some(json!("ldap://localhost")));
		assert!(value.resolve_token("clients").is_none());
	}

	#[test]
	fn script_clones_share_code() {
		let script = Script::new("handler.js", "export default 1");
		let data = Data::Script(script.clone());
		script.set_code("export default 2");
		match data {
			Data::Script(held) => {
				assert!(held.same(&script));
				assert_eq!(held.code(), "export default 2");
			}
			other => panic!("unexpected data {other:?}"),
		}
	}

	#[test]
	fn plaintext_has_no_root() {
		assert!(Data::Text("hello".to_owned()).root().is_none());
		assert_eq!(Data::Text("hello".to_owned()).as_text(), Some("hello"));
	}
}
