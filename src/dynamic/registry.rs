//! Discriminator based dispatch to typed document shapes.
use std::sync::OnceLock;

use serde::de::DeserializeOwned;

use super::{Document, Shape};
use crate::ldap::directory::DirectoryConfig;

/// A registered document type: documents carrying `header` as a top level
/// key decode into `shape`.
#[derive(Debug, Clone, Copy)]
pub struct ConfigType {
	/// Top level key identifying the document type.
	pub header: &'static str,
	/// Decoder for the document type.
	pub shape: Shape,
}

/// An ordered list of document types. The first type whose header appears
/// in a document wins.
#[derive(Debug, Clone, Default)]
pub struct Registry {
	/// Registered types in lookup order.
	types: Vec<ConfigType>,
}

impl Registry {
	/// A registry without any types.
	#[must_use]
	pub fn empty() -> Self {
		Self::default()
	}

	/// A registry of the built-in document types.
	#[must_use]
	pub fn builtin() -> Self {
		Self::empty().register::<DirectoryConfig>("ldap")
	}

	/// The process wide registry, built once from [`Registry::builtin`].
	pub fn global() -> &'static Registry {
		static GLOBAL: OnceLock<Registry> = OnceLock::new();
		GLOBAL.get_or_init(Registry::builtin)
	}

	/// Add a document type recognized by `header`.
	#[must_use]
	pub fn register<T: Document + DeserializeOwned>(mut self, header: &'static str) -> Self {
		self.types.push(ConfigType { header, shape: Shape::of::<T>() });
		self
	}

	/// The type of a document, by its top level keys.
	#[must_use]
	pub fn lookup(
		&self,
		document: &serde_json::Map<String, serde_json::Value>,
	) -> Option<&ConfigType> {
		self.types.iter().find(|ty| document.contains_key(ty.header))
	}

	/// All registered types.
	pub fn types(&self) -> impl Iterator<Item = &ConfigType> {
		self.types.iter()
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use serde_json::json;

	use super::Registry;

	#[test]
	fn builtin_recognizes_directories() {
		let document = json!({ "ldap": "3", "host": ":389" });
		let ty = Registry::global().lookup(document.as_object().unwrap());
		assert_eq!(ty.map(|ty| ty.header), Some("ldap"));
	}

	#[test]
	fn empty_registry_recognizes_nothing() {
		let document = json!({ "ldap": "3" });
		assert!(Registry::empty().lookup(document.as_object().unwrap()).is_none());
	}
}
