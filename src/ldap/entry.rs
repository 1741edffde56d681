//! In-memory directory entries and filter evaluation.
use std::cmp::Ordering;

use time::OffsetDateTime;

use super::{
	filter::Filter,
	message::{PartialAttribute, SearchEntry},
	result::ResultCode,
};

/// LDAP generalized time, as used by `createTimestamp` and
/// `modifyTimestamp`.
pub const TIME_FORMAT: &[time::format_description::FormatItem] =
	time::macros::format_description!("[year][month][day][hour][minute][second]Z");

/// Operational attributes maintained by the directory.
pub const OPERATIONAL_ATTRIBUTES: [&str; 2] = ["createTimestamp", "modifyTimestamp"];

/// An attribute with its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
	/// Attribute description as first written.
	pub name: String,
	/// Values in insertion order.
	pub values: Vec<String>,
}

/// A directory entry. Attribute names are matched ignoring case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
	/// The DN as written.
	pub dn: String,
	/// The attributes.
	pub attributes: Vec<Attribute>,
}

impl Entry {
	/// An entry without attributes.
	#[must_use]
	pub fn new(dn: impl Into<String>) -> Self {
		Self { dn: dn.into(), attributes: Vec::new() }
	}

	/// An entry from wire attributes. Values are taken as UTF-8.
	#[must_use]
	pub fn from_attributes(dn: impl Into<String>, attributes: Vec<PartialAttribute>) -> Self {
		let mut entry = Self::new(dn);
		for attribute in attributes {
			let values = attribute
				.values
				.iter()
				.map(|value| String::from_utf8_lossy(value).into_owned())
				.collect();
			entry.set(&attribute.name, values);
		}
		entry
	}

	/// Look up an attribute.
	#[must_use]
	pub fn get(&self, name: &str) -> Option<&Attribute> {
		self.attributes.iter().find(|attribute| attribute.name.eq_ignore_ascii_case(name))
	}

	/// Values of an attribute, empty when it is missing.
	#[must_use]
	pub fn values(&self, name: &str) -> &[String] {
		self.get(name).map(|attribute| attribute.values.as_slice()).unwrap_or_default()
	}

	/// The first value of an attribute.
	#[must_use]
	pub fn first(&self, name: &str) -> Option<&str> {
		self.values(name).first().map(String::as_str)
	}

	/// Whether an attribute holds `value`, ignoring case.
	#[must_use]
	pub fn has_value(&self, name: &str, value: &str) -> bool {
		self.values(name).iter().any(|candidate| equal(candidate, value))
	}

	/// Replace all values of an attribute. No values removes it.
	pub fn set(&mut self, name: &str, values: Vec<String>) {
		if values.is_empty() {
			self.remove(name);
			return;
		}
		let existing =
			self.attributes.iter_mut().find(|attribute| attribute.name.eq_ignore_ascii_case(name));
		match existing {
			Some(attribute) => attribute.values = values,
			None => self.attributes.push(Attribute { name: name.to_owned(), values }),
		}
	}

	/// Remove an attribute, returning whether it existed.
	pub fn remove(&mut self, name: &str) -> bool {
		let before = self.attributes.len();
		self.attributes.retain(|attribute| !attribute.name.eq_ignore_ascii_case(name));
		self.attributes.len() != before
	}

	/// Add values to an attribute, creating it when needed. Fails with
	/// `attributeOrValueExists` if any value is already present.
	pub fn add_values(&mut self, name: &str, values: Vec<String>) -> Result<(), ResultCode> {
		if values.iter().any(|value| self.has_value(name, value)) {
			return Err(ResultCode::ATTRIBUTE_OR_VALUE_EXISTS);
		}
		let mut all = self.values(name).to_vec();
		all.extend(values);
		self.set(name, all);
		Ok(())
	}

	/// Remove values from an attribute, or the whole attribute when
	/// `values` is empty. Fails with `noSuchAttribute` when the attribute
	/// or one of the values is missing.
	pub fn remove_values(&mut self, name: &str, values: &[String]) -> Result<(), ResultCode> {
		if self.get(name).is_none() {
			return Err(ResultCode::NO_SUCH_ATTRIBUTE);
		}
		if values.is_empty() {
			self.remove(name);
			return Ok(());
		}
		if !values.iter().all(|value| self.has_value(name, value)) {
			return Err(ResultCode::NO_SUCH_ATTRIBUTE);
		}
		let kept = self
			.values(name)
			.iter()
			.filter(|candidate| !values.iter().any(|value| equal(candidate, value)))
			.cloned()
			.collect();
		self.set(name, kept);
		Ok(())
	}

	/// Stamp a newly created entry.
	pub fn created(&mut self, now: OffsetDateTime) {
		if let Ok(stamp) = now.format(&TIME_FORMAT) {
			self.set("createTimestamp", vec![stamp.clone()]);
			self.set("modifyTimestamp", vec![stamp]);
		}
	}

	/// Stamp a modified entry.
	pub fn modified(&mut self, now: OffsetDateTime) {
		if let Ok(stamp) = now.format(&TIME_FORMAT) {
			self.set("modifyTimestamp", vec![stamp]);
		}
	}

	/// The entry as returned by a search selecting `selection`.
	///
	/// No selection or `*` returns all user attributes, `+` the operational
	/// ones and `1.1` none at all.
	#[must_use]
	pub fn to_search_entry(&self, selection: &[String], types_only: bool) -> SearchEntry {
		let all_user = selection.is_empty() || selection.iter().any(|name| name == "*");
		let all_operational = selection.iter().any(|name| name == "+");
		let attributes = self
			.attributes
			.iter()
			.filter(|attribute| {
				let operational = OPERATIONAL_ATTRIBUTES
					.iter()
					.any(|name| name.eq_ignore_ascii_case(&attribute.name));
				(if operational { all_operational } else { all_user })
					|| selection.iter().any(|name| name.eq_ignore_ascii_case(&attribute.name))
			})
			.map(|attribute| PartialAttribute {
				name: attribute.name.clone(),
				values: if types_only {
					Vec::new()
				} else {
					attribute.values.iter().map(|value| value.as_bytes().to_vec()).collect()
				},
			})
			.collect();
		SearchEntry { dn: self.dn.clone(), attributes }
	}

	/// Evaluate a search filter against the entry.
	#[must_use]
	pub fn matches(&self, filter: &Filter) -> bool {
		match filter {
			Filter::And(filters) => filters.iter().all(|filter| self.matches(filter)),
			Filter::Or(filters) => filters.iter().any(|filter| self.matches(filter)),
			Filter::Not(filter) => !self.matches(filter),
			Filter::Present(attribute) => {
				attribute.eq_ignore_ascii_case("objectClass") || self.get(attribute).is_some()
			}
			Filter::Equality { attribute, value } => {
				let value = String::from_utf8_lossy(value);
				self.values(attribute).iter().any(|candidate| equal(candidate, &value))
			}
			Filter::GreaterOrEqual { attribute, value } => {
				let value = String::from_utf8_lossy(value);
				self.values(attribute).iter().any(|candidate| order(candidate, &value).is_ge())
			}
			Filter::LessOrEqual { attribute, value } => {
				let value = String::from_utf8_lossy(value);
				self.values(attribute).iter().any(|candidate| order(candidate, &value).is_le())
			}
			Filter::Approx { attribute, value } => {
				let value = squash(&String::from_utf8_lossy(value));
				self.values(attribute).iter().any(|candidate| squash(candidate) == value)
			}
			Filter::Substrings { attribute, initial, any, last } => self
				.values(attribute)
				.iter()
				.any(|candidate| substrings(candidate, initial.as_deref(), any, last.as_deref())),
		}
	}
}

/// Equality ignoring case, numeric when both sides are integers.
fn equal(a: &str, b: &str) -> bool {
	order(a, b) == Ordering::Equal
}

/// Ordering ignoring case, numeric when both sides are integers.
fn order(a: &str, b: &str) -> Ordering {
	match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
		(Ok(a), Ok(b)) => a.cmp(&b),
		_ => a.to_lowercase().cmp(&b.to_lowercase()),
	}
}

/// Lowercase without whitespace, for approximate matches.
fn squash(value: &str) -> String {
	value.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_lowercase).collect()
}

/// Match `initial*any*...*last` ignoring case.
fn substrings(
	candidate: &str,
	initial: Option<&[u8]>,
	any: &[Vec<u8>],
	last: Option<&[u8]>,
) -> bool {
	let lower = |bytes: &[u8]| String::from_utf8_lossy(bytes).to_lowercase();
	let candidate = candidate.to_lowercase();
	let mut rest = candidate.as_str();

	if let Some(initial) = initial {
		let initial = lower(initial);
		match rest.strip_prefix(initial.as_str()) {
			Some(tail) => rest = tail,
			None => return false,
		}
	}
	for part in any {
		let part = lower(part);
		match rest.find(part.as_str()) {
			Some(at) => rest = &rest[at + part.len()..],
			None => return false,
		}
	}
	match last {
		Some(last) => rest.ends_with(lower(last).as_str()),
		None => true,
	}
}

/// Byte offsets of the RDN separating commas of a DN, skipping escaped
/// ones.
fn separators(dn: &str) -> Vec<usize> {
	let mut positions = Vec::new();
	let mut escaped = false;
	for (at, c) in dn.char_indices() {
		match c {
			_ if escaped => escaped = false,
			'\\' => escaped = true,
			',' => positions.push(at),
			_ => {}
		}
	}
	positions
}

/// Canonical form of a DN for comparisons: RDNs trimmed and lowercased.
#[must_use]
pub fn normalize_dn(dn: &str) -> String {
	let mut parts = Vec::new();
	let mut start = 0;
	for at in separators(dn).into_iter().chain([dn.len()]) {
		let rdn = &dn[start..at];
		let rdn = match rdn.split_once('=') {
			Some((name, value)) => format!("{}={}", name.trim(), value.trim()),
			None => rdn.trim().to_owned(),
		};
		parts.push(rdn.to_lowercase());
		start = at + 1;
	}
	if parts.iter().all(String::is_empty) {
		return String::new();
	}
	parts.join(",")
}

/// The leading RDN and the parent DN.
#[must_use]
pub fn split_dn(dn: &str) -> (&str, &str) {
	match separators(dn).first() {
		Some(&at) => (&dn[..at], dn[at + 1..].trim_start()),
		None => (dn, ""),
	}
}

/// Whether normalized `dn` lies strictly below normalized `base`.
#[must_use]
pub fn is_descendant(dn: &str, base: &str) -> bool {
	if base.is_empty() {
		return !dn.is_empty();
	}
	dn.len() > base.len() && dn.ends_with(base) && dn[..dn.len() - base.len()].ends_with(',')
}

#[cfg(test)]
mod tests {
	use time::macros::datetime;

	use super::{is_descendant, normalize_dn, split_dn, Entry};
	use crate::ldap::{filter::Filter, result::ResultCode};

	/// A person entry.
	fn alice() -> Entry {
		let mut entry = Entry::new("cn=alice,ou=people,dc=example");
		entry.set("objectClass", vec!["person".to_owned(), "top".to_owned()]);
		entry.set("cn", vec!["Alice".to_owned()]);
		entry.set("sn", vec!["Liddell".to_owned()]);
		entry.set("uidNumber", vec!["1001".to_owned()]);
		entry.set("description", vec!["Curious  Reader".to_owned()]);
		entry
	}

	#[test]
	fn evaluates_filters() -> Result<(), Box<dyn std::error::Error>> {
		let entry = alice();
		let cases = [
			("(objectClass=*)", true),
			("(cn=alice)", true),
			("(CN=ALICE)", true),
			("(cn=bob)", false),
			("(&(objectClass=person)(sn=Lid*))", true),
			("(|(cn=bob)(sn=*dell))", true),
			("(!(cn=alice))", false),
			("(cn=*l*c*)", true),
			("(cn=*c*l*)", false),
			("(uidNumber>=1000)", true),
			("(uidNumber<=999)", false),
			("(uidNumber=01001)", true),
			("(description~=curiousreader)", true),
			("(mail=*)", false),
		];
		for (filter, expected) in cases {
			assert_eq!(entry.matches(&Filter::parse(filter)?), expected, "{filter}");
		}
		Ok(())
	}

	#[test]
	fn modifies_values() {
		let mut entry = alice();
		assert_eq!(
			entry.add_values("CN", vec!["alice".to_owned()]),
			Err(ResultCode::ATTRIBUTE_OR_VALUE_EXISTS)
		);
		assert_eq!(entry.add_values("mail", vec!["a@example.com".to_owned()]), Ok(()));
		assert_eq!(entry.first("MAIL"), Some("a@example.com"));
		assert_eq!(entry.remove_values("telephoneNumber", &[]), Err(ResultCode::NO_SUCH_ATTRIBUTE));
		assert_eq!(
			entry.remove_values("objectClass", &["group".to_owned()]),
			Err(ResultCode::NO_SUCH_ATTRIBUTE)
		);
		assert_eq!(entry.remove_values("objectClass", &["TOP".to_owned()]), Ok(()));
		assert_eq!(entry.values("objectClass"), ["person"]);
		assert_eq!(entry.remove_values("mail", &[]), Ok(()));
		assert!(entry.get("mail").is_none());
	}

	#[test]
	fn selects_attributes() {
		let mut entry = alice();
		entry.created(datetime!(2024-03-01 12:30:00 UTC));
		assert_eq!(entry.first("createTimestamp"), Some("20240301123000Z"));

		let names = |selection: &[&str]| {
			let selection: Vec<String> = selection.iter().map(|name| (*name).to_owned()).collect();
			entry
				.to_search_entry(&selection, false)
				.attributes
				.into_iter()
				.map(|attribute| attribute.name)
				.collect::<Vec<_>>()
		};
		assert_eq!(names(&[]), ["objectClass", "cn", "sn", "uidNumber", "description"]);
		assert_eq!(names(&["1.1"]), Vec::<String>::new());
		assert_eq!(names(&["cn", "modifyTimestamp"]), ["cn", "modifyTimestamp"]);
		assert_eq!(names(&["+"]), ["createTimestamp", "modifyTimestamp"]);

		let types_only = entry.to_search_entry(&[], true);
		assert!(types_only.attributes.iter().all(|attribute| attribute.values.is_empty()));
	}

	#[test]
	fn dn_helpers() {
		assert_eq!(normalize_dn(" CN=Foo , dc=Example"), "cn=foo,dc=example");
		assert_eq!(normalize_dn(""), "");
		assert_eq!(split_dn("cn=a\\,b,dc=example,dc=com"), ("cn=a\\,b", "dc=example,dc=com"));
		assert_eq!(split_dn("dc=com"), ("dc=com", ""));
		assert!(is_descendant("cn=a,dc=example", "dc=example"));
		assert!(!is_descendant("cn=a,xdc=example", "dc=example"));
		assert!(!is_descendant("dc=example", "dc=example"));
		assert!(is_descendant("dc=example", ""));
	}
}
