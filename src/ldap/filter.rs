//! RFC 4515 search filters: parsing, BER conversion and the canonical
//! string form.
use std::fmt::{self, Write as _};

use lber::{
	common::TagClass,
	structure::{StructureTag, PL},
};

use super::ber;

/// Context tags of the filter CHOICE.
mod tags {
	/// and
	pub const AND: u64 = 0;
	/// or
	pub const OR: u64 = 1;
	/// not
	pub const NOT: u64 = 2;
	/// equalityMatch
	pub const EQUALITY: u64 = 3;
	/// substrings
	pub const SUBSTRINGS: u64 = 4;
	/// greaterOrEqual
	pub const GREATER_OR_EQUAL: u64 = 5;
	/// lessOrEqual
	pub const LESS_OR_EQUAL: u64 = 6;
	/// present
	pub const PRESENT: u64 = 7;
	/// approxMatch
	pub const APPROX: u64 = 8;
	/// substrings initial component
	pub const INITIAL: u64 = 0;
	/// substrings any component
	pub const ANY: u64 = 1;
	/// substrings final component
	pub const FINAL: u64 = 2;
}

/// A malformed filter, with the input consumed up to the failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("filter syntax error after {prefix:?}: {reason}")]
pub struct FilterError {
	/// The input up to the offending position.
	pub prefix: String,
	/// What went wrong.
	pub reason: String,
}

impl FilterError {
	/// An error without input position, for BER decoding.
	fn encoding(reason: impl Into<String>) -> Self {
		Self { prefix: String::new(), reason: reason.into() }
	}
}

/// A search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
	/// All of the filters match.
	And(Vec<Filter>),
	/// Any of the filters matches.
	Or(Vec<Filter>),
	/// The filter does not match.
	Not(Box<Filter>),
	/// `(attr=value)`
	Equality {
		/// Attribute description.
		attribute: String,
		/// Assertion value.
		value: Vec<u8>,
	},
	/// `(attr=initial*any*final)`
	Substrings {
		/// Attribute description.
		attribute: String,
		/// Required prefix.
		initial: Option<Vec<u8>>,
		/// Required infixes, in order.
		any: Vec<Vec<u8>>,
		/// Required suffix.
		last: Option<Vec<u8>>,
	},
	/// `(attr>=value)`
	GreaterOrEqual {
		/// Attribute description.
		attribute: String,
		/// Assertion value.
		value: Vec<u8>,
	},
	/// `(attr<=value)`
	LessOrEqual {
		/// Attribute description.
		attribute: String,
		/// Assertion value.
		value: Vec<u8>,
	},
	/// `(attr=*)`
	Present(String),
	/// `(attr~=value)`
	Approx {
		/// Attribute description.
		attribute: String,
		/// Assertion value.
		value: Vec<u8>,
	},
}

/// Compile a filter string to its BER form.
pub fn compile(input: &str) -> Result<StructureTag, FilterError> {
	Ok(Filter::parse(input)?.encode())
}

/// Render the BER form of a filter as a string.
pub fn decompile(tag: &StructureTag) -> Result<String, FilterError> {
	Ok(Filter::decode(tag)?.to_string())
}

impl Filter {
	/// Parse a filter string.
	pub fn parse(input: &str) -> Result<Self, FilterError> {
		let mut parser = Parser { input, pos: 0 };
		let filter = parser.filter()?;
		parser.skip_whitespace();
		if parser.pos != input.len() {
			return Err(parser.error("trailing characters after filter"));
		}
		Ok(filter)
	}

	/// The BER form.
	#[must_use]
	pub fn encode(&self) -> StructureTag {
		let context = |id, children| ber::constructed(TagClass::Context, id, children);
		let assertion = |id, attribute: &str, value: &[u8]| {
			context(id, vec![ber::octet_string(attribute.as_bytes()), ber::octet_string(value)])
		};
		match self {
			Self::And(filters) => context(tags::AND, filters.iter().map(Self::encode).collect()),
			Self::Or(filters) => context(tags::OR, filters.iter().map(Self::encode).collect()),
			Self::Not(filter) => context(tags::NOT, vec![filter.encode()]),
			Self::Equality { attribute, value } => assertion(tags::EQUALITY, attribute, value),
			Self::GreaterOrEqual { attribute, value } => {
				assertion(tags::GREATER_OR_EQUAL, attribute, value)
			}
			Self::LessOrEqual { attribute, value } => {
				assertion(tags::LESS_OR_EQUAL, attribute, value)
			}
			Self::Approx { attribute, value } => assertion(tags::APPROX, attribute, value),
			Self::Present(attribute) => {
				ber::primitive(TagClass::Context, tags::PRESENT, attribute.as_bytes())
			}
			Self::Substrings { attribute, initial, any, last } => {
				let mut parts = Vec::new();
				if let Some(initial) = initial {
					parts.push(ber::primitive(TagClass::Context, tags::INITIAL, initial.clone()));
				}
				for part in any {
					parts.push(ber::primitive(TagClass::Context, tags::ANY, part.clone()));
				}
				if let Some(last) = last {
					parts.push(ber::primitive(TagClass::Context, tags::FINAL, last.clone()));
				}
				context(
					tags::SUBSTRINGS,
					vec![ber::octet_string(attribute.as_bytes()), ber::sequence(parts)],
				)
			}
		}
	}

	/// Decode the BER form.
	pub fn decode(tag: &StructureTag) -> Result<Self, FilterError> {
		if tag.class != TagClass::Context {
			return Err(FilterError::encoding(format!("filter with {:?} class", tag.class)));
		}
		match (tag.id, &tag.payload) {
			(tags::AND, PL::C(children)) => Ok(Self::And(Self::decode_list(children)?)),
			(tags::OR, PL::C(children)) => Ok(Self::Or(Self::decode_list(children)?)),
			(tags::NOT, PL::C(children)) => match children.as_slice() {
				[inner] => Ok(Self::Not(Box::new(Self::decode(inner)?))),
				_ => Err(FilterError::encoding("not must wrap exactly one filter")),
			},
			(tags::EQUALITY, PL::C(children)) => {
				let (attribute, value) = assertion(children)?;
				Ok(Self::Equality { attribute, value })
			}
			(tags::GREATER_OR_EQUAL, PL::C(children)) => {
				let (attribute, value) = assertion(children)?;
				Ok(Self::GreaterOrEqual { attribute, value })
			}
			(tags::LESS_OR_EQUAL, PL::C(children)) => {
				let (attribute, value) = assertion(children)?;
				Ok(Self::LessOrEqual { attribute, value })
			}
			(tags::APPROX, PL::C(children)) => {
				let (attribute, value) = assertion(children)?;
				Ok(Self::Approx { attribute, value })
			}
			(tags::PRESENT, PL::P(attribute)) => Ok(Self::Present(utf8(attribute)?)),
			(tags::SUBSTRINGS, PL::C(children)) => {
				let [attribute, parts] = children.as_slice() else {
					return Err(FilterError::encoding("substrings needs a type and components"));
				};
				let PL::P(attribute) = &attribute.payload else {
					return Err(FilterError::encoding("substrings type must be primitive"));
				};
				let PL::C(parts) = &parts.payload else {
					return Err(FilterError::encoding("substrings components must be a sequence"));
				};
				let (mut initial, mut any, mut last) = (None, Vec::new(), None);
				for part in parts {
					let PL::P(bytes) = &part.payload else {
						return Err(FilterError::encoding("substring component must be primitive"));
					};
					if bytes.is_empty() {
						return Err(FilterError::encoding("empty substring component"));
					}
					match part.id {
						tags::INITIAL if initial.is_none() && any.is_empty() && last.is_none() => {
							initial = Some(bytes.clone());
						}
						tags::ANY if last.is_none() => any.push(bytes.clone()),
						tags::FINAL if last.is_none() => last = Some(bytes.clone()),
						id => {
							return Err(FilterError::encoding(format!(
								"misplaced substring component {id}"
							)))
						}
					}
				}
				if initial.is_none() && any.is_empty() && last.is_none() {
					return Err(FilterError::encoding("substrings without components"));
				}
				Ok(Self::Substrings { attribute: utf8(attribute)?, initial, any, last })
			}
			(id, _) => Err(FilterError::encoding(format!("unsupported filter tag {id}"))),
		}
	}

	/// Decode the members of `and` and `or`.
	fn decode_list(children: &[StructureTag]) -> Result<Vec<Self>, FilterError> {
		if children.is_empty() {
			return Err(FilterError::encoding("empty filter set"));
		}
		children.iter().map(Self::decode).collect()
	}
}

/// Decode an `AttributeValueAssertion`.
fn assertion(children: &[StructureTag]) -> Result<(String, Vec<u8>), FilterError> {
	match children {
		[
			StructureTag { payload: PL::P(attribute), .. },
			StructureTag { payload: PL::P(value), .. },
		] => {
			Ok((utf8(attribute)?, value.clone()))
		}
		_ => Err(FilterError::encoding("assertion needs a type and a value")),
	}
}

/// An attribute description from the wire.
fn utf8(bytes: &[u8]) -> Result<String, FilterError> {
	String::from_utf8(bytes.to_vec()).map_err(|_| FilterError::encoding("attribute is not UTF-8"))
}

/// Escape an assertion value for the string form.
fn escape(out: &mut String, value: &[u8]) {
	let special = |c: char| matches!(c, '*' | '(' | ')' | '\\' | '\0');
	match std::str::from_utf8(value) {
		Ok(text) => {
			for c in text.chars() {
				if special(c) || c.is_control() {
					for byte in c.to_string().bytes() {
						let _ = write!(out, "\\{byte:02x}");
					}
				} else {
					out.push(c);
				}
			}
		}
		Err(_) => {
			for &byte in value {
				if (byte.is_ascii_graphic() && !special(char::from(byte))) || byte == b' ' {
					out.push(char::from(byte));
				} else {
					let _ = write!(out, "\\{byte:02x}");
				}
			}
		}
	}
}

impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let item = |f: &mut fmt::Formatter<'_>, attribute: &str, op: &str, value: &[u8]| {
			let mut escaped = String::new();
			escape(&mut escaped, value);
			write!(f, "({attribute}{op}{escaped})")
		};
		match self {
			Self::And(filters) | Self::Or(filters) => {
				f.write_str(if matches!(self, Self::And(_)) { "(&" } else { "(|" })?;
				for filter in filters {
					write!(f, "{filter}")?;
				}
				f.write_str(")")
			}
			Self::Not(filter) => write!(f, "(!{filter})"),
			Self::Equality { attribute, value } => item(f, attribute, "=", value),
			Self::GreaterOrEqual { attribute, value } => item(f, attribute, ">=", value),
			Self::LessOrEqual { attribute, value } => item(f, attribute, "<=", value),
			Self::Approx { attribute, value } => item(f, attribute, "~=", value),
			Self::Present(attribute) => write!(f, "({attribute}=*)"),
			Self::Substrings { attribute, initial, any, last } => {
				let mut pattern = String::new();
				if let Some(initial) = initial {
					escape(&mut pattern, initial);
				}
				pattern.push('*');
				for part in any {
					escape(&mut pattern, part);
					pattern.push('*');
				}
				if let Some(last) = last {
					escape(&mut pattern, last);
				}
				write!(f, "({attribute}={pattern})")
			}
		}
	}
}

/// Comparison operators of simple items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
	/// `=`
	Equal,
	/// `>=`
	GreaterOrEqual,
	/// `<=`
	LessOrEqual,
	/// `~=`
	Approx,
}

/// Recursive descent over a filter string.
struct Parser<'a> {
	/// The whole input.
	input: &'a str,
	/// Byte offset of the next character.
	pos: usize,
}

impl Parser<'_> {
	/// An error citing the input consumed so far.
	fn error(&self, reason: impl Into<String>) -> FilterError {
		FilterError { prefix: self.input[..self.pos].to_owned(), reason: reason.into() }
	}

	/// The next character.
	fn peek(&self) -> Option<char> {
		self.input[self.pos..].chars().next()
	}

	/// Consume the next character.
	fn bump(&mut self) -> Option<char> {
		let c = self.peek()?;
		self.pos += c.len_utf8();
		Some(c)
	}

	/// Skip whitespace between filters.
	fn skip_whitespace(&mut self) {
		while self.peek().is_some_and(char::is_whitespace) {
			self.bump();
		}
	}

	/// `filter = '(' filtercomp ')'`
	fn filter(&mut self) -> Result<Filter, FilterError> {
		self.skip_whitespace();
		match self.peek() {
			Some('(') => {
				self.bump();
			}
			Some(_) => return Err(self.error("filter must start with '('")),
			None => return Err(self.error("unterminated filter")),
		}
		let filter = match self.peek() {
			Some('&') => {
				self.bump();
				Filter::And(self.list()?)
			}
			Some('|') => {
				self.bump();
				Filter::Or(self.list()?)
			}
			Some('!') => {
				self.bump();
				Filter::Not(Box::new(self.filter()?))
			}
			Some(_) => self.item()?,
			None => return Err(self.error("unterminated filter")),
		};
		self.skip_whitespace();
		match self.bump() {
			Some(')') => Ok(filter),
			Some(_) => Err(self.error("expected ')'")),
			None => Err(self.error("unterminated filter")),
		}
	}

	/// One or more filters of `and` and `or`.
	fn list(&mut self) -> Result<Vec<Filter>, FilterError> {
		let mut filters = Vec::new();
		loop {
			self.skip_whitespace();
			if self.peek() != Some('(') {
				break;
			}
			filters.push(self.filter()?);
		}
		if filters.is_empty() {
			return Err(self.error("expected at least one filter"));
		}
		Ok(filters)
	}

	/// `item = simple | substring | present`
	fn item(&mut self) -> Result<Filter, FilterError> {
		let start = self.pos;
		while let Some(c) = self.peek() {
			if matches!(c, '=' | '<' | '>' | '~' | '(' | ')') {
				break;
			}
			self.bump();
		}
		let attribute = self.input[start..self.pos].to_owned();
		if attribute.is_empty() || attribute.contains(char::is_whitespace) {
			return Err(self.error("invalid attribute description"));
		}
		if attribute.contains(':') {
			return Err(self.error("unsupported operator: extensible match"));
		}

		let operator = match self.bump() {
			Some('=') => Operator::Equal,
			Some(c @ ('>' | '<' | '~')) => {
				if self.bump() != Some('=') {
					return Err(self.error(format!("unsupported operator {c:?}")));
				}
				match c {
					'>' => Operator::GreaterOrEqual,
					'<' => Operator::LessOrEqual,
					_ => Operator::Approx,
				}
			}
			Some(c) => return Err(self.error(format!("unsupported operator {c:?}"))),
			None => return Err(self.error("unterminated filter")),
		};

		let start = self.pos;
		while let Some(c) = self.peek() {
			match c {
				')' => break,
				'(' => return Err(self.error("unexpected '(' in value")),
				_ => {
					self.bump();
				}
			}
		}
		let raw = &self.input[start..self.pos];

		match operator {
			Operator::Equal if raw == "*" => Ok(Filter::Present(attribute)),
			Operator::Equal if raw.contains('*') => {
				let parts: Vec<&str> = raw.split('*').collect();
				let last_index = parts.len() - 1;
				let mut any = Vec::new();
				for part in &parts[1..last_index] {
					if part.is_empty() {
						return Err(self.error("empty substring component"));
					}
					any.push(self.unescape(part)?);
				}
				let initial = match parts[0] {
					"" => None,
					part => Some(self.unescape(part)?),
				};
				let last = match parts[last_index] {
					"" => None,
					part => Some(self.unescape(part)?),
				};
				Ok(Filter::Substrings { attribute, initial, any, last })
			}
			_ if raw.contains('*') => Err(self.error("wildcard not allowed with this operator")),
			Operator::Equal => Ok(Filter::Equality { attribute, value: self.unescape(raw)? }),
			Operator::GreaterOrEqual => {
				Ok(Filter::GreaterOrEqual { attribute, value: self.unescape(raw)? })
			}
			Operator::LessOrEqual => {
				Ok(Filter::LessOrEqual { attribute, value: self.unescape(raw)? })
			}
			Operator::Approx => Ok(Filter::Approx { attribute, value: self.unescape(raw)? }),
		}
	}

	/// Decode `\xx` escapes.
	fn unescape(&self, raw: &str) -> Result<Vec<u8>, FilterError> {
		let mut out = Vec::with_capacity(raw.len());
		let bytes = raw.as_bytes();
		let mut i = 0;
		while i < bytes.len() {
			if bytes[i] == b'\\' {
				let hex =
					raw.get(i + 1..i + 3).filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()));
				let Some(hex) = hex else {
					return Err(self.error("invalid escape sequence"));
				};
				let byte =
					u8::from_str_radix(hex, 16).map_err(|_| self.error("invalid escape sequence"))?;
				out.push(byte);
				i += 3;
			} else {
				out.push(bytes[i]);
				i += 1;
			}
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use lber::common::TagClass;

	use super::{compile, decompile, Filter, FilterError};

	#[test]
	fn nested_filter_round_trips() -> Result<(), Box<dyn std::error::Error>> {
		let input = "(|(&(attribute=abc)(foo=bar))(&(attribute=abc)(bar=foo)))";
		assert_eq!(decompile(&compile(input)?)?, input);
		for input in [
			"(!(cn=foo))",
			"(cn=*)",
			"(cn=a*)",
			"(cn=*b)",
			"(cn=a*b*c)",
			"(uidNumber>=1000)",
			"(uidNumber<=2000)",
			"(sn~=smith)",
			"(cn=a\\2ab)",
		] {
			assert_eq!(decompile(&compile(input)?)?, input);
		}
		Ok(())
	}

	#[test]
	fn tags_of_items() -> Result<(), Box<dyn std::error::Error>> {
		let present = compile("(objectClass=*)")?;
		assert_eq!((present.class, present.id), (TagClass::Context, 7));
		assert_eq!(compile("(cn=a*)")?.id, 4);
		assert_eq!(compile("(a>=1)")?.id, 5);
		assert_eq!(compile("(a<=1)")?.id, 6);
		assert_eq!(compile("(a~=1)")?.id, 8);
		assert_eq!(
			Filter::parse("(cn=a*b*c)")?,
			Filter::Substrings {
				attribute: "cn".to_owned(),
				initial: Some(b"a".to_vec()),
				any: vec![b"b".to_vec()],
				last: Some(b"c".to_vec()),
			}
		);
		Ok(())
	}

	#[test]
	fn whitespace_between_filters_is_ignored() -> Result<(), Box<dyn std::error::Error>> {
		assert_eq!(Filter::parse(" (& (a=b) (c=d) ) ")?.to_string(), "(&(a=b)(c=d))");
		Ok(())
	}

	#[test]
	fn syntax_errors_cite_prefix() {
		let prefix = |input: &str| Filter::parse(input).unwrap_err().prefix;
		assert_eq!(prefix("cn=foo"), "");
		assert_eq!(prefix("(cn=foo"), "(cn=foo");
		assert_eq!(prefix("(&(cn=foo)"), "(&(cn=foo)");
		assert_eq!(prefix("(cn:=foo)"), "(cn:");
		assert_eq!(prefix("(cn=foo))"), "(cn=foo)");
		assert!(matches!(Filter::parse("(&)"), Err(FilterError { .. })));
		assert!(Filter::parse("(cn=\\zz)").is_err());
		assert!(Filter::parse("(cn>=a*)").is_err());
	}

	#[test]
	fn empty_substring_components_are_rejected() {
		for input in ["(cn=**)", "(cn=a**b)", "(cn=*a**)", "(cn=a***)"] {
			let err = Filter::parse(input).unwrap_err();
			assert_eq!(err.reason, "empty substring component", "{input}");
			assert_eq!(err.prefix, &input[..input.len() - 1]);
			assert!(compile(input).is_err());
		}
		assert_eq!(Filter::parse("(cn=*a*)").unwrap().to_string(), "(cn=*a*)");

		let substrings = |parts| {
			super::ber::constructed(
				TagClass::Context,
				4,
				vec![super::ber::octet_string(b"cn"), super::ber::sequence(parts)],
			)
		};
		let empty_any = vec![super::ber::primitive(TagClass::Context, 1, Vec::new())];
		assert!(decompile(&substrings(empty_any)).is_err());
		assert!(decompile(&substrings(Vec::new())).is_err());
	}

	#[test]
	fn unsupported_tags_fail_to_decode() {
		let extensible = super::ber::constructed(TagClass::Context, 9, Vec::new());
		assert!(decompile(&extensible).is_err());
	}
}
