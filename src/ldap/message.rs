//! RFC 4511 protocol messages.
use std::vec;

use lber::{
	common::TagClass,
	structure::{StructureTag, PL},
};

use super::{
	ber,
	control::{self, Control},
	filter::{Filter, FilterError},
	result::LdapResult,
	Error,
};

/// Application tags of the protocol operations.
mod app {
	/// BindRequest.
	pub const BIND_REQUEST: u64 = 0;
	/// BindResponse.
	pub const BIND_RESPONSE: u64 = 1;
	/// UnbindRequest.
	pub const UNBIND_REQUEST: u64 = 2;
	/// SearchRequest.
	pub const SEARCH_REQUEST: u64 = 3;
	/// SearchResultEntry.
	pub const SEARCH_RESULT_ENTRY: u64 = 4;
	/// SearchResultDone.
	pub const SEARCH_RESULT_DONE: u64 = 5;
	/// ModifyRequest.
	pub const MODIFY_REQUEST: u64 = 6;
	/// ModifyResponse.
	pub const MODIFY_RESPONSE: u64 = 7;
	/// AddRequest.
	pub const ADD_REQUEST: u64 = 8;
	/// AddResponse.
	pub const ADD_RESPONSE: u64 = 9;
	/// DelRequest.
	pub const DELETE_REQUEST: u64 = 10;
	/// DelResponse.
	pub const DELETE_RESPONSE: u64 = 11;
	/// ModifyDNRequest.
	pub const MODIFY_DN_REQUEST: u64 = 12;
	/// ModifyDNResponse.
	pub const MODIFY_DN_RESPONSE: u64 = 13;
	/// CompareRequest.
	pub const COMPARE_REQUEST: u64 = 14;
	/// CompareResponse.
	pub const COMPARE_RESPONSE: u64 = 15;
	/// AbandonRequest.
	pub const ABANDON_REQUEST: u64 = 16;
	/// SearchResultReference.
	pub const SEARCH_RESULT_REFERENCE: u64 = 19;
	/// ExtendedRequest.
	pub const EXTENDED_REQUEST: u64 = 23;
	/// ExtendedResponse.
	pub const EXTENDED_RESPONSE: u64 = 24;
}

/// Context tag of simple bind credentials.
const AUTH_SIMPLE: u64 = 0;
/// Context tag of SASL bind credentials.
const AUTH_SASL: u64 = 3;
/// Context tag of the new superior of a ModifyDN request.
const NEW_SUPERIOR: u64 = 0;
/// Context tag of the name of an extended request.
const EXTENDED_REQUEST_NAME: u64 = 0;
/// Context tag of the value of an extended request.
const EXTENDED_REQUEST_VALUE: u64 = 1;
/// Context tag of the name of an extended response.
const EXTENDED_RESPONSE_NAME: u64 = 10;
/// Context tag of the value of an extended response.
const EXTENDED_RESPONSE_VALUE: u64 = 11;

/// One `LDAPMessage` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
	/// The message id, echoed by every response.
	pub id: i32,
	/// The protocol operation.
	pub operation: Operation,
	/// Attached controls.
	pub controls: Vec<Control>,
}

impl Message {
	/// A message without controls.
	#[must_use]
	pub fn new(id: i32, operation: Operation) -> Self {
		Self { id, operation, controls: Vec::new() }
	}

	/// Attach controls.
	#[must_use]
	pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
		self.controls = controls;
		self
	}

	/// The message id of an envelope that may fail to decode.
	#[must_use]
	pub fn peek_id(tag: &StructureTag) -> Option<i32> {
		match &tag.payload {
			PL::C(children) => {
				let id = children.first()?;
				match &id.payload {
					PL::P(bytes)
						if id.class == TagClass::Universal && id.id == ber::universal::INTEGER =>
					{
						ber::parse_int(bytes).ok().and_then(|id| i32::try_from(id).ok())
					}
					_ => None,
				}
			}
			PL::P(_) => None,
		}
	}

	/// Decode an envelope.
	pub fn decode(tag: StructureTag) -> Result<Self, Error> {
		ber::expect(&tag, TagClass::Universal, ber::universal::SEQUENCE, "LDAPMessage")?;
		let mut children = ber::children(tag, "LDAPMessage")?.into_iter();
		let (Some(id), Some(operation)) = (children.next(), children.next()) else {
			return Err(Error::Protocol("LDAPMessage: expected at least 2 elements".to_owned()));
		};
		ber::expect(&id, TagClass::Universal, ber::universal::INTEGER, "messageID")?;
		let id = ber::int32(id, "messageID")?;
		let operation = Operation::decode(operation)?;

		let controls = match children.next() {
			Some(tag) if tag.class == TagClass::Context && tag.id == control::CONTROLS => {
				control::decode_controls(tag)?
			}
			Some(tag) => {
				return Err(Error::Protocol(format!(
					"LDAPMessage: unexpected element {:?}/{}",
					tag.class, tag.id
				)))
			}
			None => Vec::new(),
		};
		if children.next().is_some() {
			return Err(Error::Protocol("LDAPMessage: trailing elements".to_owned()));
		}
		Ok(Self { id, operation, controls })
	}

	/// Encode the envelope.
	#[must_use]
	pub fn encode(&self) -> StructureTag {
		let mut children = vec![ber::integer(i64::from(self.id)), self.operation.encode()];
		if !self.controls.is_empty() {
			children.push(control::encode_controls(&self.controls));
		}
		ber::sequence(children)
	}

	/// Serialize the envelope for the wire.
	pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
		ber::encode(self.encode())
	}
}

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
	/// Only the base entry.
	BaseObject = 0,
	/// Immediate children of the base.
	SingleLevel = 1,
	/// The base and all its descendants.
	WholeSubtree = 2,
}

impl Scope {
	/// Decode the enumerated value.
	fn from_code(code: i64) -> Result<Self, Error> {
		match code {
			0 => Ok(Self::BaseObject),
			1 => Ok(Self::SingleLevel),
			2 => Ok(Self::WholeSubtree),
			_ => Err(Error::Protocol(format!("unknown search scope {code}"))),
		}
	}
}

/// Alias dereferencing policy of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
	/// Never dereference.
	#[default]
	Never = 0,
	/// Dereference below the base.
	InSearching = 1,
	/// Dereference the base only.
	FindingBaseObject = 2,
	/// Always dereference.
	Always = 3,
}

impl DerefAliases {
	/// Decode the enumerated value.
	fn from_code(code: i64) -> Result<Self, Error> {
		match code {
			0 => Ok(Self::Never),
			1 => Ok(Self::InSearching),
			2 => Ok(Self::FindingBaseObject),
			3 => Ok(Self::Always),
			_ => Err(Error::Protocol(format!("unknown derefAliases {code}"))),
		}
	}
}

/// Credentials of a bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
	/// A password, empty for anonymous binds.
	Simple(Vec<u8>),
	/// SASL credentials.
	Sasl {
		/// The mechanism name.
		mechanism: String,
		/// Mechanism specific credentials.
		credentials: Option<Vec<u8>>,
	},
}

/// A bind request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
	/// Protocol version, 3.
	pub version: i32,
	/// The DN to bind as.
	pub name: String,
	/// The credentials.
	pub authentication: Authentication,
}

impl BindRequest {
	/// A simple bind.
	#[must_use]
	pub fn simple(name: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
		Self {
			version: 3,
			name: name.into(),
			authentication: Authentication::Simple(password.into()),
		}
	}
}

/// A search request.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
	/// The base DN.
	pub base: String,
	/// How far below the base to search.
	pub scope: Scope,
	/// Alias dereferencing policy.
	pub deref: DerefAliases,
	/// Maximum number of entries, 0 for none.
	pub size_limit: i32,
	/// Maximum seconds to spend, 0 for none.
	pub time_limit: i32,
	/// Whether to return attribute names only.
	pub types_only: bool,
	/// Entries to match.
	pub filter: Filter,
	/// Attributes to return. Empty selects all user attributes.
	pub attributes: Vec<String>,
}

impl SearchRequest {
	/// A search for all user attributes of the entries matching `filter`.
	pub fn new(base: impl Into<String>, scope: Scope, filter: &str) -> Result<Self, FilterError> {
		Ok(Self {
			base: base.into(),
			scope,
			deref: DerefAliases::Never,
			size_limit: 0,
			time_limit: 0,
			types_only: false,
			filter: Filter::parse(filter)?,
			attributes: Vec::new(),
		})
	}

	/// Select the attributes to return.
	#[must_use]
	pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.attributes = attributes.into_iter().map(Into::into).collect();
		self
	}
}

/// An attribute with its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAttribute {
	/// Attribute description.
	pub name: String,
	/// Values in wire form.
	pub values: Vec<Vec<u8>>,
}

impl PartialAttribute {
	/// An attribute with string values.
	#[must_use]
	pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<Vec<u8>>,
	{
		Self { name: name.into(), values: values.into_iter().map(Into::into).collect() }
	}

	/// Encode as `PartialAttribute ::= SEQUENCE`.
	fn encode(&self) -> StructureTag {
		ber::sequence(vec![
			ber::octet_string(self.name.as_bytes()),
			ber::set(self.values.iter().cloned().map(ber::octet_string).collect()),
		])
	}

	/// Decode one attribute.
	fn decode(tag: StructureTag) -> Result<Self, Error> {
		let mut fields = Fields::new(tag, "PartialAttribute")?;
		let name = fields.string("type")?;
		let values = ber::children(fields.next("vals")?, "vals")?
			.into_iter()
			.map(|value| ber::bytes(value, "value"))
			.collect::<Result<_, _>>()?;
		fields.finish()?;
		Ok(Self { name, values })
	}
}

/// An entry returned by a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
	/// DN of the entry.
	pub dn: String,
	/// Returned attributes.
	pub attributes: Vec<PartialAttribute>,
}

impl SearchEntry {
	/// Look up an attribute, ignoring case.
	#[must_use]
	pub fn attribute(&self, name: &str) -> Option<&PartialAttribute> {
		self.attributes.iter().find(|attribute| attribute.name.eq_ignore_ascii_case(name))
	}

	/// The first value of an attribute. `None` when it is missing or not
	/// valid UTF-8.
	#[must_use]
	pub fn first(&self, name: &str) -> Option<&str> {
		self.first_bytes(name).and_then(|value| std::str::from_utf8(value).ok())
	}

	/// The first value of an attribute in binary form.
	#[must_use]
	pub fn first_bytes(&self, name: &str) -> Option<&[u8]> {
		self.attribute(name)?.values.first().map(Vec::as_slice)
	}

	/// All UTF-8 values of an attribute.
	#[must_use]
	pub fn values(&self, name: &str) -> Vec<&str> {
		self.attribute(name)
			.map(|attribute| {
				attribute
					.values
					.iter()
					.filter_map(|value| std::str::from_utf8(value).ok())
					.collect()
			})
			.unwrap_or_default()
	}
}

/// Kind of a modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
	/// Add values, creating the attribute when needed.
	Add = 0,
	/// Delete the listed values, or the attribute when none are listed.
	Delete = 1,
	/// Replace all values.
	Replace = 2,
}

impl ModifyOperation {
	/// Decode the enumerated value.
	fn from_code(code: i64) -> Result<Self, Error> {
		match code {
			0 => Ok(Self::Add),
			1 => Ok(Self::Delete),
			2 => Ok(Self::Replace),
			_ => Err(Error::Protocol(format!("unknown modify operation {code}"))),
		}
	}
}

/// One change of a modify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
	/// What to do.
	pub operation: ModifyOperation,
	/// The attribute and values concerned.
	pub modification: PartialAttribute,
}

/// A modify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
	/// DN of the entry.
	pub dn: String,
	/// Changes applied in order.
	pub changes: Vec<Change>,
}

/// An add request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
	/// DN of the new entry.
	pub dn: String,
	/// Its attributes.
	pub attributes: Vec<PartialAttribute>,
}

/// A modify DN request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
	/// DN of the entry.
	pub dn: String,
	/// The new RDN.
	pub new_rdn: String,
	/// Whether to drop the old RDN values from the entry.
	pub delete_old_rdn: bool,
	/// Where to move the entry.
	pub new_superior: Option<String>,
}

/// A compare request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
	/// DN of the entry.
	pub dn: String,
	/// Attribute description.
	pub attribute: String,
	/// Assertion value.
	pub value: Vec<u8>,
}

/// A protocol operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
	/// Authenticate.
	BindRequest(BindRequest),
	/// Bind outcome.
	BindResponse(LdapResult),
	/// Close the connection.
	UnbindRequest,
	/// Search.
	SearchRequest(SearchRequest),
	/// One matching entry.
	SearchResultEntry(SearchEntry),
	/// End of a search.
	SearchResultDone(LdapResult),
	/// Continuation references of a search.
	SearchResultReference(Vec<String>),
	/// Modify an entry.
	ModifyRequest(ModifyRequest),
	/// Modify outcome.
	ModifyResponse(LdapResult),
	/// Add an entry.
	AddRequest(AddRequest),
	/// Add outcome.
	AddResponse(LdapResult),
	/// Delete the entry with this DN.
	DeleteRequest(String),
	/// Delete outcome.
	DeleteResponse(LdapResult),
	/// Rename or move an entry.
	ModifyDnRequest(ModifyDnRequest),
	/// Modify DN outcome.
	ModifyDnResponse(LdapResult),
	/// Compare an attribute value.
	CompareRequest(CompareRequest),
	/// Compare outcome.
	CompareResponse(LdapResult),
	/// Abandon the operation with this message id.
	AbandonRequest(i32),
	/// An extended operation.
	ExtendedRequest {
		/// OID of the operation.
		name: String,
		/// Operation specific value.
		value: Option<Vec<u8>>,
	},
	/// Outcome of an extended operation, or an unsolicited notification.
	ExtendedResponse {
		/// The result.
		result: LdapResult,
		/// OID of the response.
		name: Option<String>,
		/// Response specific value.
		value: Option<Vec<u8>>,
	},
}

impl Operation {
	/// Name of the operation for diagnostics.
	#[must_use]
	pub fn name(&self) -> &'static str {
		match self {
			Self::BindRequest(_) => "bindRequest",
			Self::BindResponse(_) => "bindResponse",
			Self::UnbindRequest => "unbindRequest",
			Self::SearchRequest(_) => "searchRequest",
			Self::SearchResultEntry(_) => "searchResEntry",
			Self::SearchResultDone(_) => "searchResDone",
			Self::SearchResultReference(_) => "searchResRef",
			Self::ModifyRequest(_) => "modifyRequest",
			Self::ModifyResponse(_) => "modifyResponse",
			Self::AddRequest(_) => "addRequest",
			Self::AddResponse(_) => "addResponse",
			Self::DeleteRequest(_) => "delRequest",
			Self::DeleteResponse(_) => "delResponse",
			Self::ModifyDnRequest(_) => "modDNRequest",
			Self::ModifyDnResponse(_) => "modDNResponse",
			Self::CompareRequest(_) => "compareRequest",
			Self::CompareResponse(_) => "compareResponse",
			Self::AbandonRequest(_) => "abandonRequest",
			Self::ExtendedRequest { .. } => "extendedReq",
			Self::ExtendedResponse { .. } => "extendedResp",
		}
	}

	/// The result carried by a response.
	#[must_use]
	pub fn result(&self) -> Option<&LdapResult> {
		match self {
			Self::BindResponse(result)
			| Self::SearchResultDone(result)
			| Self::ModifyResponse(result)
			| Self::AddResponse(result)
			| Self::DeleteResponse(result)
			| Self::ModifyDnResponse(result)
			| Self::CompareResponse(result)
			| Self::ExtendedResponse { result, .. } => Some(result),
			_ => None,
		}
	}

	/// Encode the operation.
	#[must_use]
	pub fn encode(&self) -> StructureTag {
		let application = |id, children| ber::constructed(TagClass::Application, id, children);
		match self {
			Self::BindRequest(request) => {
				let authentication = match &request.authentication {
					Authentication::Simple(password) => {
						ber::primitive(TagClass::Context, AUTH_SIMPLE, password.clone())
					}
					Authentication::Sasl { mechanism, credentials } => {
						let mut children = vec![ber::octet_string(mechanism.as_bytes())];
						children.extend(credentials.iter().cloned().map(ber::octet_string));
						ber::constructed(TagClass::Context, AUTH_SASL, children)
					}
				};
				application(
					app::BIND_REQUEST,
					vec![
						ber::integer(i64::from(request.version)),
						ber::octet_string(request.name.as_bytes()),
						authentication,
					],
				)
			}
			Self::BindResponse(result) => application(app::BIND_RESPONSE, result.encode()),
			Self::UnbindRequest => {
				ber::primitive(TagClass::Application, app::UNBIND_REQUEST, Vec::new())
			}
			Self::SearchRequest(request) => application(
				app::SEARCH_REQUEST,
				vec![
					ber::octet_string(request.base.as_bytes()),
					ber::enumerated(request.scope as i64),
					ber::enumerated(request.deref as i64),
					ber::integer(i64::from(request.size_limit)),
					ber::integer(i64::from(request.time_limit)),
					ber::boolean(request.types_only),
					request.filter.encode(),
					ber::sequence(
						request
							.attributes
							.iter()
							.map(|name| ber::octet_string(name.as_bytes()))
							.collect(),
					),
				],
			),
			Self::SearchResultEntry(entry) => application(
				app::SEARCH_RESULT_ENTRY,
				vec![
					ber::octet_string(entry.dn.as_bytes()),
					ber::sequence(entry.attributes.iter().map(PartialAttribute::encode).collect()),
				],
			),
			Self::SearchResultDone(result) => application(app::SEARCH_RESULT_DONE, result.encode()),
			Self::SearchResultReference(urls) => application(
				app::SEARCH_RESULT_REFERENCE,
				urls.iter().map(|url| ber::octet_string(url.as_bytes())).collect(),
			),
			Self::ModifyRequest(request) => application(
				app::MODIFY_REQUEST,
				vec![
					ber::octet_string(request.dn.as_bytes()),
					ber::sequence(
						request
							.changes
							.iter()
							.map(|change| {
								ber::sequence(vec![
									ber::enumerated(change.operation as i64),
									change.modification.encode(),
								])
							})
							.collect(),
					),
				],
			),
			Self::ModifyResponse(result) => application(app::MODIFY_RESPONSE, result.encode()),
			Self::AddRequest(request) => application(
				app::ADD_REQUEST,
				vec![
					ber::octet_string(request.dn.as_bytes()),
					ber::sequence(
						request.attributes.iter().map(PartialAttribute::encode).collect(),
					),
				],
			),
			Self::AddResponse(result) => application(app::ADD_RESPONSE, result.encode()),
			Self::DeleteRequest(dn) => {
				ber::primitive(TagClass::Application, app::DELETE_REQUEST, dn.as_bytes())
			}
			Self::DeleteResponse(result) => application(app::DELETE_RESPONSE, result.encode()),
			Self::ModifyDnRequest(request) => {
				let mut children = vec![
					ber::octet_string(request.dn.as_bytes()),
					ber::octet_string(request.new_rdn.as_bytes()),
					ber::boolean(request.delete_old_rdn),
				];
				if let Some(superior) = &request.new_superior {
					children.push(ber::primitive(
						TagClass::Context,
						NEW_SUPERIOR,
						superior.as_bytes(),
					));
				}
				application(app::MODIFY_DN_REQUEST, children)
			}
			Self::ModifyDnResponse(result) => application(app::MODIFY_DN_RESPONSE, result.encode()),
			Self::CompareRequest(request) => application(
				app::COMPARE_REQUEST,
				vec![
					ber::octet_string(request.dn.as_bytes()),
					ber::sequence(vec![
						ber::octet_string(request.attribute.as_bytes()),
						ber::octet_string(request.value.clone()),
					]),
				],
			),
			Self::CompareResponse(result) => application(app::COMPARE_RESPONSE, result.encode()),
			Self::AbandonRequest(id) => ber::primitive(
				TagClass::Application,
				app::ABANDON_REQUEST,
				ber::int_bytes(i64::from(*id)),
			),
			Self::ExtendedRequest { name, value } => {
				let mut children =
					vec![ber::primitive(TagClass::Context, EXTENDED_REQUEST_NAME, name.as_bytes())];
				if let Some(value) = value {
					children.push(ber::primitive(
						TagClass::Context,
						EXTENDED_REQUEST_VALUE,
						value.clone(),
					));
				}
				application(app::EXTENDED_REQUEST, children)
			}
			Self::ExtendedResponse { result, name, value } => {
				let mut children = result.encode();
				if let Some(name) = name {
					children.push(ber::primitive(
						TagClass::Context,
						EXTENDED_RESPONSE_NAME,
						name.as_bytes(),
					));
				}
				if let Some(value) = value {
					children.push(ber::primitive(
						TagClass::Context,
						EXTENDED_RESPONSE_VALUE,
						value.clone(),
					));
				}
				application(app::EXTENDED_RESPONSE, children)
			}
		}
	}

	/// Decode an application tagged operation.
	pub fn decode(tag: StructureTag) -> Result<Self, Error> {
		if tag.class != TagClass::Application {
			return Err(Error::Protocol(format!(
				"protocolOp: expected an application tag, got {:?}/{}",
				tag.class, tag.id
			)));
		}
		Ok(match tag.id {
			app::BIND_REQUEST => Self::BindRequest(decode_bind(tag)?),
			app::BIND_RESPONSE => {
				// serverSaslCreds are not used by simple binds.
				let mut fields = Fields::new(tag, "BindResponse")?;
				Self::BindResponse(fields.result()?)
			}
			app::UNBIND_REQUEST => {
				ber::bytes(tag, "UnbindRequest")?;
				Self::UnbindRequest
			}
			app::SEARCH_REQUEST => Self::SearchRequest(decode_search(tag)?),
			app::SEARCH_RESULT_ENTRY => {
				let mut fields = Fields::new(tag, "SearchResultEntry")?;
				let dn = fields.string("objectName")?;
				let attributes = ber::children(fields.next("attributes")?, "attributes")?
					.into_iter()
					.map(PartialAttribute::decode)
					.collect::<Result<_, _>>()?;
				fields.finish()?;
				Self::SearchResultEntry(SearchEntry { dn, attributes })
			}
			app::SEARCH_RESULT_DONE => {
				Self::SearchResultDone(decode_result(tag, "SearchResultDone")?)
			}
			app::SEARCH_RESULT_REFERENCE => Self::SearchResultReference(
				ber::children(tag, "SearchResultReference")?
					.into_iter()
					.map(|url| ber::string(url, "URI"))
					.collect::<Result<_, _>>()?,
			),
			app::MODIFY_REQUEST => {
				let mut fields = Fields::new(tag, "ModifyRequest")?;
				let dn = fields.string("object")?;
				let mut changes = Vec::new();
				for change in ber::children(fields.next("changes")?, "changes")? {
					let mut change = Fields::new(change, "change")?;
					let operation = ModifyOperation::from_code(change.int("operation")?)?;
					let modification = PartialAttribute::decode(change.next("modification")?)?;
					change.finish()?;
					changes.push(Change { operation, modification });
				}
				fields.finish()?;
				Self::ModifyRequest(ModifyRequest { dn, changes })
			}
			app::MODIFY_RESPONSE => Self::ModifyResponse(decode_result(tag, "ModifyResponse")?),
			app::ADD_REQUEST => {
				let mut fields = Fields::new(tag, "AddRequest")?;
				let dn = fields.string("entry")?;
				let attributes = ber::children(fields.next("attributes")?, "attributes")?
					.into_iter()
					.map(PartialAttribute::decode)
					.collect::<Result<_, _>>()?;
				fields.finish()?;
				Self::AddRequest(AddRequest { dn, attributes })
			}
			app::ADD_RESPONSE => Self::AddResponse(decode_result(tag, "AddResponse")?),
			app::DELETE_REQUEST => Self::DeleteRequest(ber::string(tag, "DelRequest")?),
			app::DELETE_RESPONSE => Self::DeleteResponse(decode_result(tag, "DelResponse")?),
			app::MODIFY_DN_REQUEST => {
				let mut fields = Fields::new(tag, "ModifyDNRequest")?;
				let dn = fields.string("entry")?;
				let new_rdn = fields.string("newrdn")?;
				let delete_old_rdn =
					ber::boolean_value(fields.next("deleteoldrdn")?, "deleteoldrdn")?;
				let new_superior = match fields.optional() {
					Some(tag) if tag.class == TagClass::Context && tag.id == NEW_SUPERIOR => {
						Some(ber::string(tag, "newSuperior")?)
					}
					Some(tag) => {
						return Err(Error::Protocol(format!(
							"ModifyDNRequest: unexpected element {:?}/{}",
							tag.class, tag.id
						)))
					}
					None => None,
				};
				fields.finish()?;
				Self::ModifyDnRequest(ModifyDnRequest { dn, new_rdn, delete_old_rdn, new_superior })
			}
			app::MODIFY_DN_RESPONSE => {
				Self::ModifyDnResponse(decode_result(tag, "ModifyDNResponse")?)
			}
			app::COMPARE_REQUEST => {
				let mut fields = Fields::new(tag, "CompareRequest")?;
				let dn = fields.string("entry")?;
				let mut ava = Fields::new(fields.next("ava")?, "AttributeValueAssertion")?;
				let attribute = ava.string("attributeDesc")?;
				let value = ava.bytes("assertionValue")?;
				ava.finish()?;
				fields.finish()?;
				Self::CompareRequest(CompareRequest { dn, attribute, value })
			}
			app::COMPARE_RESPONSE => Self::CompareResponse(decode_result(tag, "CompareResponse")?),
			app::ABANDON_REQUEST => {
				let id = ber::int32(tag, "AbandonRequest")?;
				Self::AbandonRequest(id)
			}
			app::EXTENDED_REQUEST => {
				let mut fields = Fields::new(tag, "ExtendedRequest")?;
				let name = fields.string("requestName")?;
				let value =
					fields.optional().map(|tag| ber::bytes(tag, "requestValue")).transpose()?;
				fields.finish()?;
				Self::ExtendedRequest { name, value }
			}
			app::EXTENDED_RESPONSE => {
				let mut fields = Fields::new(tag, "ExtendedResponse")?;
				let result = fields.result()?;
				let (mut name, mut value) = (None, None);
				while let Some(tag) = fields.optional() {
					match (tag.class, tag.id) {
						(TagClass::Context, EXTENDED_RESPONSE_NAME) => {
							name = Some(ber::string(tag, "responseName")?);
						}
						(TagClass::Context, EXTENDED_RESPONSE_VALUE) => {
							value = Some(ber::bytes(tag, "responseValue")?);
						}
						(class, id) => {
							return Err(Error::Protocol(format!(
								"ExtendedResponse: unexpected element {class:?}/{id}"
							)))
						}
					}
				}
				Self::ExtendedResponse { result, name, value }
			}
			id => return Err(Error::Protocol(format!("unsupported protocol operation {id}"))),
		})
	}
}

/// Decode the body of a bind request.
fn decode_bind(tag: StructureTag) -> Result<BindRequest, Error> {
	let mut fields = Fields::new(tag, "BindRequest")?;
	let version = fields.int32("version")?;
	let name = fields.string("name")?;
	let authentication = fields.next("authentication")?;
	let authentication = match (authentication.class, authentication.id) {
		(TagClass::Context, AUTH_SIMPLE) => {
			Authentication::Simple(ber::bytes(authentication, "simple")?)
		}
		(TagClass::Context, AUTH_SASL) => {
			let mut sasl = Fields::new(authentication, "SaslCredentials")?;
			let mechanism = sasl.string("mechanism")?;
			let credentials =
				sasl.optional().map(|tag| ber::bytes(tag, "credentials")).transpose()?;
			sasl.finish()?;
			Authentication::Sasl { mechanism, credentials }
		}
		(class, id) => {
			return Err(Error::Protocol(format!(
				"BindRequest: unknown authentication {class:?}/{id}"
			)))
		}
	};
	fields.finish()?;
	Ok(BindRequest { version, name, authentication })
}

/// Decode the body of a search request.
fn decode_search(tag: StructureTag) -> Result<SearchRequest, Error> {
	let mut fields = Fields::new(tag, "SearchRequest")?;
	let base = fields.string("baseObject")?;
	let scope = Scope::from_code(fields.int("scope")?)?;
	let deref = DerefAliases::from_code(fields.int("derefAliases")?)?;
	let size_limit = fields.int32("sizeLimit")?;
	let time_limit = fields.int32("timeLimit")?;
	let types_only = ber::boolean_value(fields.next("typesOnly")?, "typesOnly")?;
	let filter = Filter::decode(&fields.next("filter")?)?;
	let attributes = ber::children(fields.next("attributes")?, "attributes")?
		.into_iter()
		.map(|name| ber::string(name, "attribute"))
		.collect::<Result<_, _>>()?;
	fields.finish()?;
	Ok(SearchRequest { base, scope, deref, size_limit, time_limit, types_only, filter, attributes })
}

/// Decode a response consisting of an `LDAPResult` only.
fn decode_result(tag: StructureTag, what: &'static str) -> Result<LdapResult, Error> {
	let mut fields = Fields::new(tag, what)?;
	let result = fields.result()?;
	fields.finish()?;
	Ok(result)
}

/// Sequential access to the components of a constructed element.
struct Fields {
	/// Name of the element for diagnostics.
	what: &'static str,
	/// Remaining components.
	inner: vec::IntoIter<StructureTag>,
}

impl Fields {
	/// Start reading the components of `tag`.
	fn new(tag: StructureTag, what: &'static str) -> Result<Self, Error> {
		Ok(Self { what, inner: ber::children(tag, what)?.into_iter() })
	}

	/// The next required component.
	fn next(&mut self, field: &str) -> Result<StructureTag, Error> {
		self.inner.next().ok_or_else(|| Error::Protocol(format!("{}: missing {field}", self.what)))
	}

	/// The next component, if any.
	fn optional(&mut self) -> Option<StructureTag> {
		self.inner.next()
	}

	/// A string component.
	fn string(&mut self, field: &str) -> Result<String, Error> {
		ber::string(self.next(field)?, field)
	}

	/// A binary component.
	fn bytes(&mut self, field: &str) -> Result<Vec<u8>, Error> {
		ber::bytes(self.next(field)?, field)
	}

	/// An integer or enumerated component.
	fn int(&mut self, field: &str) -> Result<i64, Error> {
		ber::int(self.next(field)?, field)
	}

	/// A 32 bit integer component.
	fn int32(&mut self, field: &str) -> Result<i32, Error> {
		ber::int32(self.next(field)?, field)
	}

	/// The leading `LDAPResult` components.
	fn result(&mut self) -> Result<LdapResult, Error> {
		LdapResult::decode(&mut self.inner)
	}

	/// Fail if components are left over.
	fn finish(mut self) -> Result<(), Error> {
		match self.inner.next() {
			None => Ok(()),
			Some(_) => Err(Error::Protocol(format!("{}: unexpected trailing elements", self.what))),
		}
	}
}
