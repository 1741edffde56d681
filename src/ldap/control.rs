//! Request and response controls.
use lber::{
	common::TagClass,
	structure::{StructureTag, PL},
};

use super::{ber, Error};

/// Context tag of the controls element of a message.
pub(crate) const CONTROLS: u64 = 0;

/// A control attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
	/// Type of the control.
	pub oid: String,
	/// Whether the operation must fail when the control is not supported.
	pub criticality: bool,
	/// BER encoded control value.
	pub value: Option<Vec<u8>>,
}

impl Control {
	/// Encode as `Control ::= SEQUENCE`.
	#[must_use]
	pub fn encode(&self) -> StructureTag {
		let mut children = vec![ber::octet_string(self.oid.as_bytes())];
		if self.criticality {
			children.push(ber::boolean(true));
		}
		if let Some(value) = &self.value {
			children.push(ber::octet_string(value.clone()));
		}
		ber::sequence(children)
	}

	/// Decode one control.
	///
	/// The value is normally an OCTET STRING holding BER bytes. Some clients
	/// put the inner SEQUENCE there directly; it is accepted and stored in
	/// its encoded form so both shapes look the same afterwards.
	pub fn decode(tag: StructureTag) -> Result<Self, Error> {
		ber::expect(&tag, TagClass::Universal, ber::universal::SEQUENCE, "Control")?;
		let mut children = ber::children(tag, "Control")?.into_iter();
		let oid = match children.next() {
			Some(oid) => ber::string(oid, "controlType")?,
			None => return Err(Error::Protocol("Control: missing controlType".to_owned())),
		};

		let mut criticality = false;
		let mut value = None;
		for child in children {
			match (child.class, child.id, &child.payload) {
				(TagClass::Universal, ber::universal::BOOLEAN, _) if value.is_none() => {
					criticality = ber::boolean_value(child, "criticality")?;
				}
				(TagClass::Universal, ber::universal::OCTET_STRING, PL::P(_))
					if value.is_none() =>
				{
					value = Some(ber::bytes(child, "controlValue")?);
				}
				(TagClass::Universal, ber::universal::SEQUENCE, PL::C(_)) if value.is_none() => {
					value = Some(ber::encode(child)?);
				}
				(class, id, _) => {
					return Err(Error::Protocol(format!(
						"Control {oid}: unexpected element {class:?}/{id}"
					)))
				}
			}
		}
		Ok(Self { oid, criticality, value })
	}
}

/// Encode the controls element of a message.
pub(crate) fn encode_controls(controls: &[Control]) -> StructureTag {
	ber::constructed(TagClass::Context, CONTROLS, controls.iter().map(Control::encode).collect())
}

/// Decode the controls element of a message.
pub(crate) fn decode_controls(tag: StructureTag) -> Result<Vec<Control>, Error> {
	ber::children(tag, "controls")?.into_iter().map(Control::decode).collect()
}

/// The simple paged results control of RFC 2696.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResults {
	/// Requested page size, or the server's estimate of the result size in
	/// responses.
	pub size: i32,
	/// Opaque continuation token, empty for the first page and after the
	/// last one.
	pub cookie: Vec<u8>,
	/// Criticality of the carrying control.
	pub criticality: bool,
}

impl PagedResults {
	/// Object identifier of the control.
	pub const OID: &'static str = "1.2.840.113556.1.4.319";

	/// A control requesting or describing one page.
	#[must_use]
	pub fn new(size: i32, cookie: impl Into<Vec<u8>>) -> Self {
		Self { size, cookie: cookie.into(), criticality: false }
	}

	/// Find and decode the control in a list.
	pub fn find(controls: &[Control]) -> Result<Option<Self>, Error> {
		controls.iter().find(|control| control.oid == Self::OID).map(Self::decode).transpose()
	}

	/// Decode from a generic control.
	pub fn decode(control: &Control) -> Result<Self, Error> {
		let value = control
			.value
			.as_deref()
			.ok_or_else(|| Error::Protocol("paged results control without value".to_owned()))?;
		let inner = ber::decode(value)?;
		ber::expect(&inner, TagClass::Universal, ber::universal::SEQUENCE, "paged results")?;
		let [size, cookie] = ber::exactly(ber::children(inner, "paged results")?, "paged results")?;
		Ok(Self {
			size: ber::int32(size, "size")?,
			cookie: ber::bytes(cookie, "cookie")?,
			criticality: control.criticality,
		})
	}

	/// Encode as a generic control.
	pub fn to_control(&self) -> Result<Control, Error> {
		let value = ber::encode(ber::sequence(vec![
			ber::integer(i64::from(self.size)),
			ber::octet_string(self.cookie.clone()),
		]))?;
		Ok(Control { oid: Self::OID.to_owned(), criticality: self.criticality, value: Some(value) })
	}
}
