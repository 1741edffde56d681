//! BER framing and value helpers over [`lber`].
use bytes::BytesMut;
use lber::{
	common::TagClass,
	parse::parse_tag,
	structure::{StructureTag, PL},
	write::encode_into,
};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::Error;

/// Largest PDU accepted from a peer.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Universal tag numbers used by LDAP.
pub mod universal {
	/// BOOLEAN.
	pub const BOOLEAN: u64 = 1;
	/// INTEGER.
	pub const INTEGER: u64 = 2;
	/// OCTET STRING.
	pub const OCTET_STRING: u64 = 4;
	/// ENUMERATED.
	pub const ENUMERATED: u64 = 10;
	/// SEQUENCE and SEQUENCE OF.
	pub const SEQUENCE: u64 = 16;
	/// SET and SET OF.
	pub const SET: u64 = 17;
}

/// A primitive element.
#[must_use]
pub fn primitive(class: TagClass, id: u64, bytes: impl Into<Vec<u8>>) -> StructureTag {
	StructureTag { class, id, payload: PL::P(bytes.into()) }
}

/// A constructed element.
#[must_use]
pub fn constructed(class: TagClass, id: u64, children: Vec<StructureTag>) -> StructureTag {
	StructureTag { class, id, payload: PL::C(children) }
}

/// A universal SEQUENCE.
#[must_use]
pub fn sequence(children: Vec<StructureTag>) -> StructureTag {
	constructed(TagClass::Universal, universal::SEQUENCE, children)
}

/// A universal SET.
#[must_use]
pub fn set(children: Vec<StructureTag>) -> StructureTag {
	constructed(TagClass::Universal, universal::SET, children)
}

/// A universal OCTET STRING.
#[must_use]
pub fn octet_string(bytes: impl Into<Vec<u8>>) -> StructureTag {
	primitive(TagClass::Universal, universal::OCTET_STRING, bytes)
}

/// A universal BOOLEAN.
#[must_use]
pub fn boolean(value: bool) -> StructureTag {
	primitive(TagClass::Universal, universal::BOOLEAN, vec![if value { 0xff } else { 0x00 }])
}

/// A universal INTEGER.
#[must_use]
pub fn integer(value: i64) -> StructureTag {
	primitive(TagClass::Universal, universal::INTEGER, int_bytes(value))
}

/// A universal ENUMERATED.
#[must_use]
pub fn enumerated(value: i64) -> StructureTag {
	primitive(TagClass::Universal, universal::ENUMERATED, int_bytes(value))
}

/// Minimal two's complement encoding of an integer.
#[must_use]
pub fn int_bytes(value: i64) -> Vec<u8> {
	let bytes = value.to_be_bytes();
	let mut start = 0;
	while start < bytes.len() - 1 {
		let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
			|| (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
		if !redundant {
			break;
		}
		start += 1;
	}
	bytes[start..].to_vec()
}

/// Decode two's complement integer contents.
pub fn parse_int(bytes: &[u8]) -> Result<i64, Error> {
	if bytes.is_empty() || bytes.len() > 8 {
		return Err(Error::Protocol(format!("integer of {} bytes", bytes.len())));
	}
	let fill = if bytes[0] & 0x80 == 0 { 0x00 } else { 0xff };
	let mut buf = [fill; 8];
	buf[8 - bytes.len()..].copy_from_slice(bytes);
	Ok(i64::from_be_bytes(buf))
}

/// Serialize an element.
pub fn encode(tag: StructureTag) -> Result<Vec<u8>, Error> {
	let mut buf = BytesMut::new();
	encode_into(&mut buf, tag)?;
	Ok(buf.to_vec())
}

/// Parse exactly one element.
pub fn decode(bytes: &[u8]) -> Result<StructureTag, Error> {
	match parse_tag(bytes) {
		Ok((rest, tag)) if rest.is_empty() => Ok(tag),
		Ok((rest, _)) => {
			Err(Error::Protocol(format!("{} trailing bytes after element", rest.len())))
		}
		Err(_) => Err(Error::Protocol("malformed BER element".to_owned())),
	}
}

/// Read one complete PDU. Returns `None` on a clean end of stream before
/// the first byte of a PDU.
pub async fn read_frame<R: AsyncRead + Unpin>(
	reader: &mut R,
) -> Result<Option<StructureTag>, Error> {
	let mut frame = vec![0_u8; 2];
	match reader.read_exact(&mut frame[..1]).await {
		Ok(_) => {}
		Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(err) => return Err(err.into()),
	}
	if frame[0] & 0x1f == 0x1f {
		return Err(Error::Protocol("multi-byte tag numbers are not supported".to_owned()));
	}
	reader.read_exact(&mut frame[1..2]).await?;

	let length = if frame[1] & 0x80 == 0 {
		usize::from(frame[1])
	} else {
		let count = usize::from(frame[1] & 0x7f);
		if count == 0 || count > 4 {
			return Err(Error::Protocol("unsupported length encoding".to_owned()));
		}
		let mut length = [0_u8; 4];
		reader.read_exact(&mut length[4 - count..]).await?;
		frame.extend_from_slice(&length[4 - count..]);
		usize::try_from(u32::from_be_bytes(length))
			.map_err(|_| Error::Protocol("frame length overflows".to_owned()))?
	};
	if length > MAX_FRAME {
		return Err(Error::Protocol(format!("frame of {length} bytes exceeds the limit")));
	}

	let start = frame.len();
	frame.resize(start + length, 0);
	reader.read_exact(&mut frame[start..]).await?;
	decode(&frame).map(Some)
}

/// Check an element's class and tag number.
pub fn expect(tag: &StructureTag, class: TagClass, id: u64, what: &str) -> Result<(), Error> {
	if tag.class == class && tag.id == id {
		Ok(())
	} else {
		Err(Error::Protocol(format!("{what}: unexpected tag {:?}/{}", tag.class, tag.id)))
	}
}

/// Children of a constructed element.
pub fn children(tag: StructureTag, what: &str) -> Result<Vec<StructureTag>, Error> {
	match tag.payload {
		PL::C(children) => Ok(children),
		PL::P(_) => Err(Error::Protocol(format!("{what}: expected a constructed element"))),
	}
}

/// Contents of a primitive element.
pub fn bytes(tag: StructureTag, what: &str) -> Result<Vec<u8>, Error> {
	match tag.payload {
		PL::P(bytes) => Ok(bytes),
		PL::C(_) => Err(Error::Protocol(format!("{what}: expected a primitive element"))),
	}
}

/// A UTF-8 string element.
pub fn string(tag: StructureTag, what: &str) -> Result<String, Error> {
	String::from_utf8(bytes(tag, what)?)
		.map_err(|_| Error::Protocol(format!("{what}: invalid UTF-8")))
}

/// An INTEGER or ENUMERATED element.
pub fn int(tag: StructureTag, what: &str) -> Result<i64, Error> {
	parse_int(&bytes(tag, what)?)
}

/// An INTEGER that fits 32 bits.
pub fn int32(tag: StructureTag, what: &str) -> Result<i32, Error> {
	i32::try_from(int(tag, what)?).map_err(|_| Error::Protocol(format!("{what}: out of range")))
}

/// A BOOLEAN element.
pub fn boolean_value(tag: StructureTag, what: &str) -> Result<bool, Error> {
	match bytes(tag, what)?.as_slice() {
		[0x00] => Ok(false),
		[_] => Ok(true),
		_ => Err(Error::Protocol(format!("{what}: malformed boolean"))),
	}
}

/// Take exactly `N` children, failing with a protocol error otherwise.
pub fn exactly<const N: usize>(
	children: Vec<StructureTag>,
	what: &str,
) -> Result<[StructureTag; N], Error> {
	children.try_into().map_err(|children: Vec<StructureTag>| {
		Error::Protocol(format!("{what}: expected {N} elements, got {}", children.len()))
	})
}
