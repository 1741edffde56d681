//! Result codes and the `LDAPResult` component.
use std::fmt;

use lber::{common::TagClass, structure::StructureTag};

use super::{ber, Error};

/// Context tag of the referral list inside an `LDAPResult`.
const REFERRAL: u64 = 3;

/// An LDAP result code. Codes without a name are carried unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultCode(pub u32);

impl ResultCode {
	/// success
	pub const SUCCESS: Self = Self(0);
	/// operationsError
	pub const OPERATIONS_ERROR: Self = Self(1);
	/// protocolError
	pub const PROTOCOL_ERROR: Self = Self(2);
	/// timeLimitExceeded
	pub const TIME_LIMIT_EXCEEDED: Self = Self(3);
	/// sizeLimitExceeded
	pub const SIZE_LIMIT_EXCEEDED: Self = Self(4);
	/// compareFalse
	pub const COMPARE_FALSE: Self = Self(5);
	/// compareTrue
	pub const COMPARE_TRUE: Self = Self(6);
	/// authMethodNotSupported
	pub const AUTH_METHOD_NOT_SUPPORTED: Self = Self(7);
	/// unavailableCriticalExtension
	pub const UNAVAILABLE_CRITICAL_EXTENSION: Self = Self(12);
	/// noSuchAttribute
	pub const NO_SUCH_ATTRIBUTE: Self = Self(16);
	/// attributeOrValueExists
	pub const ATTRIBUTE_OR_VALUE_EXISTS: Self = Self(20);
	/// noSuchObject
	pub const NO_SUCH_OBJECT: Self = Self(32);
	/// invalidDNSyntax
	pub const INVALID_DN_SYNTAX: Self = Self(34);
	/// invalidCredentials
	pub const INVALID_CREDENTIALS: Self = Self(49);
	/// insufficientAccessRights
	pub const INSUFFICIENT_ACCESS_RIGHTS: Self = Self(50);
	/// unwillingToPerform
	pub const UNWILLING_TO_PERFORM: Self = Self(53);
	/// notAllowedOnNonLeaf
	pub const NOT_ALLOWED_ON_NON_LEAF: Self = Self(66);
	/// entryAlreadyExists
	pub const ENTRY_ALREADY_EXISTS: Self = Self(68);
	/// cannotCancel
	pub const CANNOT_CANCEL: Self = Self(121);

	/// The RFC 4511 name of a known code.
	#[must_use]
	pub fn name(self) -> Option<&'static str> {
		Some(match self.0 {
			0 => "success",
			1 => "operationsError",
			2 => "protocolError",
			3 => "timeLimitExceeded",
			4 => "sizeLimitExceeded",
			5 => "compareFalse",
			6 => "compareTrue",
			7 => "authMethodNotSupported",
			12 => "unavailableCriticalExtension",
			16 => "noSuchAttribute",
			20 => "attributeOrValueExists",
			32 => "noSuchObject",
			34 => "invalidDNSyntax",
			49 => "invalidCredentials",
			50 => "insufficientAccessRights",
			53 => "unwillingToPerform",
			66 => "notAllowedOnNonLeaf",
			68 => "entryAlreadyExists",
			121 => "cannotCancel",
			_ => return None,
		})
	}
}

impl fmt::Display for ResultCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.name() {
			Some(name) => write!(f, "{name} ({})", self.0),
			None => write!(f, "resultCode {}", self.0),
		}
	}
}

impl fmt::Debug for ResultCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// Outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
	/// The result code.
	pub code: ResultCode,
	/// The closest existing entry for name errors.
	pub matched_dn: String,
	/// Human readable diagnostics.
	pub message: String,
	/// Servers to retry at.
	pub referrals: Vec<String>,
}

impl LdapResult {
	/// A result with `code` and no diagnostics.
	#[must_use]
	pub fn new(code: ResultCode) -> Self {
		Self { code, matched_dn: String::new(), message: String::new(), referrals: Vec::new() }
	}

	/// A successful result.
	#[must_use]
	pub fn success() -> Self {
		Self::new(ResultCode::SUCCESS)
	}

	/// Attach a diagnostic message.
	#[must_use]
	pub fn with_message(mut self, message: impl Into<String>) -> Self {
		self.message = message.into();
		self
	}

	/// Attach the matched DN.
	#[must_use]
	pub fn with_matched_dn(mut self, dn: impl Into<String>) -> Self {
		self.matched_dn = dn.into();
		self
	}

	/// Whether the code is `success`.
	#[must_use]
	pub fn is_success(&self) -> bool {
		self.code == ResultCode::SUCCESS
	}

	/// Turn anything but `success` into an error.
	pub fn into_success(self) -> Result<Self, Error> {
		if self.is_success() {
			Ok(self)
		} else {
			Err(Error::Operation(self))
		}
	}

	/// The components of the result, to be embedded in a response.
	#[must_use]
	pub fn encode(&self) -> Vec<StructureTag> {
		let mut components = vec![
			ber::enumerated(i64::from(self.code.0)),
			ber::octet_string(self.matched_dn.as_bytes()),
			ber::octet_string(self.message.as_bytes()),
		];
		if !self.referrals.is_empty() {
			components.push(ber::constructed(
				TagClass::Context,
				REFERRAL,
				self.referrals.iter().map(|url| ber::octet_string(url.as_bytes())).collect(),
			));
		}
		components
	}

	/// Decode the leading result components of a response, leaving the
	/// response specific rest in `components`.
	pub fn decode(components: &mut std::vec::IntoIter<StructureTag>) -> Result<Self, Error> {
		let mut next = |what: &str| {
			components.next().ok_or_else(|| Error::Protocol(format!("LDAPResult: missing {what}")))
		};
		let code = ber::int(next("resultCode")?, "resultCode")?;
		let code = u32::try_from(code)
			.map_err(|_| Error::Protocol(format!("resultCode {code} out of range")))?;
		let matched_dn = ber::string(next("matchedDN")?, "matchedDN")?;
		let message = ber::string(next("diagnosticMessage")?, "diagnosticMessage")?;

		let mut referrals = Vec::new();
		let referral = |tag: &StructureTag| tag.class == TagClass::Context && tag.id == REFERRAL;
		if components.as_slice().first().is_some_and(referral) {
			if let Some(tag) = components.next() {
				for url in ber::children(tag, "referral")? {
					referrals.push(ber::string(url, "referral")?);
				}
			}
		}
		Ok(Self { code: ResultCode(code), matched_dn, message, referrals })
	}
}

impl fmt::Display for LdapResult {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.message.is_empty() {
			write!(f, "{}", self.code)
		} else {
			write!(f, "{}: {}", self.code, self.message)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{LdapResult, ResultCode};

	#[test]
	fn unknown_codes_are_carried() {
		assert_eq!(ResultCode(80).name(), None);
		assert_eq!(ResultCode(80).to_string(), "resultCode 80");
		assert_eq!(ResultCode::CANNOT_CANCEL.to_string(), "cannotCancel (121)");
	}

	#[test]
	fn components_round_trip() -> Result<(), Box<dyn std::error::Error>> {
		let mut result = LdapResult::new(ResultCode::NO_SUCH_OBJECT)
			.with_matched_dn("dc=example")
			.with_message("missing");
		result.referrals.push("ldap://other/".to_owned());
		let mut components = result.encode().into_iter();
		assert_eq!(LdapResult::decode(&mut components)?, result);
		assert_eq!(components.len(), 0);
		Ok(())
	}
}
