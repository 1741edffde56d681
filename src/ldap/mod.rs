//! LDAPv3 protocol engine.
//!
//! RFC 4511 messages are BER encoded with the [`lber`] crate and framed by
//! [`ber`]. The [`server`] hands decoded requests to a [`Handler`] and
//! writes its responses; the [`client`] speaks the same codec from the
//! other end. [`directory`] is a handler serving an in-memory directory
//! described by a configuration document.

pub mod ber;
pub mod client;
pub mod control;
pub mod directory;
pub mod entry;
pub mod filter;
pub mod message;
pub mod paging;
pub mod result;
pub mod server;

pub use self::{
	client::{Client, SearchResult},
	control::{Control, PagedResults},
	directory::{Directories, Directory, DirectoryConfig, DirectoryHandler},
	entry::Entry,
	filter::{Filter, FilterError},
	message::{
		Authentication, BindRequest, Change, CompareRequest, DerefAliases, Message, ModifyDnRequest,
		ModifyOperation, ModifyRequest, Operation, PartialAttribute, Scope, SearchEntry,
		SearchRequest,
	},
	paging::PagingContext,
	result::{LdapResult, ResultCode},
	server::{Context, Handler, Request, Response, Server},
};

/// Errors of the LDAP engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// Socket I/O failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// A PDU violates the protocol.
	#[error("protocol error: {0}")]
	Protocol(String),
	/// A search filter is malformed.
	#[error(transparent)]
	Filter(#[from] FilterError),
	/// The peer answered with a PDU that does not fit the request.
	#[error("unexpected response: {0}")]
	UnexpectedResponse(String),
	/// An operation completed with a result code other than success.
	#[error("operation failed: {0}")]
	Operation(LdapResult),
	/// The peer closed the connection.
	#[error("connection closed")]
	ConnectionClosed,
	/// No response arrived in time.
	#[error("timed out waiting for a response")]
	Timeout,
	/// The server has been shut down.
	#[error("server closed")]
	ServerClosed,
}
