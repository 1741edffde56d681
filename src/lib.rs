//! Mock backend services driven by hot-reloaded declarative configuration.
//!
//! The crate has two halves. The configuration plane discovers documents
//! through [providers](provider) (local directories, HTTP endpoints, git
//! repositories and installed packages), parses them into typed
//! [configs](dynamic::Config), resolves `$ref` references between them and
//! hands every changed document to listeners registered on the
//! [`Watcher`]. The [LDAP engine](ldap) is one such listener: a document
//! with a top level `ldap` key describes a directory which is served over
//! LDAPv3 and kept in sync with the file it came from.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate is an
//! excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! Serving every LDAP document found below `./mocks` might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use mimic::{
//!     dynamic::Registry,
//!     ldap::Directories,
//!     provider::{FileConfig, FileProvider, Provider},
//!     Watcher,
//! };
//!
//! let file: Arc<dyn Provider> = Arc::new(FileProvider::new(FileConfig::directory("./mocks")));
//! let watcher = Watcher::new(Registry::builtin(), vec![file]);
//!
//! let directories = Directories::new();
//! directories.attach(&watcher);
//!
//! watcher.start()?;
//! tokio::signal::ctrl_c().await?;
//! watcher.close().await;
//! directories.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! A directory document:
//! ```yaml
//! ldap: 3.0
//! host: :8389
//! entries:
//!   dc=example,dc=com:
//!     objectClass: [top, domain]
//!     dc: example
//!   cn=alice,dc=example,dc=com:
//!     $ref: ./users/alice.yml
//! ```
//!
//! # Limitations
//! * Only simple binds are supported; SASL binds are answered with
//!   `authMethodNotSupported`.
//! * Extended operations (including StartTLS) are rejected.
//! * Directory contents changed over LDAP live in memory only and are
//!   replaced when the document changes.

pub mod config;
pub mod dynamic;
pub mod error;
pub mod ldap;
pub mod pool;
pub mod provider;
pub mod watcher;

pub use crate::{config::StaticConfig, error::Error, pool::Pool, watcher::Watcher};
