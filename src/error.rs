//! Error codes

/// Errors surfaced by the binary and the startup configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// Reading the static configuration or waiting for a signal failed.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	/// The static configuration file is not valid YAML for its shape.
	#[error("parsing static configuration: {0}")]
	Yaml(#[from] serde_yaml::Error),
	/// The configured log level is not a valid filter directive.
	#[error("invalid log level: {0}")]
	LogLevel(#[from] tracing_subscriber::filter::ParseError),
	/// A document could not be parsed or resolved.
	#[error(transparent)]
	Dynamic(#[from] crate::dynamic::Error),
	/// A provider failed to start.
	#[error(transparent)]
	Provider(#[from] crate::provider::Error),
	/// The LDAP engine failed.
	#[error(transparent)]
	Ldap(#[from] crate::ldap::Error),
	/// A task was submitted after shutdown began.
	#[error(transparent)]
	PoolClosed(#[from] crate::pool::PoolClosed),
}
