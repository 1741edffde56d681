//! Run the mock server from a static configuration file and the command line.
use std::path::PathBuf;

use clap::Parser;
use mimic::{dynamic::Registry, ldap::Directories, Error, StaticConfig, Watcher};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Serve mock backends from hot-reloaded configuration documents.
#[derive(Debug, Parser)]
#[command(name = "mimic", version, about)]
struct Cli {
	/// Path of the static YAML configuration.
	#[arg(long, env = "MIMIC_CONFIG")]
	config: Option<PathBuf>,
	/// Directory to scan for documents. May be repeated.
	#[arg(long = "directory")]
	directories: Vec<PathBuf>,
	/// Endpoint to poll for a document. May be repeated.
	#[arg(long = "url")]
	urls: Vec<Url>,
	/// Log filter directive, overriding the configuration. `RUST_LOG` takes
	/// precedence over both.
	#[arg(long, env = "MIMIC_LOG_LEVEL")]
	log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
	let cli = Cli::parse();

	let mut config = match &cli.config {
		Some(path) => StaticConfig::load(path)?,
		None => StaticConfig::default(),
	};
	config.add_directories(cli.directories);
	config.add_urls(cli.urls);
	if let Some(level) = cli.log_level {
		config.log.level = level;
	}

	let filter = match EnvFilter::try_from_default_env() {
		Ok(filter) => filter,
		Err(_) => EnvFilter::try_new(&config.log.level)?,
	};
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let watcher = Watcher::new(Registry::builtin(), config.providers());
	let directories = Directories::new();
	directories.attach(&watcher);
	watcher.start()?;

	tokio::signal::ctrl_c().await?;
	info!("shutting down");
	watcher.close().await;
	directories.close().await;
	Ok(())
}
