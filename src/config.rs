//! Static startup configuration of the mock server.
use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
	error::Error,
	provider::{
		FileConfig, FileProvider, GitConfig, GitProvider, HttpConfig, HttpProvider, PackageConfig,
		PackageProvider, Provider,
	},
};

/// Configuration loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticConfig {
	/// Logging settings.
	pub log: LogConfig,
	/// Sources of dynamic configuration.
	pub providers: ProvidersConfig,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
	/// An `EnvFilter` directive such as `info` or `mimic=debug,warn`.
	pub level: String,
}

impl Default for LogConfig {
	fn default() -> Self {
		Self { level: "info".to_owned() }
	}
}

/// Which providers to run. Absent providers are not started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
	/// Local files and directories.
	pub file: Option<FileConfig>,
	/// Polled HTTP endpoints.
	pub http: Option<HttpConfig>,
	/// Git repositories.
	pub git: Option<GitConfig>,
	/// Installed packages.
	pub package: Option<PackageConfig>,
}

impl StaticConfig {
	/// Read the configuration from a YAML file.
	pub fn load(path: &Path) -> Result<Self, Error> {
		let content = std::fs::read_to_string(path)?;
		Self::from_yaml(&content)
	}

	/// Parse the configuration from YAML text.
	pub fn from_yaml(content: &str) -> Result<Self, Error> {
		Ok(serde_yaml::from_str(content)?)
	}

	/// Add directories to scan, enabling the file provider.
	pub fn add_directories(&mut self, directories: impl IntoIterator<Item = PathBuf>) {
		let mut directories = directories.into_iter().peekable();
		if directories.peek().is_none() {
			return;
		}
		self.providers.file.get_or_insert_with(FileConfig::default).directories.extend(directories);
	}

	/// Add endpoints to poll, enabling the HTTP provider.
	pub fn add_urls(&mut self, urls: impl IntoIterator<Item = Url>) {
		let mut urls = urls.into_iter().peekable();
		if urls.peek().is_none() {
			return;
		}
		self.providers.http.get_or_insert_with(HttpConfig::default).urls.extend(urls);
	}

	/// Instantiate the configured providers.
	#[must_use]
	pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
		let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
		if let Some(file) = &self.providers.file {
			providers.push(Arc::new(FileProvider::new(file.clone())));
		}
		if let Some(http) = &self.providers.http {
			providers.push(Arc::new(HttpProvider::new(http.clone())));
		}
		if let Some(git) = &self.providers.git {
			providers.push(Arc::new(GitProvider::new(git.clone())));
		}
		if let Some(package) = &self.providers.package {
			providers.push(Arc::new(PackageProvider::new(package.clone())));
		}
		providers
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{path::PathBuf, time::Duration};

	use url::Url;

	use super::StaticConfig;

	/// A configuration using every provider.
	const EXAMPLE_CONFIG: &str = r#"
log:
  level: debug
providers:
  file:
    directory: ./mocks
    skipPrefix: ["_", "."]
  http:
    url: https://config.example.com/ldap.yml
    pollInterval: 30s
    timeout: 2s
  git:
    url: https://github.com/example/mocks.git//ldap?ref=main
    pullInterval: 1m
  package:
    packages:
      - name: shared-mocks
        include: ["*.yml"]
"#;

	#[test]
	fn parse_example() -> Result<(), Box<dyn std::error::Error>> {
		let config = StaticConfig::from_yaml(EXAMPLE_CONFIG)?;
		assert_eq!(config.log.level, "debug");

		let file = config.providers.file.as_ref().unwrap();
		assert_eq!(file.directories, vec![PathBuf::from("./mocks")]);
		assert_eq!(file.skip_prefixes, vec!["_".to_owned(), ".".to_owned()]);

		let http = config.providers.http.as_ref().unwrap();
		assert_eq!(http.poll_interval, Duration::from_secs(30));
		assert_eq!(http.timeout, Some(Duration::from_secs(2)));

		let git = config.providers.git.as_ref().unwrap();
		assert_eq!(git.pull_interval, Duration::from_secs(60));
		assert_eq!(git.urls.len(), 1);

		assert_eq!(config.providers.package.as_ref().unwrap().packages[0].name, "shared-mocks");
		assert_eq!(config.providers().len(), 4);
		Ok(())
	}

	#[test]
	fn defaults() -> Result<(), Box<dyn std::error::Error>> {
		let config = StaticConfig::from_yaml("providers:\n  file:\n    directory: ./mocks\n")?;
		assert_eq!(config.log.level, "info");
		let file = config.providers.file.as_ref().unwrap();
		assert_eq!(file.skip_prefixes, vec!["_".to_owned()]);
		assert!(config.providers.http.is_none());
		assert_eq!(config.providers().len(), 1);
		Ok(())
	}

	#[test]
	fn command_line_is_merged() -> Result<(), Box<dyn std::error::Error>> {
		let mut config = StaticConfig::default();
		config.add_directories(Vec::new());
		config.add_urls(Vec::new());
		assert!(config.providers().is_empty());

		config.add_directories([PathBuf::from("a"), PathBuf::from("b")]);
		config.add_urls([Url::parse("http://localhost:8080/ldap.yml")?]);
		assert_eq!(config.providers.file.as_ref().unwrap().directories.len(), 2);
		assert_eq!(config.providers.http.as_ref().unwrap().urls.len(), 1);
		assert_eq!(config.providers().len(), 2);
		Ok(())
	}

	#[test]
	fn invalid_yaml() {
		assert!(StaticConfig::from_yaml("providers: [").is_err());
	}
}
