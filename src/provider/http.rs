//! Configuration documents polled from HTTP endpoints.
use std::{hash::Hasher, time::Duration};

use bytes::Bytes;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{one_or_many, send, ConfigEvent, Error, Provider};
use crate::{dynamic::ConfigInfo, pool::Pool};

/// Configuration of the HTTP provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
	/// Endpoints to poll.
	#[serde(alias = "url", deserialize_with = "one_or_many")]
	pub urls: Vec<Url>,
	/// Delay between two polls of one endpoint.
	#[serde(with = "humantime_serde")]
	pub poll_interval: Duration,
	/// Timeout of a single request.
	#[serde(with = "humantime_serde")]
	pub timeout: Option<Duration>,
	/// Forward proxy for every request.
	pub proxy: Option<Url>,
	/// Accept invalid TLS certificates.
	pub tls_skip_verify: bool,
}

impl Default for HttpConfig {
	fn default() -> Self {
		Self {
			urls: Vec::new(),
			poll_interval: Duration::from_secs(5),
			timeout: None,
			proxy: None,
			tls_skip_verify: false,
		}
	}
}

/// Polls endpoints and emits a document whenever its body changes.
#[derive(Debug, Clone)]
pub struct HttpProvider {
	/// What to poll.
	config: HttpConfig,
}

impl HttpProvider {
	/// Create a provider.
	#[must_use]
	pub fn new(config: HttpConfig) -> Self {
		Self { config }
	}

	/// The client used for polling.
	fn client(&self) -> Result<reqwest::Client, Error> {
		let mut builder =
			reqwest::Client::builder().danger_accept_invalid_certs(self.config.tls_skip_verify);
		if let Some(timeout) = self.config.timeout {
			builder = builder.timeout(timeout);
		}
		if let Some(proxy) = &self.config.proxy {
			builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
		}
		Ok(builder.build()?)
	}
}

impl Default for HttpProvider {
	fn default() -> Self {
		Self::new(HttpConfig::default())
	}
}

impl Provider for HttpProvider {
	fn name(&self) -> &'static str {
		"http"
	}

	fn read(&self, url: &Url) -> Result<ConfigEvent, Error> {
		let mut builder = reqwest::blocking::Client::builder()
			.danger_accept_invalid_certs(self.config.tls_skip_verify);
		if let Some(timeout) = self.config.timeout {
			builder = builder.timeout(timeout);
		}
		if let Some(proxy) = &self.config.proxy {
			builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
		}
		let response = builder.build()?.get(url.clone()).send()?;
		if response.status() != reqwest::StatusCode::OK {
			return Err(Error::Status { url: url.clone(), status: response.status() });
		}
		Ok(ConfigEvent { info: ConfigInfo::new("http", url.clone()), raw: response.bytes()? })
	}

	fn start(&self, events: mpsc::Sender<ConfigEvent>, pool: &Pool) -> Result<(), Error> {
		for url in &self.config.urls {
			let client = self.client()?;
			let url = url.clone();
			let events = events.clone();
			let interval = self.config.poll_interval;
			pool.go(move |token| poll(client, url, interval, events, token))?;
		}
		Ok(())
	}
}

/// Body fingerprint used to detect changes.
fn fingerprint(body: &[u8]) -> u64 {
	let mut hasher = FnvHasher::default();
	hasher.write(body);
	hasher.finish()
}

/// Fetch a body, treating anything but `200 OK` as failure.
async fn fetch(client: &reqwest::Client, url: &Url) -> Result<Bytes, Error> {
	let response = client.get(url.clone()).send().await?;
	if response.status() != reqwest::StatusCode::OK {
		return Err(Error::Status { url: url.clone(), status: response.status() });
	}
	Ok(response.bytes().await?)
}

/// Poll one endpoint until `token` fires.
async fn poll(
	client: reqwest::Client,
	url: Url,
	interval: Duration,
	events: mpsc::Sender<ConfigEvent>,
	token: CancellationToken,
) {
	let mut last = None;
	let mut ticker = tokio::time::interval(interval);
	loop {
		tokio::select! {
			() = token.cancelled() => return,
			_ = ticker.tick() => {}
		}
		let body = tokio::select! {
			() = token.cancelled() => return,
			body = fetch(&client, &url) => body,
		};
		match body {
			Ok(body) => {
				let hash = fingerprint(&body);
				if last == Some(hash) {
					continue;
				}
				last = Some(hash);
				debug!("{url} changed");
				let event = ConfigEvent { info: ConfigInfo::new("http", url.clone()), raw: body };
				if !send(&events, event, &token).await {
					return;
				}
			}
			Err(err) => warn!("polling {url}: {err}"),
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::time::Duration;

	use tokio::sync::mpsc;
	use wiremock::{
		matchers::{method, path},
		Mock, MockServer, ResponseTemplate,
	};

	use super::{fingerprint, HttpConfig, HttpProvider};
	use crate::{pool::Pool, provider::Provider};

	#[test]
	fn fingerprint_is_fnv1a_64() {
		assert_eq!(fingerprint(b""), 0xcbf2_9ce4_8422_2325);
		assert_ne!(fingerprint(b"a: 1"), fingerprint(b"a: 2"));
	}

	#[tokio::test]
	async fn emits_only_on_body_change() -> Result<(), Box<dyn std::error::Error>> {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/api.yml"))
			.respond_with(ResponseTemplate::new(200).set_body_string("a: 1"))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/missing.yml"))
			.respond_with(ResponseTemplate::new(404))
			.mount(&server)
			.await;

		let config = HttpConfig {
			urls: vec![
				format!("{}/api.yml", server.uri()).parse()?,
				format!("{}/missing.yml", server.uri()).parse()?,
			],
			poll_interval: Duration::from_millis(50),
			..HttpConfig::default()
		};
		let pool = Pool::new();
		let (tx, mut rx) = mpsc::channel(16);
		HttpProvider::new(config).start(tx, &pool)?;

		let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?.unwrap();
		assert_eq!(event.info.provider, "http");
		assert!(event.info.url.path().ends_with("/api.yml"));
		assert_eq!(&event.raw[..], b"a: 1");
		assert!(tokio::time::timeout(Duration::from_millis(400), rx.recv()).await.is_err());
		pool.stop().await;
		Ok(())
	}
}
