//! GitHub App installation tokens for cloning private repositories.
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::debug;

use crate::provider::Error;

/// Default GitHub REST API endpoint.
const API_URL: &str = "https://api.github.com";

/// Credentials of a GitHub App installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubAuth {
	/// The App's id.
	pub app_id: u64,
	/// The installation's id.
	pub installation_id: u64,
	/// PEM encoded RSA private key of the App.
	pub private_key_path: PathBuf,
	/// REST API endpoint, for GitHub Enterprise.
	#[serde(default)]
	pub api_url: Option<String>,
}

/// Claims of the App's JWT assertion.
#[derive(Debug, Serialize)]
struct Claims {
	/// Issued at, backdated against clock drift.
	iat: i64,
	/// Expiry, at most ten minutes after issue.
	exp: i64,
	/// The App's id.
	iss: String,
}

/// A minted installation token.
#[derive(Debug, Clone)]
struct InstallationToken {
	/// The token.
	token: String,
	/// When the token stops working.
	expires_at: OffsetDateTime,
}

/// Response of the access token endpoint.
#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
	/// The token.
	token: String,
	/// RFC 3339 expiry.
	expires_at: String,
}

/// Mints and caches installation tokens.
#[derive(Debug)]
pub struct GitHubApp {
	/// The credentials.
	auth: GitHubAuth,
	/// Client for the REST API.
	client: reqwest::Client,
	/// The current token.
	cached: Mutex<Option<InstallationToken>>,
}

impl GitHubApp {
	/// Create a token source.
	pub fn new(auth: GitHubAuth) -> Result<Self, Error> {
		let client = reqwest::Client::builder().user_agent("mimic").build()?;
		Ok(Self { auth, client, cached: Mutex::new(None) })
	}

	/// A signed JWT identifying the App.
	fn assertion(&self) -> Result<String, Error> {
		let pem = std::fs::read(&self.auth.private_key_path)?;
		let key = EncodingKey::from_rsa_pem(&pem)?;
		let now = OffsetDateTime::now_utc().unix_timestamp();
		let claims = Claims { iat: now - 60, exp: now + 9 * 60, iss: self.auth.app_id.to_string() };
		Ok(jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)?)
	}

	/// A valid installation token, minting a new one shortly before the
	/// cached one expires.
	pub async fn token(&self) -> Result<String, Error> {
		let mut cached = self.cached.lock().await;
		if let Some(token) = cached.as_ref() {
			if token.expires_at - Duration::minutes(1) > OffsetDateTime::now_utc() {
				return Ok(token.token.clone());
			}
		}

		let api = self.auth.api_url.as_deref().unwrap_or(API_URL).trim_end_matches('/');
		let endpoint =
			format!("{api}/app/installations/{}/access_tokens", self.auth.installation_id);
		let response = self
			.client
			.post(&endpoint)
			.bearer_auth(self.assertion()?)
			.header("Accept", "application/vnd.github+json")
			.send()
			.await?;
		if !response.status().is_success() {
			let status = response.status();
			let body = response.text().await.unwrap_or_default();
			return Err(Error::GitHub(format!("{endpoint} responded with {status}: {body}")));
		}
		let minted: AccessTokenResponse = response.json().await?;
		let expires_at = OffsetDateTime::parse(&minted.expires_at, &Rfc3339)
			.map_err(|err| Error::GitHub(format!("invalid token expiry: {err}")))?;
		debug!("minted installation token valid until {expires_at}");
		*cached = Some(InstallationToken { token: minted.token.clone(), expires_at });
		Ok(minted.token)
	}

	/// The HTTP header carrying a valid installation token.
	pub async fn header(&self) -> Result<String, Error> {
		Ok(basic_header(&self.token().await?))
	}
}

/// Git's basic authorization header for an installation token.
fn basic_header(token: &str) -> String {
	format!("Authorization: Basic {}", STANDARD.encode(format!("x-access-token:{token}")))
}
