#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::{IdentityProvider, SecretString, StreamStatus, TokenGrant, TokenOwner, TokenValidation};

const AUTHORIZE_PATH: &str = "/oauth2/authorize";
const TOKEN_PATH: &str = "/oauth2/token";
const VALIDATE_PATH: &str = "/oauth2/validate";
const USERS_PATH: &str = "/helix/users";
const STREAMS_PATH: &str = "/helix/streams";

/// Scopes requested by `/login` unless configured otherwise.
pub const DEFAULT_SCOPES: &[&str] = &["user:read:chat", "user:bot", "channel:bot"];

/// Twitch application registration plus endpoint overrides.
#[derive(Debug, Clone)]
pub struct TwitchOAuthConfig {
	pub client_id: String,
	pub client_secret: SecretString,
	pub redirect_uri: String,
	pub scopes: Vec<String>,
	pub oauth_base_url: String,
	pub helix_base_url: String,
	pub force_verify: bool,
}

impl TwitchOAuthConfig {
	pub fn new(client_id: impl Into<String>, client_secret: SecretString, redirect_uri: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret,
			redirect_uri: redirect_uri.into(),
			scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
			oauth_base_url: "https://id.twitch.tv".to_string(),
			helix_base_url: "https://api.twitch.tv".to_string(),
			force_verify: true,
		}
	}
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// Helix reads retry once on 429/5xx; token endpoints never go through here.
async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		debug!(label, delay_ms = delay.as_millis() as u64, "helix rate limited; retrying once");
		tokio::time::sleep(delay).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	Ok(resp)
}

#[derive(Debug, Deserialize)]
struct TwitchTokenResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	expires_in: u64,
	#[serde(default)]
	scope: Vec<String>,
}

impl From<TwitchTokenResponse> for TokenGrant {
	fn from(v: TwitchTokenResponse) -> Self {
		Self {
			access_token: SecretString::new(v.access_token),
			refresh_token: v.refresh_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			expires_in: Duration::from_secs(v.expires_in),
			scopes: v.scope,
		}
	}
}

#[derive(Debug, Deserialize)]
struct TwitchTokenValidation {
	client_id: String,
	login: String,
	user_id: String,
	expires_in: u64,
	#[serde(default)]
	scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HelixUsersResponse {
	data: Vec<HelixUser>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
	id: String,
	login: String,
	#[serde(default)]
	display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixStreamsResponse {
	data: Vec<HelixStream>,
}

#[derive(Debug, Deserialize)]
struct HelixStream {
	started_at: String,
	#[serde(default)]
	title: Option<String>,
}

/// Twitch OAuth + Helix client.
#[derive(Clone, Debug)]
pub struct TwitchIdentityProvider {
	http: reqwest::Client,
	cfg: TwitchOAuthConfig,
	oauth_base: Url,
	helix_base: Url,
}

impl TwitchIdentityProvider {
	pub fn new(cfg: TwitchOAuthConfig) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("spectrebot/0.x (oauth)")
			.timeout(Duration::from_secs(15))
			.build()
			.context("build reqwest client")?;
		let oauth_base = Url::parse(&cfg.oauth_base_url).context("parse twitch oauth base url")?;
		let helix_base = Url::parse(&cfg.helix_base_url).context("parse twitch helix base url")?;

		Ok(Self {
			http,
			cfg,
			oauth_base,
			helix_base,
		})
	}

	fn oauth_url(&self, path: &str) -> anyhow::Result<Url> {
		self.oauth_base.join(path).context("join oauth url")
	}

	fn helix_url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.helix_base.join(path_and_query).context("join helix url")
	}

	fn authed(&self, req: reqwest::RequestBuilder, access_token: &SecretString) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.cfg.client_id)
			.header("Authorization", format!("Bearer {}", access_token.expose()))
	}

	async fn post_token_form(&self, form: &[(&str, &str)], label: &'static str) -> anyhow::Result<TokenGrant> {
		let url = self.oauth_url(TOKEN_PATH)?;
		let resp = self
			.http
			.post(url)
			.form(form)
			.send()
			.await
			.with_context(|| format!("twitch {label} request"))?;

		let status = resp.status();
		let body = resp.text().await.with_context(|| format!("twitch {label} read body"))?;

		if !status.is_success() {
			anyhow::bail!("twitch {label} failed: status={status} body={body}");
		}

		let parsed: TwitchTokenResponse =
			serde_json::from_str(&body).with_context(|| format!("twitch {label} parse json"))?;
		Ok(parsed.into())
	}
}

#[async_trait::async_trait]
impl IdentityProvider for TwitchIdentityProvider {
	fn authorize_url(&self, state: Option<&str>) -> anyhow::Result<String> {
		let mut url = self.oauth_url(AUTHORIZE_PATH)?;
		{
			let mut q = url.query_pairs_mut();
			q.append_pair("client_id", &self.cfg.client_id)
				.append_pair("redirect_uri", &self.cfg.redirect_uri)
				.append_pair("response_type", "code")
				.append_pair("scope", &self.cfg.scopes.join(" "));
			if self.cfg.force_verify {
				q.append_pair("force_verify", "true");
			}
			if let Some(state) = state {
				q.append_pair("state", state);
			}
		}
		Ok(url.into())
	}

	async fn exchange_code(&self, code: &str) -> anyhow::Result<TokenGrant> {
		self.post_token_form(
			&[
				("grant_type", "authorization_code"),
				("client_id", self.cfg.client_id.as_str()),
				("client_secret", self.cfg.client_secret.expose()),
				("code", code),
				("redirect_uri", self.cfg.redirect_uri.as_str()),
			],
			"code exchange",
		)
		.await
	}

	async fn refresh(&self, refresh_token: &SecretString) -> anyhow::Result<TokenGrant> {
		metrics::counter!("spectrebot_twitch_token_refresh_requests_total").increment(1);
		self.post_token_form(
			&[
				("grant_type", "refresh_token"),
				("client_id", self.cfg.client_id.as_str()),
				("client_secret", self.cfg.client_secret.expose()),
				("refresh_token", refresh_token.expose()),
			],
			"refresh token",
		)
		.await
	}

	async fn validate(&self, access_token: &SecretString) -> anyhow::Result<TokenValidation> {
		let url = self.oauth_url(VALIDATE_PATH)?;
		let resp = self
			.http
			.get(url)
			.header("Authorization", format!("OAuth {}", access_token.expose()))
			.send()
			.await
			.context("twitch validate token request")?;

		let status = resp.status();
		let body = resp.text().await.context("twitch validate token read body")?;

		if !status.is_success() {
			anyhow::bail!("twitch validate token failed: status={status} body={body}");
		}

		let v: TwitchTokenValidation = serde_json::from_str(&body).context("twitch validate token parse json")?;
		Ok(TokenValidation {
			client_id: v.client_id,
			login: v.login,
			user_id: v.user_id,
			expires_in: Duration::from_secs(v.expires_in),
			scopes: v.scopes,
		})
	}

	async fn token_owner(&self, access_token: &SecretString) -> anyhow::Result<TokenOwner> {
		let url = self.helix_url(USERS_PATH)?;

		let resp = send_with_retry(self.authed(self.http.get(url), access_token), "GET /helix/users (whoami)")
			.await
			.context("helix GET /helix/users (whoami) send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users (whoami) read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users (whoami) failed: status={status} body={body}");
		}

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users (whoami) parse json")?;
		let user = parsed.data.into_iter().next().context("helix whoami returned empty data")?;

		Ok(TokenOwner {
			id: user.id,
			login: user.login,
			display_name: user.display_name,
		})
	}

	async fn stream_status(&self, login: &str, access_token: &SecretString) -> anyhow::Result<Option<StreamStatus>> {
		let url = self.helix_url(&format!("{STREAMS_PATH}?user_login={}", urlencoding::encode(login)))?;

		let resp = send_with_retry(self.authed(self.http.get(url), access_token), "GET /helix/streams")
			.await
			.context("helix GET /helix/streams send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/streams read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/streams failed: status={status} body={body}");
		}

		let parsed: HelixStreamsResponse = serde_json::from_str(&body).context("helix streams parse json")?;
		let Some(stream) = parsed.data.into_iter().next() else {
			return Ok(None);
		};

		let started_at = chrono::DateTime::parse_from_rfc3339(&stream.started_at)
			.with_context(|| format!("helix streams started_at not rfc3339: {}", stream.started_at))?;

		Ok(Some(StreamStatus {
			started_at: SystemTime::from(started_at),
			title: stream.title,
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn provider() -> TwitchIdentityProvider {
		let cfg = TwitchOAuthConfig::new("cid", SecretString::new("secret"), "http://localhost:3000/callback");
		TwitchIdentityProvider::new(cfg).expect("provider")
	}

	#[test]
	fn authorize_url_carries_scopes_and_state() {
		let url = provider().authorize_url(Some("st.ate")).expect("url");
		let parsed = Url::parse(&url).expect("parse");
		assert_eq!(parsed.host_str(), Some("id.twitch.tv"));
		assert_eq!(parsed.path(), "/oauth2/authorize");

		let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
		let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
		assert_eq!(get("client_id").as_deref(), Some("cid"));
		assert_eq!(get("response_type").as_deref(), Some("code"));
		assert_eq!(get("scope").as_deref(), Some("user:read:chat user:bot channel:bot"));
		assert_eq!(get("force_verify").as_deref(), Some("true"));
		assert_eq!(get("state").as_deref(), Some("st.ate"));
	}

	#[test]
	fn token_response_without_refresh_token() {
		let parsed: TwitchTokenResponse =
			serde_json::from_str(r#"{"access_token":"a","expires_in":14000,"token_type":"bearer"}"#).expect("json");
		let grant = TokenGrant::from(parsed);
		assert!(grant.refresh_token.is_none());
		assert_eq!(grant.expires_in, Duration::from_secs(14_000));
	}

	#[test]
	fn retry_after_header_is_honored() {
		let mut headers = HeaderMap::new();
		headers.insert(RETRY_AFTER, "3".parse().expect("header"));
		assert_eq!(retry_delay_from_headers(&headers), Some(Duration::from_secs(3)));
	}
}
