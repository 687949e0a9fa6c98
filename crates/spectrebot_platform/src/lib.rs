#![forbid(unsafe_code)]

pub mod twitch;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub use spectrebot_domain::SecretString;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Result of an authorization-code or refresh-token exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
	pub access_token: SecretString,
	/// Absent when the provider does not rotate refresh tokens.
	pub refresh_token: Option<SecretString>,
	pub expires_in: Duration,
	pub scopes: Vec<String>,
}

/// Result of validating an access token.
#[derive(Debug, Clone)]
pub struct TokenValidation {
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	pub expires_in: Duration,
	pub scopes: Vec<String>,
}

/// User that owns an access token.
#[derive(Debug, Clone)]
pub struct TokenOwner {
	pub id: String,
	pub login: String,
	pub display_name: Option<String>,
}

/// Live stream metadata.
#[derive(Debug, Clone)]
pub struct StreamStatus {
	pub started_at: SystemTime,
	pub title: Option<String>,
}

/// OAuth identity provider plus the few platform API reads the bot needs.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
	/// Browser URL that starts the authorization-code flow.
	fn authorize_url(&self, state: Option<&str>) -> anyhow::Result<String>;

	async fn exchange_code(&self, code: &str) -> anyhow::Result<TokenGrant>;

	/// Exchange a refresh token. Never retries.
	async fn refresh(&self, refresh_token: &SecretString) -> anyhow::Result<TokenGrant>;

	async fn validate(&self, access_token: &SecretString) -> anyhow::Result<TokenValidation>;

	async fn token_owner(&self, access_token: &SecretString) -> anyhow::Result<TokenOwner>;

	/// `Ok(None)` when the channel is offline.
	async fn stream_status(&self, login: &str, access_token: &SecretString) -> anyhow::Result<Option<StreamStatus>>;
}

/// Login used to authenticate a chat session.
#[derive(Debug, Clone)]
pub struct ChatCredentials {
	pub login: String,
	pub oauth_token: SecretString,
}

/// Metadata about the author of a chat message.
#[derive(Debug, Clone, Default)]
pub struct ChatSender {
	pub login: String,
	pub display_name: String,
	pub user_id: Option<String>,
	/// Badge name -> version (e.g. `moderator` -> `1`).
	pub badges: BTreeMap<String, String>,
	pub message_id: Option<String>,
}

impl ChatSender {
	pub fn has_badge(&self, badge: &str) -> bool {
		self.badges.contains_key(badge)
	}

	pub fn is_moderator(&self) -> bool {
		self.has_badge("moderator")
	}

	pub fn is_broadcaster_of(&self, channel: &str) -> bool {
		self.has_badge("broadcaster") || self.login.eq_ignore_ascii_case(channel)
	}

	/// Name to address the sender with in replies.
	pub fn mention(&self) -> &str {
		if self.display_name.is_empty() {
			&self.login
		} else {
			&self.display_name
		}
	}
}

/// Chat message received on a channel.
#[derive(Debug, Clone)]
pub struct ChatMessage {
	/// Channel name without the leading `#`.
	pub channel: String,
	pub sender: ChatSender,
	pub text: String,
}

/// Transport → supervisor event.
#[derive(Debug, Clone)]
pub enum ChatEvent {
	Connected { channel: String },
	Message(ChatMessage),
	Disconnected { channel: String, reason: Option<String> },
}

pub type ChatEventTx = mpsc::Sender<ChatEvent>;
pub type ChatEventRx = mpsc::Receiver<ChatEvent>;

/// One live chat session.
#[async_trait::async_trait]
pub trait ChatConnection: Send + Sync + 'static {
	fn session_id(&self) -> &str;

	/// Queue a message; delivery is best-effort.
	fn say(&self, channel: &str, text: &str);

	/// Close the session and wait for the socket to shut down.
	async fn close(&self);
}

/// Opens chat sessions.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync + 'static {
	/// Whether sessions must be authenticated as the account itself rather than
	/// a shared bot identity.
	fn requires_user_credential(&self) -> bool;

	/// Connect and join `channel`; returns once the server acknowledged the
	/// login.
	async fn connect(
		&self,
		channel: &str,
		user_credentials: Option<ChatCredentials>,
		events: ChatEventTx,
	) -> anyhow::Result<Arc<dyn ChatConnection>>;
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Split chat text into a lower-cased command token and its arguments.
///
/// Returns `None` unless the first token starts with `prefix`.
pub fn split_command(text: &str, prefix: char) -> Option<(String, Vec<String>)> {
	let mut tokens = text.split_whitespace();
	let first = tokens.next()?;
	let name = first.strip_prefix(prefix)?;
	if name.is_empty() {
		return None;
	}
	Some((name.to_lowercase(), tokens.map(str::to_string).collect()))
}
