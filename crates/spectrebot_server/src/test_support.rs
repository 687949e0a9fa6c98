#![forbid(unsafe_code)]

//! Scripted fakes shared by the session and command tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use spectrebot_domain::{Account, Credential, SecretString, Username};
use spectrebot_platform::{
	ChatConnection, ChatCredentials, ChatEvent, ChatEventTx, ChatMessage, ChatSender, ChatTransport, IdentityProvider,
	StreamStatus, TokenGrant, TokenOwner, TokenValidation,
};

use crate::session::ChatMessageHandler;
use crate::stats::{PlayerProfile, StatsProvider};
use crate::store::{AccountStore, InMemoryAccountStore, StoreError};

pub fn user(name: &str) -> Username {
	Username::new(name).expect("valid username")
}

pub fn secret(s: &str) -> SecretString {
	SecretString::new(s)
}

/// Account whose credential expires `expires_in` from now.
pub fn credentialed(name: &str, refresh: &str, expires_in: Duration) -> Account {
	Account::new(user(name)).with_credential(Credential {
		access_token: secret(&format!("access-{name}")),
		refresh_token: secret(refresh),
		expires_at: SystemTime::now() + expires_in,
	})
}

/// Account whose credential expired a minute ago.
pub fn expired(name: &str, refresh: &str) -> Account {
	Account::new(user(name)).with_credential(Credential {
		access_token: secret(&format!("access-{name}")),
		refresh_token: secret(refresh),
		expires_at: SystemTime::now() - Duration::from_secs(60),
	})
}

/// Let spawned tasks run until every one of them is blocked.
///
/// Under a paused clock the sleep only completes once the runtime is idle.
pub async fn settle() {
	for _ in 0..10 {
		tokio::task::yield_now().await;
	}
	tokio::time::sleep(Duration::from_millis(1)).await;
	for _ in 0..10 {
		tokio::task::yield_now().await;
	}
}

enum RefreshStep {
	Grant {
		access: String,
		refresh: Option<String>,
		expires_in: Duration,
	},
	Fail,
}

/// Identity provider driven by per-call scripts.
///
/// With an empty script, refreshes succeed with numbered tokens and a one
/// hour lifetime, and validations report one hour remaining.
#[derive(Default)]
pub struct FakeProvider {
	refresh_script: Mutex<VecDeque<RefreshStep>>,
	validate_script: Mutex<VecDeque<Option<Duration>>>,
	refresh_calls: Mutex<Vec<String>>,
	validate_calls: AtomicUsize,
	refresh_latency: Mutex<Duration>,
	stream: Mutex<Option<StreamStatus>>,
	issued: AtomicUsize,
}

impl FakeProvider {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn push_refresh_ok(&self, access: &str, refresh: Option<&str>, expires_in: Duration) {
		self.refresh_script.lock().push_back(RefreshStep::Grant {
			access: access.to_string(),
			refresh: refresh.map(str::to_string),
			expires_in,
		});
	}

	pub fn push_refresh_err(&self) {
		self.refresh_script.lock().push_back(RefreshStep::Fail);
	}

	pub fn push_validate_ok(&self, remaining: Duration) {
		self.validate_script.lock().push_back(Some(remaining));
	}

	pub fn push_validate_err(&self) {
		self.validate_script.lock().push_back(None);
	}

	pub fn set_refresh_latency(&self, latency: Duration) {
		*self.refresh_latency.lock() = latency;
	}

	pub fn set_stream(&self, stream: Option<StreamStatus>) {
		*self.stream.lock() = stream;
	}

	/// Refresh tokens presented so far, in call order.
	pub fn refresh_calls(&self) -> Vec<String> {
		self.refresh_calls.lock().clone()
	}

	pub fn validate_calls(&self) -> usize {
		self.validate_calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl IdentityProvider for FakeProvider {
	fn authorize_url(&self, state: Option<&str>) -> anyhow::Result<String> {
		Ok(format!("https://id.example/authorize?state={}", state.unwrap_or_default()))
	}

	async fn exchange_code(&self, code: &str) -> anyhow::Result<TokenGrant> {
		if code == "bad" {
			anyhow::bail!("code rejected");
		}
		Ok(TokenGrant {
			access_token: secret("access-from-code"),
			refresh_token: Some(secret("refresh-from-code")),
			expires_in: Duration::from_secs(3600),
			scopes: Vec::new(),
		})
	}

	async fn refresh(&self, refresh_token: &SecretString) -> anyhow::Result<TokenGrant> {
		self.refresh_calls.lock().push(refresh_token.expose().to_string());
		let latency = *self.refresh_latency.lock();
		if !latency.is_zero() {
			tokio::time::sleep(latency).await;
		}

		let step = self.refresh_script.lock().pop_front();
		match step {
			Some(RefreshStep::Fail) => anyhow::bail!("invalid refresh token"),
			Some(RefreshStep::Grant {
				access,
				refresh,
				expires_in,
			}) => Ok(TokenGrant {
				access_token: secret(&access),
				refresh_token: refresh.as_deref().map(secret),
				expires_in,
				scopes: Vec::new(),
			}),
			None => {
				let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
				Ok(TokenGrant {
					access_token: secret(&format!("access-{n}")),
					refresh_token: Some(secret(&format!("refresh-{n}"))),
					expires_in: Duration::from_secs(3600),
					scopes: Vec::new(),
				})
			}
		}
	}

	async fn validate(&self, _access_token: &SecretString) -> anyhow::Result<TokenValidation> {
		self.validate_calls.fetch_add(1, Ordering::SeqCst);
		let step = self.validate_script.lock().pop_front();
		match step.unwrap_or(Some(Duration::from_secs(3600))) {
			Some(expires_in) => Ok(TokenValidation {
				client_id: "client".into(),
				login: "someone".into(),
				user_id: "1".into(),
				expires_in,
				scopes: Vec::new(),
			}),
			None => anyhow::bail!("invalid access token"),
		}
	}

	async fn token_owner(&self, _access_token: &SecretString) -> anyhow::Result<TokenOwner> {
		Ok(TokenOwner {
			id: "42".into(),
			login: "NewStreamer".into(),
			display_name: Some("NewStreamer".into()),
		})
	}

	async fn stream_status(&self, _login: &str, _access_token: &SecretString) -> anyhow::Result<Option<StreamStatus>> {
		Ok(self.stream.lock().clone())
	}
}

/// Chat connection that records what it was asked to do.
pub struct FakeConnection {
	id: String,
	said: Mutex<Vec<(String, String)>>,
	closed: AtomicBool,
}

impl FakeConnection {
	pub fn new(id: impl Into<String>) -> Arc<Self> {
		Arc::new(Self {
			id: id.into(),
			said: Mutex::new(Vec::new()),
			closed: AtomicBool::new(false),
		})
	}

	pub fn said(&self) -> Vec<String> {
		self.said.lock().iter().map(|(_, text)| text.clone()).collect()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl ChatConnection for FakeConnection {
	fn session_id(&self) -> &str {
		&self.id
	}

	fn say(&self, channel: &str, text: &str) {
		self.said.lock().push((channel.to_string(), text.to_string()));
	}

	async fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}
}

/// One recorded `connect` call.
pub struct FakeSession {
	pub channel: String,
	pub token: Option<String>,
	pub connection: Arc<FakeConnection>,
	pub events: ChatEventTx,
}

pub struct FakeTransport {
	user_mode: bool,
	fail_next: AtomicBool,
	sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeTransport {
	/// Sessions authenticate as the account itself.
	pub fn user_mode() -> Arc<Self> {
		Arc::new(Self {
			user_mode: true,
			fail_next: AtomicBool::new(false),
			sessions: Mutex::new(Vec::new()),
		})
	}

	/// Sessions share a bot identity.
	pub fn bot_mode() -> Arc<Self> {
		Arc::new(Self {
			user_mode: false,
			fail_next: AtomicBool::new(false),
			sessions: Mutex::new(Vec::new()),
		})
	}

	pub fn fail_next_connect(&self) {
		self.fail_next.store(true, Ordering::SeqCst);
	}

	pub fn connect_count(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn session(&self, idx: usize) -> Arc<FakeSession> {
		Arc::clone(&self.sessions.lock()[idx])
	}

	pub async fn emit(&self, idx: usize, event: ChatEvent) {
		let session = self.session(idx);
		session.events.send(event).await.expect("dispatcher alive");
	}
}

#[async_trait::async_trait]
impl ChatTransport for FakeTransport {
	fn requires_user_credential(&self) -> bool {
		self.user_mode
	}

	async fn connect(
		&self,
		channel: &str,
		user_credentials: Option<ChatCredentials>,
		events: ChatEventTx,
	) -> anyhow::Result<Arc<dyn ChatConnection>> {
		if self.fail_next.swap(false, Ordering::SeqCst) {
			anyhow::bail!("login authentication failed");
		}
		let idx = self.sessions.lock().len();
		let connection = FakeConnection::new(format!("session-{idx}"));
		let _ = events
			.send(ChatEvent::Connected {
				channel: channel.to_string(),
			})
			.await;
		self.sessions.lock().push(Arc::new(FakeSession {
			channel: channel.to_string(),
			token: user_credentials.map(|c| c.oauth_token.expose().to_string()),
			connection: Arc::clone(&connection),
			events,
		}));
		Ok(connection)
	}
}

pub fn chat_message(channel: &str, login: &str, text: &str) -> ChatMessage {
	ChatMessage {
		channel: channel.to_string(),
		sender: ChatSender {
			login: login.to_lowercase(),
			display_name: login.to_string(),
			..ChatSender::default()
		},
		text: text.to_string(),
	}
}

/// Records message texts; panics on `panic_on`.
#[derive(Default)]
pub struct RecordingHandler {
	pub panic_on: Option<String>,
	seen: Mutex<Vec<String>>,
}

impl RecordingHandler {
	pub fn panicking_on(text: &str) -> Arc<Self> {
		Arc::new(Self {
			panic_on: Some(text.to_string()),
			seen: Mutex::new(Vec::new()),
		})
	}

	pub fn seen(&self) -> Vec<String> {
		self.seen.lock().clone()
	}
}

#[async_trait::async_trait]
impl ChatMessageHandler for RecordingHandler {
	async fn handle(&self, _connection: Arc<dyn ChatConnection>, message: ChatMessage) {
		if self.panic_on.as_deref() == Some(message.text.as_str()) {
			panic!("handler blew up on {}", message.text);
		}
		self.seen.lock().push(message.text);
	}
}

/// In-memory store with switchable write failures.
#[derive(Default)]
pub struct FlakyStore {
	inner: InMemoryAccountStore,
	pub fail_updates: AtomicBool,
	pub fail_deletes: AtomicBool,
}

impl FlakyStore {
	pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Arc<Self> {
		Arc::new(Self {
			inner: InMemoryAccountStore::with_accounts(accounts),
			..Self::default()
		})
	}

	fn injected() -> StoreError {
		StoreError::Backend(anyhow::anyhow!("database is locked"))
	}
}

#[async_trait::async_trait]
impl AccountStore for FlakyStore {
	async fn find_by_username(&self, username: &Username) -> Result<Option<Account>, StoreError> {
		self.inner.find_by_username(username).await
	}

	async fn list_all(&self) -> Result<Vec<Account>, StoreError> {
		self.inner.list_all().await
	}

	async fn upsert(&self, account: &Account) -> Result<(), StoreError> {
		self.inner.upsert(account).await
	}

	async fn link_player(&self, username: &Username, player_id: &str) -> Result<(), StoreError> {
		self.inner.link_player(username, player_id).await
	}

	async fn update_credential(
		&self,
		username: &Username,
		access_token: &SecretString,
		refresh_token: &SecretString,
		expires_at: SystemTime,
	) -> Result<bool, StoreError> {
		if self.fail_updates.load(Ordering::SeqCst) {
			return Err(Self::injected());
		}
		self.inner
			.update_credential(username, access_token, refresh_token, expires_at)
			.await
	}

	async fn delete_all(&self) -> Result<u64, StoreError> {
		if self.fail_deletes.load(Ordering::SeqCst) {
			return Err(Self::injected());
		}
		self.inner.delete_all().await
	}
}

/// Stats API returning a fixed profile, or an error when unset.
#[derive(Default)]
pub struct FakeStats {
	profile: Mutex<Option<PlayerProfile>>,
	requests: Mutex<Vec<String>>,
}

impl FakeStats {
	pub fn set_profile(&self, profile: PlayerProfile) {
		*self.profile.lock() = Some(profile);
	}

	pub fn requests(&self) -> Vec<String> {
		self.requests.lock().clone()
	}
}

#[async_trait::async_trait]
impl StatsProvider for FakeStats {
	async fn full_profile(&self, player_id: &str) -> anyhow::Result<PlayerProfile> {
		self.requests.lock().push(player_id.to_string());
		self.profile
			.lock()
			.clone()
			.ok_or_else(|| anyhow::anyhow!("stats api returned 502"))
	}
}
