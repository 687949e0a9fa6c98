#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use futures::FutureExt;
use parking_lot::Mutex;
use spectrebot_domain::Username;
use spectrebot_platform::{ChatConnection, ChatCredentials, ChatEvent, ChatEventRx, ChatMessage, ChatTransport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::scheduler::RefreshScheduler;
use crate::error::SessionError;
use crate::store::AccountStore;

/// Per-connection event buffer.
const CHAT_EVENTS_CAPACITY: usize = 256;

/// Receives every chat message from a supervised connection.
#[async_trait::async_trait]
pub trait ChatMessageHandler: Send + Sync + 'static {
	async fn handle(&self, connection: Arc<dyn ChatConnection>, message: ChatMessage);
}

/// Result of a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
	Connected,
	AlreadyConnected,
	/// No usable credential yet; a refresh was requested and its completion
	/// will trigger a reconnect.
	AwaitingCredential,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
	pub username: Username,
	pub channel: String,
	pub session_id: String,
	pub connected: bool,
}

struct ConnectionHandle {
	channel: String,
	connected: Arc<AtomicBool>,
	connection: Arc<dyn ChatConnection>,
	dispatcher: JoinHandle<()>,
}

impl ConnectionHandle {
	async fn shutdown(self) {
		self.connection.close().await;
		self.dispatcher.abort();
	}
}

struct SupervisorInner {
	transport: Arc<dyn ChatTransport>,
	store: Arc<dyn AccountStore>,
	scheduler: RefreshScheduler,
	handler: Arc<dyn ChatMessageHandler>,
	handles: Mutex<HashMap<Username, ConnectionHandle>>,
	locks: Mutex<HashMap<Username, Arc<tokio::sync::Mutex<()>>>>,
}

/// Owns one chat connection per account.
///
/// Connect, reconnect and disconnect for the same account are serialized.
#[derive(Clone)]
pub struct ConnectionSupervisor {
	inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
	pub fn new(
		transport: Arc<dyn ChatTransport>,
		store: Arc<dyn AccountStore>,
		scheduler: RefreshScheduler,
		handler: Arc<dyn ChatMessageHandler>,
	) -> Self {
		Self {
			inner: Arc::new(SupervisorInner {
				transport,
				store,
				scheduler,
				handler,
				handles: Mutex::new(HashMap::new()),
				locks: Mutex::new(HashMap::new()),
			}),
		}
	}

	pub fn requires_user_credential(&self) -> bool {
		self.inner.transport.requires_user_credential()
	}

	fn account_lock(&self, username: &Username) -> Arc<tokio::sync::Mutex<()>> {
		self.inner
			.locks
			.lock()
			.entry(username.clone())
			.or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
			.clone()
	}

	/// Forget the lock for `username` once it has no session and no other holder.
	fn release_lock(&self, username: &Username, lock: Arc<tokio::sync::Mutex<()>>) {
		drop(lock);
		if self.inner.handles.lock().contains_key(username) {
			return;
		}
		let mut locks = self.inner.locks.lock();
		if locks.get(username).is_some_and(|l| Arc::strong_count(l) == 1) {
			locks.remove(username);
		}
	}

	#[cfg(test)]
	pub(crate) fn tracked_locks(&self) -> usize {
		self.inner.locks.lock().len()
	}

	/// Open the chat session for `username` unless one is already live.
	pub async fn connect(&self, username: &Username) -> Result<ConnectOutcome, SessionError> {
		let lock = self.account_lock(username);
		let guard = lock.lock().await;
		let outcome = self.connect_locked(username).await;
		drop(guard);
		self.release_lock(username, lock);
		outcome
	}

	/// Tear down any existing session, then connect again.
	pub async fn reconnect(&self, username: &Username) -> Result<ConnectOutcome, SessionError> {
		let lock = self.account_lock(username);
		let guard = lock.lock().await;

		let existing = self.inner.handles.lock().remove(username);
		if let Some(handle) = existing {
			debug!(%username, "closing session before reconnect");
			handle.shutdown().await;
		}
		metrics::counter!("spectrebot_chat_reconnects_total").increment(1);
		let outcome = self.connect_locked(username).await;
		drop(guard);
		self.release_lock(username, lock);
		outcome
	}

	/// Close the session for `username`; returns whether one existed.
	pub async fn disconnect(&self, username: &Username) -> bool {
		let lock = self.account_lock(username);
		let guard = lock.lock().await;

		let existing = self.inner.handles.lock().remove(username);
		let existed = existing.is_some();
		if let Some(handle) = existing {
			handle.shutdown().await;
		}
		drop(guard);
		self.release_lock(username, lock);
		self.update_gauge();
		existed
	}

	/// Close every session; returns how many were closed.
	pub async fn disconnect_all(&self) -> usize {
		let usernames: Vec<Username> = self.inner.handles.lock().keys().cloned().collect();
		let mut closed = 0;
		for username in usernames {
			if self.disconnect(&username).await {
				closed += 1;
			}
		}
		info!(closed, "closed all chat sessions");
		closed
	}

	pub fn is_connected(&self, username: &Username) -> bool {
		self.inner
			.handles
			.lock()
			.get(username)
			.is_some_and(|h| h.connected.load(Ordering::Relaxed))
	}

	pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
		let handles = self.inner.handles.lock();
		let mut out: Vec<ConnectionSnapshot> = handles
			.iter()
			.map(|(username, h)| ConnectionSnapshot {
				username: username.clone(),
				channel: h.channel.clone(),
				session_id: h.connection.session_id().to_string(),
				connected: h.connected.load(Ordering::Relaxed),
			})
			.collect();
		out.sort_by(|a, b| a.username.cmp(&b.username));
		out
	}

	async fn connect_locked(&self, username: &Username) -> Result<ConnectOutcome, SessionError> {
		if self.is_connected(username) {
			debug!(%username, "already connected");
			return Ok(ConnectOutcome::AlreadyConnected);
		}

		let credentials = if self.inner.transport.requires_user_credential() {
			match self.user_credentials(username).await? {
				Some(c) => Some(c),
				None => return Ok(ConnectOutcome::AwaitingCredential),
			}
		} else {
			None
		};

		let stale = self.inner.handles.lock().remove(username);
		if let Some(handle) = stale {
			debug!(%username, "replacing disconnected session");
			handle.shutdown().await;
		}

		let (events_tx, events_rx) = mpsc::channel(CHAT_EVENTS_CAPACITY);
		let connection = self
			.inner
			.transport
			.connect(username.as_str(), credentials, events_tx)
			.await
			.map_err(|e| {
				metrics::counter!("spectrebot_chat_connect_failures_total").increment(1);
				SessionError::ConnectFailed(e)
			})?;

		let connected = Arc::new(AtomicBool::new(true));
		let dispatcher = spawn_dispatcher(
			username.clone(),
			events_rx,
			Arc::clone(&connected),
			Arc::clone(&connection),
			Arc::clone(&self.inner.handler),
		);

		info!(%username, session_id = %connection.session_id(), "chat session established");
		self.inner.handles.lock().insert(
			username.clone(),
			ConnectionHandle {
				channel: username.channel(),
				connected,
				connection,
				dispatcher,
			},
		);
		metrics::counter!("spectrebot_chat_connects_total").increment(1);
		self.update_gauge();

		Ok(ConnectOutcome::Connected)
	}

	/// `Ok(None)` means a refresh was started instead.
	async fn user_credentials(&self, username: &Username) -> Result<Option<ChatCredentials>, SessionError> {
		let account = self
			.inner
			.store
			.find_by_username(username)
			.await?
			.ok_or_else(|| SessionError::UnknownAccount(username.clone()))?;

		if let Some(cred) = account.credential() {
			if !cred.is_expired(SystemTime::now()) {
				return Ok(Some(ChatCredentials {
					login: username.to_string(),
					oauth_token: cred.access_token,
				}));
			}
			info!(%username, "credential expired; refreshing before connect");
			self.inner.scheduler.refresh_now(username.clone(), cred.refresh_token);
			return Ok(None);
		}

		match account.refresh_token {
			Some(refresh_token) if !refresh_token.is_empty() => {
				info!(%username, "credential incomplete; refreshing before connect");
				self.inner.scheduler.refresh_now(username.clone(), refresh_token);
				Ok(None)
			}
			_ => Err(SessionError::NoCredential(username.clone())),
		}
	}

	fn update_gauge(&self) {
		let n = self.inner.handles.lock().len();
		metrics::gauge!("spectrebot_chat_sessions").set(n as f64);
	}
}

fn spawn_dispatcher(
	username: Username,
	mut events_rx: ChatEventRx,
	connected: Arc<AtomicBool>,
	connection: Arc<dyn ChatConnection>,
	handler: Arc<dyn ChatMessageHandler>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(ev) = events_rx.recv().await {
			match ev {
				ChatEvent::Connected { channel } => {
					connected.store(true, Ordering::Relaxed);
					debug!(%username, %channel, "chat session reports connected");
				}
				ChatEvent::Message(message) => {
					metrics::counter!("spectrebot_chat_messages_total").increment(1);
					let handler = Arc::clone(&handler);
					let connection = Arc::clone(&connection);
					let username = username.clone();
					tokio::spawn(async move {
						let fut = AssertUnwindSafe(handler.handle(connection, message));
						if fut.catch_unwind().await.is_err() {
							metrics::counter!("spectrebot_command_panics_total").increment(1);
							warn!(%username, "chat message handler panicked");
						}
					});
				}
				ChatEvent::Disconnected { channel, reason } => {
					connected.store(false, Ordering::Relaxed);
					metrics::counter!("spectrebot_chat_disconnects_total").increment(1);
					warn!(%username, %channel, reason = ?reason, "chat session disconnected");
				}
			}
		}
		debug!(%username, "chat events channel closed; dispatcher exiting");
	})
}
