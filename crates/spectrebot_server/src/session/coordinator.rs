#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use spectrebot_domain::{Account, Username};
use spectrebot_platform::TokenGrant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SessionEvent;
use super::scheduler::{RefreshScheduler, ValidationOutcome};
use super::supervisor::{ConnectOutcome, ConnectionSupervisor};
use crate::error::SessionError;
use crate::notify::Notifier;
use crate::store::{AccountStore, StoreError};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
	/// Period of the credential sweep; zero disables it.
	pub sweep_interval: Duration,
}

impl Default for CoordinatorConfig {
	fn default() -> Self {
		Self {
			sweep_interval: Duration::from_secs(60),
		}
	}
}

/// Counters from a bootstrap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
	pub accounts: usize,
	pub validated: usize,
	pub refreshing: usize,
	pub connected: usize,
	pub skipped: usize,
	pub failed: usize,
}

/// Result of a completed OAuth link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedAccount {
	pub username: Username,
	/// `None` when the chat connect failed.
	pub connection: Option<ConnectOutcome>,
}

/// Ties the store, the refresh scheduler and the connection supervisor
/// together.
pub struct SessionCoordinator {
	store: Arc<dyn AccountStore>,
	scheduler: RefreshScheduler,
	supervisor: ConnectionSupervisor,
	notifier: Notifier,
	cfg: CoordinatorConfig,
}

/// Background tasks owned by a running coordinator.
pub struct CoordinatorTasks {
	event_loop: JoinHandle<()>,
	sweep_loop: Option<JoinHandle<()>>,
}

impl CoordinatorTasks {
	pub fn abort(self) {
		self.event_loop.abort();
		if let Some(sweep) = self.sweep_loop {
			sweep.abort();
		}
	}
}

impl SessionCoordinator {
	pub fn new(
		store: Arc<dyn AccountStore>,
		scheduler: RefreshScheduler,
		supervisor: ConnectionSupervisor,
		notifier: Notifier,
		cfg: CoordinatorConfig,
	) -> Self {
		Self {
			store,
			scheduler,
			supervisor,
			notifier,
			cfg,
		}
	}

	pub fn scheduler(&self) -> &RefreshScheduler {
		&self.scheduler
	}

	pub fn supervisor(&self) -> &ConnectionSupervisor {
		&self.supervisor
	}

	pub fn store(&self) -> &Arc<dyn AccountStore> {
		&self.store
	}

	/// Reconcile every stored account with the scheduler and supervisor.
	///
	/// One account's failure never stops the others.
	pub async fn bootstrap(&self) -> Result<BootstrapReport, StoreError> {
		let accounts = self.store.list_all().await?;
		let mut report = BootstrapReport {
			accounts: accounts.len(),
			..BootstrapReport::default()
		};
		info!(accounts = accounts.len(), "bootstrapping account sessions");

		for account in accounts {
			self.bootstrap_account(account, &mut report).await;
		}

		info!(
			validated = report.validated,
			refreshing = report.refreshing,
			connected = report.connected,
			skipped = report.skipped,
			failed = report.failed,
			"bootstrap complete"
		);
		Ok(report)
	}

	async fn bootstrap_account(&self, account: Account, report: &mut BootstrapReport) {
		let username = account.username.clone();

		let Some(cred) = account.credential() else {
			report.skipped += 1;
			if account.has_player_link() && !self.supervisor.requires_user_credential() {
				self.connect_reporting(&username, report).await;
			} else {
				debug!(%username, "no usable credential; not scheduling");
			}
			return;
		};

		if cred.is_expired(SystemTime::now()) {
			info!(%username, "stored token expired; refreshing");
			self.scheduler.refresh_now(username, cred.refresh_token);
			report.refreshing += 1;
			return;
		}

		match self
			.scheduler
			.validate_now(&username, &cred.access_token, &cred.refresh_token)
			.await
		{
			ValidationOutcome::Valid { .. } => {
				report.validated += 1;
				self.connect_reporting(&username, report).await;
			}
			ValidationOutcome::Refreshing => report.refreshing += 1,
		}
	}

	async fn connect_reporting(&self, username: &Username, report: &mut BootstrapReport) {
		match self.supervisor.connect(username).await {
			Ok(ConnectOutcome::Connected | ConnectOutcome::AlreadyConnected) => report.connected += 1,
			Ok(ConnectOutcome::AwaitingCredential) => report.refreshing += 1,
			Err(e) => {
				report.failed += 1;
				warn!(%username, error = %e, "bootstrap connect failed");
			}
		}
	}

	/// Persist a freshly authorized account, arm its refresh and connect.
	///
	/// Connect failures are logged, not returned: the account is stored either way.
	pub async fn on_account_linked(&self, login: &str, grant: TokenGrant) -> Result<LinkedAccount, SessionError> {
		let username = Username::new(login)?;
		let expires_at = SystemTime::now() + grant.expires_in;

		// Without a refresh token the access token alone is not a usable credential.
		let refresh_token = match grant.refresh_token {
			Some(token) => Some(token),
			None => self
				.store
				.find_by_username(&username)
				.await?
				.and_then(|existing| existing.refresh_token)
				.filter(|token| !token.is_empty()),
		};

		let account = match &refresh_token {
			Some(refresh_token) => Account {
				username: username.clone(),
				player_id: None,
				access_token: Some(grant.access_token.clone()),
				refresh_token: Some(refresh_token.clone()),
				token_expires_at: Some(expires_at),
			},
			None => Account::new(username.clone()),
		};
		self.store.upsert(&account).await?;
		metrics::counter!("spectrebot_accounts_linked_total").increment(1);

		match refresh_token {
			Some(refresh_token) => {
				info!(%username, expires_in_secs = grant.expires_in.as_secs(), "account authorized");
				let delay = self.scheduler.refresh_delay(grant.expires_in);
				self.scheduler.schedule_refresh(username.clone(), refresh_token, delay);
			}
			None => warn!(%username, "authorization returned no refresh token; stored without a credential"),
		}

		let connection = match self.supervisor.connect(&username).await {
			Ok(outcome) => Some(outcome),
			Err(e) => {
				warn!(%username, error = %e, "connect after authorization failed; sweep will retry");
				None
			}
		};
		self.notifier.notify(format!("New account added {username}"));
		Ok(LinkedAccount { username, connection })
	}

	/// New credential is persisted; swap the live session onto it.
	pub async fn on_credential_refreshed(&self, username: &Username) {
		match self.supervisor.reconnect(username).await {
			Ok(outcome) => {
				debug!(%username, ?outcome, "reconnected after refresh");
				self.notifier.notify(format!("Token refreshed for {username}"));
			}
			Err(e) => warn!(%username, error = %e, "reconnect after refresh failed"),
		}
	}

	/// Connect an account that just gained a player link.
	pub async fn on_player_linked(&self, username: &Username) {
		if self.supervisor.requires_user_credential() {
			let has_credential = matches!(
				self.store.find_by_username(username).await,
				Ok(Some(account)) if account.credential().is_some()
			);
			if !has_credential {
				debug!(%username, "player linked without credential; waiting for OAuth");
				return;
			}
		}
		if let Err(e) = self.supervisor.connect(username).await {
			warn!(%username, error = %e, "connect after player link failed");
		}
	}

	/// Delete every account, cancel all timers and close all sessions.
	///
	/// Nothing is cancelled when the store rejects the delete.
	pub async fn reset_all(&self) -> Result<u64, SessionError> {
		let deleted = self.store.delete_all().await?;
		let cancelled = self.scheduler.cancel_all();
		let closed = self.supervisor.disconnect_all().await;
		warn!(deleted, cancelled, closed, "all accounts reset");
		Ok(deleted)
	}

	pub async fn handle_event(&self, event: SessionEvent) {
		match event {
			SessionEvent::CredentialRefreshed(username) => self.on_credential_refreshed(&username).await,
			SessionEvent::PlayerLinked(username) => self.on_player_linked(&username).await,
			SessionEvent::ResetRequested { requested_by } => {
				info!(%requested_by, "reset requested");
				if let Err(e) = self.reset_all().await {
					warn!(error = %e, "reset failed");
				}
			}
		}
	}

	/// Spawn the event loop and the periodic sweep.
	pub fn spawn(self: Arc<Self>, mut events_rx: mpsc::Receiver<SessionEvent>) -> CoordinatorTasks {
		let this = Arc::clone(&self);
		let event_loop = tokio::spawn(async move {
			while let Some(event) = events_rx.recv().await {
				this.handle_event(event).await;
			}
			debug!("session events channel closed; coordinator exiting");
		});

		let sweep_loop = (!self.cfg.sweep_interval.is_zero()).then(|| {
			let this = Arc::clone(&self);
			let period = self.cfg.sweep_interval;
			tokio::spawn(async move {
				let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
				ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
				loop {
					ticker.tick().await;
					match this.scheduler.sweep().await {
						Ok(report) => debug!(?report, "credential sweep"),
						Err(e) => warn!(error = %e, "credential sweep failed"),
					}
				}
			})
		});

		CoordinatorTasks { event_loop, sweep_loop }
	}
}
