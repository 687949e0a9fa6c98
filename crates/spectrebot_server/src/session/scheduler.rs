#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use spectrebot_domain::{SecretString, Username};
use spectrebot_platform::IdentityProvider;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::SessionEvent;
use crate::error::SessionError;
use crate::store::{AccountStore, StoreError};

/// Refresh timing policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	/// How long before expiry a refresh is attempted.
	pub refresh_lead: Duration,
	/// Floor for any computed refresh delay.
	pub min_refresh_delay: Duration,
	/// Delay before retrying a failed refresh.
	pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			refresh_lead: Duration::from_secs(300),
			min_refresh_delay: Duration::from_secs(60),
			retry_delay: Duration::from_secs(60),
		}
	}
}

/// Outcome of an immediate token validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
	/// Token is live; a refresh timer was armed.
	Valid { remaining: Duration },
	/// Token was rejected; a refresh is underway.
	Refreshing,
}

/// Pending timer, as seen from outside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRefresh {
	pub delay: Duration,
	pub due_at: Instant,
}

/// Counters from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
	pub validated: usize,
	pub refreshed: usize,
	pub already_tracked: usize,
	pub without_credential: usize,
}

struct TimerEntry {
	generation: u64,
	delay: Duration,
	due_at: Instant,
	handle: JoinHandle<()>,
}

struct SchedulerInner {
	provider: Arc<dyn IdentityProvider>,
	store: Arc<dyn AccountStore>,
	events_tx: mpsc::Sender<SessionEvent>,
	cfg: SchedulerConfig,
	timers: Mutex<HashMap<Username, TimerEntry>>,
	in_flight: Mutex<HashSet<Username>>,
	next_generation: AtomicU64,
	/// Bumped by `cancel_all`; refreshes started before the bump never re-arm.
	epoch: AtomicU64,
}

/// Per-account single-shot refresh timers.
///
/// At most one timer is pending per account and at most one refresh runs per
/// account. A refresh is never cancelled once started: it runs detached from
/// the timer that triggered it.
#[derive(Clone)]
pub struct RefreshScheduler {
	inner: Arc<SchedulerInner>,
}

impl RefreshScheduler {
	pub fn new(
		provider: Arc<dyn IdentityProvider>,
		store: Arc<dyn AccountStore>,
		events_tx: mpsc::Sender<SessionEvent>,
		cfg: SchedulerConfig,
	) -> Self {
		Self {
			inner: Arc::new(SchedulerInner {
				provider,
				store,
				events_tx,
				cfg,
				timers: Mutex::new(HashMap::new()),
				in_flight: Mutex::new(HashSet::new()),
				next_generation: AtomicU64::new(1),
				epoch: AtomicU64::new(0),
			}),
		}
	}

	/// Delay until the next refresh for a token with `expires_in` left.
	pub fn refresh_delay(&self, expires_in: Duration) -> Duration {
		expires_in
			.saturating_sub(self.inner.cfg.refresh_lead)
			.max(self.inner.cfg.min_refresh_delay)
	}

	/// Arm the refresh timer for `username`, replacing any pending one.
	pub fn schedule_refresh(&self, username: Username, refresh_token: SecretString, delay: Duration) {
		let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
		let this = self.clone();
		let timer_user = username.clone();
		let due_at = Instant::now() + delay;

		let mut timers = self.inner.timers.lock();
		let handle = tokio::spawn(async move {
			tokio::time::sleep_until(due_at).await;
			this.fire(timer_user, generation, refresh_token);
		});
		let entry = TimerEntry {
			generation,
			delay,
			due_at,
			handle,
		};
		if let Some(previous) = timers.insert(username.clone(), entry) {
			previous.handle.abort();
			debug!(%username, "replaced pending refresh timer");
		}
		drop(timers);

		metrics::gauge!("spectrebot_refresh_timers_pending").set(self.pending_count() as f64);
		debug!(%username, delay_secs = delay.as_secs(), "refresh scheduled");
	}

	fn fire(&self, username: Username, generation: u64, refresh_token: SecretString) {
		{
			let mut timers = self.inner.timers.lock();
			match timers.get(&username) {
				Some(entry) if entry.generation == generation => {
					timers.remove(&username);
				}
				_ => return,
			}
		}
		self.refresh_now(username, refresh_token);
	}

	/// Start a refresh immediately, superseding any pending timer.
	///
	/// Returns `false` when a refresh for this account is already running.
	pub fn refresh_now(&self, username: Username, refresh_token: SecretString) -> bool {
		if !self.inner.in_flight.lock().insert(username.clone()) {
			debug!(%username, "refresh already in flight; coalescing");
			return false;
		}
		self.cancel(&username);

		let epoch = self.inner.epoch.load(Ordering::SeqCst);
		let this = self.clone();
		tokio::spawn(async move {
			this.run_refresh(&username, refresh_token, epoch).await;
			this.inner.in_flight.lock().remove(&username);
		});
		true
	}

	async fn run_refresh(&self, username: &Username, refresh_token: SecretString, epoch: u64) {
		metrics::counter!("spectrebot_refresh_attempts_total").increment(1);

		let result = self.rotate(username, &refresh_token).await;
		if self.inner.epoch.load(Ordering::SeqCst) != epoch {
			info!(%username, "scheduler reset during refresh; dropping schedule");
			return;
		}

		match result {
			Ok(Some((next_refresh, expires_in))) => {
				metrics::counter!("spectrebot_refresh_success_total").increment(1);
				let delay = self.refresh_delay(expires_in);
				info!(
					%username,
					expires_in_secs = expires_in.as_secs(),
					next_refresh_secs = delay.as_secs(),
					"credential refreshed"
				);
				self.schedule_refresh(username.clone(), next_refresh, delay);
				if self
					.inner
					.events_tx
					.send(SessionEvent::CredentialRefreshed(username.clone()))
					.await
					.is_err()
				{
					debug!(%username, "session event receiver closed; refresh not forwarded");
				}
			}
			Ok(None) => {
				info!(%username, "account removed during refresh; dropping schedule");
			}
			Err((e, retry_token)) => {
				metrics::counter!("spectrebot_refresh_failures_total").increment(1);
				let retry = self.inner.cfg.retry_delay;
				warn!(%username, error = %e, retry_secs = retry.as_secs(), "credential refresh failed; retrying");
				self.schedule_refresh(username.clone(), retry_token, retry);
			}
		}
	}

	/// Exchange and persist. On failure, returns the refresh token to retry with.
	async fn rotate(
		&self,
		username: &Username,
		refresh_token: &SecretString,
	) -> Result<Option<(SecretString, Duration)>, (SessionError, SecretString)> {
		let grant = self
			.inner
			.provider
			.refresh(refresh_token)
			.await
			.map_err(|e| (SessionError::RefreshFailed(e), refresh_token.clone()))?;

		let next_refresh = grant.refresh_token.clone().unwrap_or_else(|| refresh_token.clone());
		let expires_at = SystemTime::now() + grant.expires_in;

		match self
			.inner
			.store
			.update_credential(username, &grant.access_token, &next_refresh, expires_at)
			.await
		{
			Ok(true) => Ok(Some((next_refresh, grant.expires_in))),
			Ok(false) => Ok(None),
			Err(e) => Err((SessionError::Store(e), next_refresh)),
		}
	}

	/// Check `access_token` now; schedule from its remaining lifetime, or
	/// refresh immediately if it is rejected.
	pub async fn validate_now(
		&self,
		username: &Username,
		access_token: &SecretString,
		refresh_token: &SecretString,
	) -> ValidationOutcome {
		metrics::counter!("spectrebot_token_validations_total").increment(1);

		match self.inner.provider.validate(access_token).await {
			Ok(v) => {
				let delay = self.refresh_delay(v.expires_in);
				debug!(%username, expires_in_secs = v.expires_in.as_secs(), "token valid");
				self.schedule_refresh(username.clone(), refresh_token.clone(), delay);
				ValidationOutcome::Valid { remaining: v.expires_in }
			}
			Err(e) => {
				let e = SessionError::ValidationFailed(e);
				info!(%username, error = %e, "token rejected; refreshing now");
				self.refresh_now(username.clone(), refresh_token.clone());
				ValidationOutcome::Refreshing
			}
		}
	}

	/// Re-check every stored credential that nothing is currently tracking.
	pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
		let accounts = self.inner.store.list_all().await?;
		let now = SystemTime::now();
		let mut report = SweepReport::default();

		for account in accounts {
			let Some(cred) = account.credential() else {
				report.without_credential += 1;
				continue;
			};
			let username = account.username;
			if self.pending(&username).is_some() || self.is_refreshing(&username) {
				report.already_tracked += 1;
				continue;
			}

			if cred.is_expired(now) {
				info!(%username, "stored token expired; refreshing");
				self.refresh_now(username, cred.refresh_token);
				report.refreshed += 1;
			} else {
				self.validate_now(&username, &cred.access_token, &cred.refresh_token)
					.await;
				report.validated += 1;
			}
		}

		Ok(report)
	}

	/// Drop the pending timer for `username`, if any.
	pub fn cancel(&self, username: &Username) -> bool {
		let removed = self.inner.timers.lock().remove(username);
		match removed {
			Some(entry) => {
				entry.handle.abort();
				true
			}
			None => false,
		}
	}

	/// Drop every pending timer; returns how many were cancelled.
	///
	/// Refreshes already in flight finish their exchange but neither re-arm a
	/// timer nor announce the new credential.
	pub fn cancel_all(&self) -> usize {
		self.inner.epoch.fetch_add(1, Ordering::SeqCst);
		let drained: Vec<TimerEntry> = self.inner.timers.lock().drain().map(|(_, e)| e).collect();
		for entry in &drained {
			entry.handle.abort();
		}
		metrics::gauge!("spectrebot_refresh_timers_pending").set(0.0);
		drained.len()
	}

	pub fn pending(&self, username: &Username) -> Option<PendingRefresh> {
		self.inner.timers.lock().get(username).map(|e| PendingRefresh {
			delay: e.delay,
			due_at: e.due_at,
		})
	}

	pub fn pending_count(&self) -> usize {
		self.inner.timers.lock().len()
	}

	pub fn is_refreshing(&self, username: &Username) -> bool {
		self.inner.in_flight.lock().contains(username)
	}
}
