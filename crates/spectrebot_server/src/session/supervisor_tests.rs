#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use spectrebot_domain::{Account, SecretString};
use spectrebot_platform::{ChatEvent, ChatTransport};
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::session::scheduler::{RefreshScheduler, SchedulerConfig};
use crate::session::supervisor::{ChatMessageHandler, ConnectOutcome, ConnectionSupervisor};
use crate::session::{SESSION_EVENTS_CAPACITY, SessionEvent};
use crate::store::{AccountStore, InMemoryAccountStore};
use crate::test_support::{
	FakeProvider, FakeTransport, RecordingHandler, chat_message, credentialed, expired, secret, settle, user,
};

const HOUR: Duration = Duration::from_secs(3600);

struct Harness {
	provider: Arc<FakeProvider>,
	transport: Arc<FakeTransport>,
	scheduler: RefreshScheduler,
	supervisor: ConnectionSupervisor,
	events_rx: mpsc::Receiver<SessionEvent>,
}

fn harness(
	transport: Arc<FakeTransport>,
	handler: Arc<dyn ChatMessageHandler>,
	accounts: impl IntoIterator<Item = Account>,
) -> Harness {
	let provider = FakeProvider::new();
	let store: Arc<dyn AccountStore> = Arc::new(InMemoryAccountStore::with_accounts(accounts));
	let (events_tx, events_rx) = mpsc::channel(SESSION_EVENTS_CAPACITY);
	let scheduler = RefreshScheduler::new(provider.clone(), Arc::clone(&store), events_tx, SchedulerConfig::default());
	let transport_dyn: Arc<dyn ChatTransport> = transport.clone();
	let supervisor = ConnectionSupervisor::new(transport_dyn, store, scheduler.clone(), handler);
	Harness {
		provider,
		transport,
		scheduler,
		supervisor,
		events_rx,
	}
}

fn default_handler() -> Arc<dyn ChatMessageHandler> {
	Arc::new(RecordingHandler::default())
}

#[tokio::test(start_paused = true)]
async fn double_connect_keeps_one_session() {
	let h = harness(
		FakeTransport::user_mode(),
		default_handler(),
		[credentialed("alice", "r0", HOUR)],
	);

	let first = h.supervisor.connect(&user("alice")).await.expect("connect");
	let second = h.supervisor.connect(&user("alice")).await.expect("connect again");

	assert_eq!(first, ConnectOutcome::Connected);
	assert_eq!(second, ConnectOutcome::AlreadyConnected);
	assert_eq!(h.transport.connect_count(), 1);
	assert_eq!(h.supervisor.snapshot().len(), 1);

	let session = h.transport.session(0);
	assert_eq!(session.channel, "alice");
	assert_eq!(session.token.as_deref(), Some("access-alice"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_are_serialized() {
	let h = harness(
		FakeTransport::user_mode(),
		default_handler(),
		[credentialed("alice", "r0", HOUR)],
	);

	let alice = user("alice");
	let (a, b) = tokio::join!(h.supervisor.connect(&alice), h.supervisor.connect(&alice));
	let mut outcomes = vec![a.expect("first"), b.expect("second")];
	outcomes.sort_by_key(|o| *o != ConnectOutcome::Connected);

	assert_eq!(outcomes, vec![ConnectOutcome::Connected, ConnectOutcome::AlreadyConnected]);
	assert_eq!(h.transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_closes_previous_session_first() {
	let h = harness(
		FakeTransport::user_mode(),
		default_handler(),
		[credentialed("alice", "r0", HOUR)],
	);

	h.supervisor.connect(&user("alice")).await.expect("connect");
	let outcome = h.supervisor.reconnect(&user("alice")).await.expect("reconnect");

	assert_eq!(outcome, ConnectOutcome::Connected);
	assert_eq!(h.transport.connect_count(), 2);
	assert!(h.transport.session(0).connection.is_closed());
	assert!(!h.transport.session(1).connection.is_closed());

	let snapshot = h.supervisor.snapshot();
	assert_eq!(snapshot.len(), 1);
	assert_eq!(snapshot[0].session_id, "session-1");
	assert_eq!(snapshot[0].channel, "#alice");
}

#[tokio::test(start_paused = true)]
async fn transport_disconnect_only_flips_flag() {
	let h = harness(
		FakeTransport::user_mode(),
		default_handler(),
		[credentialed("alice", "r0", HOUR)],
	);
	h.supervisor.connect(&user("alice")).await.expect("connect");
	h.scheduler
		.schedule_refresh(user("alice"), secret("r0"), Duration::from_secs(600));

	h.transport
		.emit(
			0,
			ChatEvent::Disconnected {
				channel: "alice".into(),
				reason: Some("server closed".into()),
			},
		)
		.await;
	settle().await;

	assert!(!h.supervisor.is_connected(&user("alice")));
	assert_eq!(h.scheduler.pending_count(), 1, "disconnects never touch refresh scheduling");
	assert!(h.provider.refresh_calls().is_empty());

	let outcome = h.supervisor.connect(&user("alice")).await.expect("connect after drop");
	assert_eq!(outcome, ConnectOutcome::Connected);
	assert!(h.transport.session(0).connection.is_closed());
	assert_eq!(h.supervisor.snapshot().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_credential_waits_for_refresh() {
	let mut h = harness(FakeTransport::user_mode(), default_handler(), [expired("alice", "r0")]);

	let outcome = h.supervisor.connect(&user("alice")).await.expect("connect");
	assert_eq!(outcome, ConnectOutcome::AwaitingCredential);
	assert_eq!(h.transport.connect_count(), 0);

	settle().await;
	assert_eq!(h.provider.refresh_calls(), vec!["r0"]);
	assert_eq!(
		h.events_rx.try_recv().ok(),
		Some(SessionEvent::CredentialRefreshed(user("alice")))
	);
}

#[tokio::test(start_paused = true)]
async fn unknown_or_unrefreshable_accounts_fail() {
	let no_refresh = Account {
		refresh_token: None,
		access_token: Some(SecretString::new("a")),
		..Account::new(user("bob"))
	};
	let h = harness(FakeTransport::user_mode(), default_handler(), [no_refresh]);

	let err = h.supervisor.connect(&user("nobody")).await.expect_err("unknown");
	assert!(matches!(err, SessionError::UnknownAccount(u) if u == user("nobody")));

	let err = h.supervisor.connect(&user("bob")).await.expect_err("no credential");
	assert!(matches!(err, SessionError::NoCredential(_)));
	assert_eq!(h.transport.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn bot_identity_connects_without_user_credential() {
	let h = harness(
		FakeTransport::bot_mode(),
		default_handler(),
		[Account::new(user("carol")).with_player_id("p-carol")],
	);

	let outcome = h.supervisor.connect(&user("carol")).await.expect("connect");
	assert_eq!(outcome, ConnectOutcome::Connected);
	assert_eq!(h.transport.session(0).token, None);
}

#[tokio::test(start_paused = true)]
async fn connect_failure_leaves_no_handle() {
	let h = harness(
		FakeTransport::user_mode(),
		default_handler(),
		[credentialed("alice", "r0", HOUR)],
	);
	h.transport.fail_next_connect();

	let err = h.supervisor.connect(&user("alice")).await.expect_err("rejected");
	assert!(matches!(err, SessionError::ConnectFailed(_)));
	assert!(h.supervisor.snapshot().is_empty());

	let outcome = h.supervisor.connect(&user("alice")).await.expect("retry");
	assert_eq!(outcome, ConnectOutcome::Connected);
}

#[tokio::test(start_paused = true)]
async fn handler_panic_does_not_kill_the_session() {
	let handler = RecordingHandler::panicking_on("!boom");
	let h = harness(
		FakeTransport::user_mode(),
		handler.clone(),
		[credentialed("alice", "r0", HOUR)],
	);
	h.supervisor.connect(&user("alice")).await.expect("connect");

	h.transport
		.emit(0, ChatEvent::Message(chat_message("alice", "viewer", "!boom")))
		.await;
	settle().await;
	h.transport
		.emit(0, ChatEvent::Message(chat_message("alice", "viewer", "!rank")))
		.await;
	settle().await;

	assert_eq!(handler.seen(), vec!["!rank"]);
	assert!(h.supervisor.is_connected(&user("alice")));
}

#[tokio::test(start_paused = true)]
async fn disconnect_all_closes_every_session() {
	let h = harness(
		FakeTransport::user_mode(),
		default_handler(),
		[credentialed("alice", "ra", HOUR), credentialed("bob", "rb", HOUR)],
	);
	h.supervisor.connect(&user("alice")).await.expect("alice");
	h.supervisor.connect(&user("bob")).await.expect("bob");

	assert_eq!(h.supervisor.disconnect_all().await, 2);
	assert!(h.supervisor.snapshot().is_empty());
	assert!(h.transport.session(0).connection.is_closed());
	assert!(h.transport.session(1).connection.is_closed());
	assert!(!h.supervisor.disconnect(&user("alice")).await);
}

#[tokio::test(start_paused = true)]
async fn account_locks_are_released_without_a_session() {
	let h = harness(
		FakeTransport::user_mode(),
		default_handler(),
		[credentialed("alice", "r0", HOUR), credentialed("bob", "r1", HOUR)],
	);

	h.supervisor.connect(&user("alice")).await.expect("connect alice");
	h.supervisor.connect(&user("bob")).await.expect("connect bob");
	assert_eq!(h.supervisor.tracked_locks(), 2);

	assert!(h.supervisor.disconnect(&user("alice")).await);
	assert_eq!(h.supervisor.tracked_locks(), 1);

	assert!(h.supervisor.connect(&user("ghost")).await.is_err());
	assert_eq!(h.supervisor.tracked_locks(), 1, "failed connects leave no lock behind");

	assert_eq!(h.supervisor.disconnect_all().await, 1);
	assert_eq!(h.supervisor.tracked_locks(), 0);
}
