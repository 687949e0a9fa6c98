#![forbid(unsafe_code)]

pub mod coordinator;
pub mod scheduler;
pub mod supervisor;


#[cfg(test)]
mod supervisor_tests;


use spectrebot_domain::Username;

pub use coordinator::{CoordinatorConfig, SessionCoordinator};
pub use scheduler::{RefreshScheduler, SchedulerConfig};
pub use supervisor::{ChatMessageHandler, ConnectionSupervisor};

/// Events consumed by the coordinator's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
	/// A new credential was persisted for the account.
	CredentialRefreshed(Username),
	/// A player id was linked outside the OAuth flow.
	PlayerLinked(Username),
	/// Administrative wipe of every account.
	ResetRequested { requested_by: String },
}

/// Bounded capacity for the session event channel.
pub const SESSION_EVENTS_CAPACITY: usize = 256;
