#![forbid(unsafe_code)]

pub mod memory;
pub mod sql;

#[cfg(test)]
mod store_tests;

use std::sync::Arc;
use std::time::SystemTime;

use spectrebot_domain::{Account, SecretString, Username};
use thiserror::Error;
use tracing::warn;

pub use memory::InMemoryAccountStore;
pub use sql::SqlAccountStore;

/// Account persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("account store backend error: {0:#}")]
	Backend(#[from] anyhow::Error),
	#[error("stored account row is corrupt: {0}")]
	Corrupt(String),
}

/// Durable table of linked accounts, keyed by username.
#[async_trait::async_trait]
pub trait AccountStore: Send + Sync + 'static {
	async fn find_by_username(&self, username: &Username) -> Result<Option<Account>, StoreError>;

	async fn list_all(&self) -> Result<Vec<Account>, StoreError>;

	/// Insert or replace the credential fields of `account`.
	///
	/// An existing `player_id` is kept when `account.player_id` is `None`.
	async fn upsert(&self, account: &Account) -> Result<(), StoreError>;

	/// Find-or-create the row and set its player link.
	async fn link_player(&self, username: &Username, player_id: &str) -> Result<(), StoreError>;

	/// Overwrite the credential of an existing row.
	///
	/// Returns `false` when no row exists for `username`.
	async fn update_credential(
		&self,
		username: &Username,
		access_token: &SecretString,
		refresh_token: &SecretString,
		expires_at: SystemTime,
	) -> Result<bool, StoreError>;

	/// Remove every row; returns the number deleted.
	async fn delete_all(&self) -> Result<u64, StoreError>;
}

/// Open the configured store, falling back to memory when no URL is set.
pub async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn AccountStore>> {
	match database_url {
		Some(url) => Ok(Arc::new(SqlAccountStore::connect(url).await?)),
		None => {
			warn!("persistence: no database_url configured; linked accounts will not survive a restart");
			Ok(Arc::new(InMemoryAccountStore::new()))
		}
	}
}
