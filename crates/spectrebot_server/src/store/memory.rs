#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::SystemTime;

use parking_lot::RwLock;
use spectrebot_domain::{Account, SecretString, Username};

use super::{AccountStore, StoreError};

/// Process-local account table.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
	rows: RwLock<BTreeMap<Username, Account>>,
}

impl InMemoryAccountStore {
	pub fn new() -> Self {
		Self::default()
	}

	#[cfg(test)]
	pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
		let rows = accounts.into_iter().map(|a| (a.username.clone(), a)).collect();
		Self { rows: RwLock::new(rows) }
	}
}

#[async_trait::async_trait]
impl AccountStore for InMemoryAccountStore {
	async fn find_by_username(&self, username: &Username) -> Result<Option<Account>, StoreError> {
		Ok(self.rows.read().get(username).cloned())
	}

	async fn list_all(&self) -> Result<Vec<Account>, StoreError> {
		Ok(self.rows.read().values().cloned().collect())
	}

	async fn upsert(&self, account: &Account) -> Result<(), StoreError> {
		let mut rows = self.rows.write();
		let mut next = account.clone();
		if next.player_id.is_none()
			&& let Some(existing) = rows.get(&account.username)
		{
			next.player_id = existing.player_id.clone();
		}
		rows.insert(next.username.clone(), next);
		Ok(())
	}

	async fn link_player(&self, username: &Username, player_id: &str) -> Result<(), StoreError> {
		let mut rows = self.rows.write();
		rows.entry(username.clone())
			.or_insert_with(|| Account::new(username.clone()))
			.player_id = Some(player_id.to_string());
		Ok(())
	}

	async fn update_credential(
		&self,
		username: &Username,
		access_token: &SecretString,
		refresh_token: &SecretString,
		expires_at: SystemTime,
	) -> Result<bool, StoreError> {
		let mut rows = self.rows.write();
		let Some(row) = rows.get_mut(username) else {
			return Ok(false);
		};
		row.access_token = Some(access_token.clone());
		row.refresh_token = Some(refresh_token.clone());
		row.token_expires_at = Some(expires_at);
		Ok(true)
	}

	async fn delete_all(&self) -> Result<u64, StoreError> {
		let mut rows = self.rows.write();
		let n = rows.len() as u64;
		rows.clear();
		Ok(n)
	}
}
