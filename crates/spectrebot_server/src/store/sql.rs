#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::SystemTime;

use anyhow::{Context, anyhow};
use spectrebot_domain::{Account, SecretString, Username};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use super::{AccountStore, StoreError};
use crate::util::time::{from_unix_secs, to_unix_secs};

type AccountRow = (String, Option<String>, Option<String>, Option<String>, Option<i64>);

/// `accounts` table over sqlite, postgres or mysql.
#[derive(Clone)]
pub struct SqlAccountStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlAccountStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			let mut pool_opts = SqlitePoolOptions::new();
			if database_url.contains(":memory:") {
				pool_opts = pool_opts.max_connections(1).idle_timeout(None).max_lifetime(None);
			}
			let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			SqlBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			SqlBackend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"));
		};

		info!(backend = backend.name(), "account store connected");
		Ok(Self { backend })
	}
}

impl SqlBackend {
	fn name(&self) -> &'static str {
		match self {
			Self::Sqlite(_) => "sqlite",
			Self::Postgres(_) => "postgres",
			Self::Mysql(_) => "mysql",
		}
	}
}

fn account_from_row(row: AccountRow) -> Result<Account, StoreError> {
	let (username, player_id, access_token, refresh_token, token_expires_at) = row;
	let username =
		Username::new(&username).map_err(|e| StoreError::Corrupt(format!("username {username:?}: {e}")))?;

	Ok(Account {
		username,
		player_id,
		access_token: access_token.map(SecretString::new),
		refresh_token: refresh_token.map(SecretString::new),
		token_expires_at: token_expires_at.map(from_unix_secs),
	})
}

#[async_trait::async_trait]
impl AccountStore for SqlAccountStore {
	async fn find_by_username(&self, username: &Username) -> Result<Option<Account>, StoreError> {
		let row: Option<AccountRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT username, player_id, access_token, refresh_token, token_expires_at FROM accounts WHERE username = ?",
			)
			.bind(username.as_str())
			.fetch_optional(pool)
			.await
			.context("select account (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT username, player_id, access_token, refresh_token, token_expires_at FROM accounts WHERE username = $1",
			)
			.bind(username.as_str())
			.fetch_optional(pool)
			.await
			.context("select account (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as(
				"SELECT username, player_id, access_token, refresh_token, token_expires_at FROM accounts WHERE username = ?",
			)
			.bind(username.as_str())
			.fetch_optional(pool)
			.await
			.context("select account (mysql)")?,
		};

		row.map(account_from_row).transpose()
	}

	async fn list_all(&self) -> Result<Vec<Account>, StoreError> {
		const SQL: &str =
			"SELECT username, player_id, access_token, refresh_token, token_expires_at FROM accounts ORDER BY username";

		let rows: Vec<AccountRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(SQL)
				.fetch_all(pool)
				.await
				.context("select accounts (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(SQL)
				.fetch_all(pool)
				.await
				.context("select accounts (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as(SQL)
				.fetch_all(pool)
				.await
				.context("select accounts (mysql)")?,
		};

		rows.into_iter().map(account_from_row).collect()
	}

	async fn upsert(&self, account: &Account) -> Result<(), StoreError> {
		let username = account.username.as_str();
		let player_id = account.player_id.as_deref();
		let access_token = account.access_token.as_ref().map(|t| t.expose());
		let refresh_token = account.refresh_token.as_ref().map(|t| t.expose());
		let expires_at = account.token_expires_at.map(to_unix_secs);

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO accounts (username, player_id, access_token, refresh_token, token_expires_at) \
					VALUES (?, ?, ?, ?, ?) \
					ON CONFLICT(username) DO UPDATE SET \
					player_id = COALESCE(excluded.player_id, accounts.player_id), \
					access_token = excluded.access_token, \
					refresh_token = excluded.refresh_token, \
					token_expires_at = excluded.token_expires_at, \
					updated_at = strftime('%s','now')",
				)
				.bind(username)
				.bind(player_id)
				.bind(access_token)
				.bind(refresh_token)
				.bind(expires_at)
				.execute(pool)
				.await
				.context("upsert account (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO accounts (username, player_id, access_token, refresh_token, token_expires_at) \
					VALUES ($1, $2, $3, $4, $5) \
					ON CONFLICT (username) DO UPDATE SET \
					player_id = COALESCE(EXCLUDED.player_id, accounts.player_id), \
					access_token = EXCLUDED.access_token, \
					refresh_token = EXCLUDED.refresh_token, \
					token_expires_at = EXCLUDED.token_expires_at, \
					updated_at = NOW()",
				)
				.bind(username)
				.bind(player_id)
				.bind(access_token)
				.bind(refresh_token)
				.bind(expires_at)
				.execute(pool)
				.await
				.context("upsert account (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO accounts (username, player_id, access_token, refresh_token, token_expires_at) \
					VALUES (?, ?, ?, ?, ?) \
					ON DUPLICATE KEY UPDATE \
					player_id = COALESCE(VALUES(player_id), player_id), \
					access_token = VALUES(access_token), \
					refresh_token = VALUES(refresh_token), \
					token_expires_at = VALUES(token_expires_at)",
				)
				.bind(username)
				.bind(player_id)
				.bind(access_token)
				.bind(refresh_token)
				.bind(expires_at)
				.execute(pool)
				.await
				.context("upsert account (mysql)")?;
			}
		}

		Ok(())
	}

	async fn link_player(&self, username: &Username, player_id: &str) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO accounts (username, player_id) VALUES (?, ?) \
					ON CONFLICT(username) DO UPDATE SET player_id = excluded.player_id, updated_at = strftime('%s','now')",
				)
				.bind(username.as_str())
				.bind(player_id)
				.execute(pool)
				.await
				.context("link player (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO accounts (username, player_id) VALUES ($1, $2) \
					ON CONFLICT (username) DO UPDATE SET player_id = EXCLUDED.player_id, updated_at = NOW()",
				)
				.bind(username.as_str())
				.bind(player_id)
				.execute(pool)
				.await
				.context("link player (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO accounts (username, player_id) VALUES (?, ?) \
					ON DUPLICATE KEY UPDATE player_id = VALUES(player_id)",
				)
				.bind(username.as_str())
				.bind(player_id)
				.execute(pool)
				.await
				.context("link player (mysql)")?;
			}
		}

		Ok(())
	}

	async fn update_credential(
		&self,
		username: &Username,
		access_token: &SecretString,
		refresh_token: &SecretString,
		expires_at: SystemTime,
	) -> Result<bool, StoreError> {
		let expires_at = to_unix_secs(expires_at);

		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"UPDATE accounts SET access_token = ?, refresh_token = ?, token_expires_at = ?, \
				updated_at = strftime('%s','now') WHERE username = ?",
			)
			.bind(access_token.expose())
			.bind(refresh_token.expose())
			.bind(expires_at)
			.bind(username.as_str())
			.execute(pool)
			.await
			.context("update credential (sqlite)")?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(
				"UPDATE accounts SET access_token = $1, refresh_token = $2, token_expires_at = $3, \
				updated_at = NOW() WHERE username = $4",
			)
			.bind(access_token.expose())
			.bind(refresh_token.expose())
			.bind(expires_at)
			.bind(username.as_str())
			.execute(pool)
			.await
			.context("update credential (postgres)")?
			.rows_affected(),
			SqlBackend::Mysql(pool) => sqlx::query(
				"UPDATE accounts SET access_token = ?, refresh_token = ?, token_expires_at = ? WHERE username = ?",
			)
			.bind(access_token.expose())
			.bind(refresh_token.expose())
			.bind(expires_at)
			.bind(username.as_str())
			.execute(pool)
			.await
			.context("update credential (mysql)")?
			.rows_affected(),
		};

		Ok(affected > 0)
	}

	async fn delete_all(&self) -> Result<u64, StoreError> {
		let deleted = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM accounts")
				.execute(pool)
				.await
				.context("delete accounts (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM accounts")
				.execute(pool)
				.await
				.context("delete accounts (postgres)")?
				.rows_affected(),
			SqlBackend::Mysql(pool) => sqlx::query("DELETE FROM accounts")
				.execute(pool)
				.await
				.context("delete accounts (mysql)")?
				.rows_affected(),
		};

		Ok(deleted)
	}
}
