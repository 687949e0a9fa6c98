#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use spectrebot_domain::{Account, Credential, SecretString, Username};

use crate::store::{AccountStore, InMemoryAccountStore, SqlAccountStore};

fn user(name: &str) -> Username {
	Username::new(name).expect("valid username")
}

fn credential(tag: &str, expires_secs: u64) -> Credential {
	Credential {
		access_token: SecretString::new(format!("access-{tag}")),
		refresh_token: SecretString::new(format!("refresh-{tag}")),
		expires_at: UNIX_EPOCH + Duration::from_secs(expires_secs),
	}
}

async fn exercise_store(store: Arc<dyn AccountStore>) {
	assert!(store.list_all().await.expect("list").is_empty());

	store.link_player(&user("alice"), "player-1").await.expect("link");
	let alice = store.find_by_username(&user("alice")).await.expect("find").expect("row");
	assert_eq!(alice.player_id.as_deref(), Some("player-1"));
	assert!(alice.credential().is_none(), "link alone must not create a credential");

	let authorized = Account::new(user("alice")).with_credential(credential("a1", 1_800_000_000));
	store.upsert(&authorized).await.expect("upsert");
	let alice = store.find_by_username(&user("alice")).await.expect("find").expect("row");
	assert_eq!(alice.player_id.as_deref(), Some("player-1"), "upsert must keep the player link");
	assert_eq!(alice.credential(), Some(credential("a1", 1_800_000_000)));

	let next = credential("a2", 1_800_003_600);
	let updated = store
		.update_credential(&user("alice"), &next.access_token, &next.refresh_token, next.expires_at)
		.await
		.expect("update");
	assert!(updated);
	let alice = store.find_by_username(&user("alice")).await.expect("find").expect("row");
	assert_eq!(alice.credential(), Some(next.clone()));

	let missing = store
		.update_credential(&user("ghost"), &next.access_token, &next.refresh_token, next.expires_at)
		.await
		.expect("update missing");
	assert!(!missing);

	store
		.upsert(&Account::new(user("bob")).with_credential(credential("b1", 1_800_000_000)))
		.await
		.expect("upsert bob");
	let all = store.list_all().await.expect("list");
	assert_eq!(all.len(), 2);

	assert_eq!(store.delete_all().await.expect("delete"), 2);
	assert!(store.list_all().await.expect("list").is_empty());
	assert!(store.find_by_username(&user("alice")).await.expect("find").is_none());
}

#[tokio::test]
async fn in_memory_store_contract() {
	exercise_store(Arc::new(InMemoryAccountStore::new())).await;
}

#[tokio::test]
async fn sqlite_store_contract() {
	let store = SqlAccountStore::connect("sqlite::memory:").await.expect("sqlite store");
	exercise_store(Arc::new(store)).await;
}

#[tokio::test]
async fn unsupported_database_url_is_rejected() {
	let err = match SqlAccountStore::connect("redis://localhost").await {
		Ok(_) => panic!("redis url should be rejected"),
		Err(e) => e,
	};
	assert!(err.to_string().contains("unsupported database_url"));
}
