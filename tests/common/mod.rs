//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use fedistore::cache::Caches;
use fedistore::config::{CacheConfig, DatabaseConfig, InstanceConfig};
use fedistore::data::{Account, Conversation, Database, EntityId, Status};
use fedistore::{Ctx, Store};
use tempfile::TempDir;

pub const LOCAL_HOST: &str = "local.example";

/// Test store instance
pub struct TestStore {
    pub store: Store,
    pub _temp_dir: TempDir,
}

impl TestStore {
    /// Create a store in blocklist mode on a fresh database
    pub async fn new() -> Self {
        Self::with_mode("blocklist").await
    }

    pub async fn with_mode(federation_mode: &str) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(temp_dir.path(), federation_mode).await;
        Self {
            store,
            _temp_dir: temp_dir,
        }
    }

    /// A second store over the same database file, with its own caches
    ///
    /// Stands in for another process sharing the database.
    pub async fn sibling(&self) -> Store {
        open_store(self._temp_dir.path(), "blocklist").await
    }

    pub async fn create_account(&self, username: &str) -> Account {
        let now = Utc::now();
        let mut account = Account {
            id: EntityId::new().0,
            uri: format!("https://remote.example/users/{username}"),
            username: username.to_string(),
            domain: Some("remote.example".to_string()),
            display_name: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_account(&Ctx::new(), &mut account).await.unwrap();
        account
    }

    pub async fn create_status(&self, author: &Account, created_at: DateTime<Utc>) -> Status {
        let mut status = status_at(author, created_at);
        self.store.put_status(&Ctx::new(), &mut status).await.unwrap();
        status
    }

    /// A stored, statusless conversation between `owner` and `others`
    pub async fn create_conversation(&self, owner: &Account, others: &[&Account]) -> Conversation {
        let other_ids = others.iter().map(|a| a.id.clone()).collect();
        let mut conversation = Conversation::new(&owner.id, "thread", other_ids);
        self.store
            .upsert_conversation(&Ctx::new(), &mut conversation, &[])
            .await
            .unwrap();
        conversation
    }

    /// The stored last status pointer, bypassing every cache
    pub async fn stored_last_status_id(&self, conversation_id: &str) -> Option<Option<String>> {
        sqlx::query_scalar("SELECT last_status_id FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(self.store.db().pool())
            .await
            .unwrap()
    }
}

pub fn status_at(author: &Account, created_at: DateTime<Utc>) -> Status {
    let id = EntityId::at(created_at).0;
    Status {
        uri: format!("https://remote.example/statuses/{id}"),
        id,
        account_id: author.id.clone(),
        in_reply_to_id: None,
        boost_of_id: None,
        thread_id: Some("thread".to_string()),
        content: "<p>hello</p>".to_string(),
        visibility: "direct".to_string(),
        created_at,
        updated_at: created_at,
        account: None,
        in_reply_to: None,
        boost_of: None,
    }
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - Duration::minutes(minutes)
}

pub fn database_config(dir: &Path) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.join("test.db"),
        max_connections: 4,
        sqlite_busy_timeout_ms: 0,
        busy_backoff_base_ms: 2,
        busy_backoff_ceiling_ms: 5_000,
    }
}

async fn open_store(dir: &Path, federation_mode: &str) -> Store {
    let db = Database::connect(&database_config(dir)).await.unwrap();
    let instance = InstanceConfig {
        host: LOCAL_HOST.to_string(),
        account_domain: None,
        federation_mode: federation_mode.to_string(),
    };
    Store::new(db, Caches::new(&CacheConfig::default()), instance)
}
