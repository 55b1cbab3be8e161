//! Storage collaborator contract.
//!
//! The coordination layer only needs to store a JSON record in a named
//! collection and query records back by top-level field equality.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Collection names used by the built-in agents.
pub mod collections {
    pub const USERS: &str = "users";
    pub const MESSAGES: &str = "messages";
    pub const ANALYSES: &str = "analyses";
    pub const ERRORS: &str = "errors";
}

/// A stored record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    pub collection: String,
    /// Insertion timestamp (unix ms)
    pub created_at: i64,
    pub data: Value,
}

/// Equality filter over top-level record fields. Empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    fields: Map<String, Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| data.get(field) == Some(expected))
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store a record and return its ID.
    async fn store(&self, collection: &str, record: Value) -> Result<String>;

    /// Records in a collection matching the filter, oldest first.
    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>>;
}

/// Open the configured backend.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStorage::open(config.resolved_path()?)?)),
    }
}

/// Latest recorded status for a user, if any.
pub async fn user_status(storage: &dyn Storage, user_id: &str) -> Result<Option<String>> {
    let records = storage
        .query(collections::USERS, &Filter::new().with("userId", user_id))
        .await?;

    Ok(records
        .last()
        .and_then(|r| r.data.get("status"))
        .and_then(Value::as_str)
        .map(str::to_string))
}

/// Latest recorded status of every known user.
pub async fn user_statuses(storage: &dyn Storage) -> Result<BTreeMap<String, String>> {
    let records = storage.query(collections::USERS, &Filter::new()).await?;

    let mut users = BTreeMap::new();
    for record in records {
        let user_id = record.data.get("userId").and_then(Value::as_str);
        let status = record.data.get("status").and_then(Value::as_str);
        if let (Some(user_id), Some(status)) = (user_id, status) {
            users.insert(user_id.to_string(), status.to_string());
        }
    }
    Ok(users)
}

/// Append a status change for a user.
pub async fn set_user_status(storage: &dyn Storage, user_id: &str, status: &str) -> Result<String> {
    storage
        .store(
            collections::USERS,
            serde_json::json!({
                "userId": user_id,
                "status": status,
                "updatedAt": chrono::Utc::now().timestamp_millis(),
            }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches() {
        let data = json!({"userId": "u1", "status": "active", "n": 3});

        assert!(Filter::new().matches(&data));
        assert!(Filter::new().with("userId", "u1").matches(&data));
        assert!(Filter::new().with("userId", "u1").with("n", 3).matches(&data));
        assert!(!Filter::new().with("userId", "u2").matches(&data));
        assert!(!Filter::new().with("missing", "x").matches(&data));
    }

    #[tokio::test]
    async fn test_latest_user_status_wins() {
        let storage = MemoryStorage::new();
        assert_eq!(user_status(&storage, "u1").await.unwrap(), None);

        set_user_status(&storage, "u1", "active").await.unwrap();
        set_user_status(&storage, "u2", "blocked").await.unwrap();
        set_user_status(&storage, "u1", "blocked").await.unwrap();

        assert_eq!(
            user_status(&storage, "u1").await.unwrap().as_deref(),
            Some("blocked")
        );

        let all = user_statuses(&storage).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("u1").map(String::as_str), Some("blocked"));
        assert_eq!(all.get("u2").map(String::as_str), Some("blocked"));
    }
}
