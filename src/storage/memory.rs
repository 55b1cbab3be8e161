//! In-memory storage for tests and ephemeral runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Filter, Record, Storage};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    collections: Mutex<HashMap<String, Vec<Record>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(collection)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, collection: &str, record: Value) -> Result<String> {
        let id = ulid::Ulid::new().to_string();
        let record = Record {
            id: id.clone(),
            collection: collection.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            data: record,
        };

        self.collections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(collection.to_string())
            .or_default()
            .push(record);

        Ok(id)
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
        let collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| filter.matches(&r.data))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_and_query() {
        let storage = MemoryStorage::new();
        let id = storage.store("notes", json!({"k": 1})).await.unwrap();
        storage.store("notes", json!({"k": 2})).await.unwrap();
        storage.store("other", json!({"k": 1})).await.unwrap();

        let all = storage.query("notes", &Filter::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, id);

        let one = storage
            .query("notes", &Filter::new().with("k", 2))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(storage.count("other"), 1);
        assert!(storage.query("nothing", &Filter::new()).await.unwrap().is_empty());
    }
}
