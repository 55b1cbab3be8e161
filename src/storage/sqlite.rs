//! SQLite-backed record storage.
//!
//! Every collection shares one table of JSON documents; filtering happens
//! after the rows for a collection are read back.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{Filter, Record, Storage};
use crate::error::{Error, Result};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("sqlite open {}: {}", path.display(), e)))?;
        tracing::debug!("Opened storage at {}", path.display());
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("sqlite open: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                collection TEXT NOT NULL,
                ts INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection, seq);
            "#,
        )
        .map_err(|e| Error::Storage(format!("sqlite init: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn store(&self, collection: &str, record: Value) -> Result<String> {
        let id = ulid::Ulid::new().to_string();
        let data = serde_json::to_string(&record)?;

        self.conn()
            .execute(
                "INSERT INTO records (id, collection, ts, data) VALUES (?1, ?2, ?3, ?4)",
                params![id, collection, chrono::Utc::now().timestamp_millis(), data],
            )
            .map_err(|e| Error::Storage(format!("sqlite insert into {}: {}", collection, e)))?;

        Ok(id)
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, ts, data FROM records WHERE collection = ?1 ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![collection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, created_at, raw) = row?;
            let data: Value = match serde_json::from_str(&raw) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Skipping unreadable record {} in {}: {}", id, collection, e);
                    continue;
                }
            };
            if filter.matches(&data) {
                records.push(Record {
                    id,
                    collection: collection.to_string(),
                    created_at,
                    data,
                });
            }
        }

        Ok(records)
    }
}
