//! SQLite-backed queue and entity storage.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{parse_datetime, EntityStore, QueueStore, StoredEntry};
use crate::cache::QueryKey;
use crate::error::SyncError;
use crate::queue::QueuedMutation;

/// Schema for sync tables.
const SYNC_SCHEMA: &str = r#"
-- Last committed value per query key (masked JSON)
CREATE TABLE IF NOT EXISTS query_cache (
    query_hash TEXT PRIMARY KEY,
    query_key TEXT NOT NULL,
    collection TEXT,
    data BLOB NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_cache_collection ON query_cache(collection);

-- Offline mutation queue, in replay order
CREATE TABLE IF NOT EXISTS mutation_queue (
    mutation_id TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    status TEXT NOT NULL,
    data BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_position ON mutation_queue(position);
"#;

/// SQLite storage for both the mutation queue and persisted cache entries.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open sync database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Store that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("estisync").join("sync.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SYNC_SCHEMA)
      .map_err(|e| eyre!("Failed to run sync migrations: {}", e))?;

    Ok(())
  }
}

impl QueueStore for SqliteStore {
  fn load(&self) -> std::result::Result<Vec<QueuedMutation>, SyncError> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("lock poisoned: {}", e)))?;

    let mut stmt = conn
      .prepare("SELECT position, data FROM mutation_queue ORDER BY position")
      .map_err(|e| SyncError::Storage(format!("failed to prepare queue query: {}", e)))?;

    let rows: Vec<(i64, Vec<u8>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| SyncError::Storage(format!("failed to query queue: {}", e)))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| SyncError::Storage(format!("failed to read queue row: {}", e)))?;

    rows
      .into_iter()
      .map(|(position, data)| {
        serde_json::from_slice(&data).map_err(|e| {
          SyncError::QueueCorruption(format!(
            "failed to decode queued mutation at position {}: {}",
            position, e
          ))
        })
      })
      .collect()
  }

  fn save(&self, entries: &[QueuedMutation]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM mutation_queue", [])
      .map_err(|e| eyre!("Failed to clear queue: {}", e))?;

    for (position, entry) in entries.iter().enumerate() {
      let data =
        serde_json::to_vec(entry).map_err(|e| eyre!("Failed to serialize mutation: {}", e))?;
      let status =
        serde_json::to_string(&entry.status).map_err(|e| eyre!("Failed to encode status: {}", e))?;

      tx.execute(
        "INSERT INTO mutation_queue (mutation_id, position, status, data, created_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          entry.mutation.id.to_string(),
          position as i64,
          status.trim_matches('"'),
          data,
          format_datetime(entry.mutation.created_at),
        ],
      )
      .map_err(|e| eyre!("Failed to store queued mutation: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

impl EntityStore for SqliteStore {
  fn load_entry(&self, key: &QueryKey) -> Result<Option<StoredEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, fetched_at FROM query_cache WHERE query_hash = ?",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((data, fetched_at)) => {
        let value: Value = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
        Ok(Some(StoredEntry {
          value,
          fetched_at: parse_datetime(&fetched_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn store_entry(&self, key: &QueryKey, value: &Value, fetched_at: DateTime<Utc>) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize value: {}", e))?;
    let query_key =
      serde_json::to_string(key).map_err(|e| eyre!("Failed to serialize query key: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO query_cache (query_hash, query_key, collection, data, fetched_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          key.cache_hash(),
          query_key,
          key.collection(),
          data,
          format_datetime(fetched_at),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM query_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }
}

fn format_datetime(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mutation::{MutationDescriptor, Operation};
  use crate::queue::QueueStatus;
  use serde_json::json;

  fn queued(name: &str) -> QueuedMutation {
    QueuedMutation::pending(MutationDescriptor::new(
      "projects",
      Operation::Insert,
      json!({"name": name}),
      Utc::now(),
      "id",
    ))
  }

  #[test]
  fn test_queue_persists_order() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut entries = vec![queued("a"), queued("b"), queued("c")];
    entries[1].status = QueueStatus::Failed;
    store.save(&entries).unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded, entries);

    store.save(&entries[2..]).unwrap();
    assert_eq!(store.load().unwrap().len(), 1);
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sync.db");

    let entries = vec![queued("a")];
    SqliteStore::open(Some(&path)).unwrap().save(&entries).unwrap();

    let reopened = SqliteStore::open(Some(&path)).unwrap();
    assert_eq!(reopened.load().unwrap(), entries);
  }

  #[test]
  fn test_undecodable_row_is_corruption() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.save(&[queued("a")]).unwrap();
    {
      let conn = store.conn.lock().unwrap();
      conn
        .execute("UPDATE mutation_queue SET data = x'00ff'", [])
        .unwrap();
    }
    assert!(matches!(store.load(), Err(SyncError::QueueCorruption(_))));
  }

  #[test]
  fn test_unreachable_table_is_a_storage_error() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.save(&[queued("a")]).unwrap();
    {
      let conn = store.conn.lock().unwrap();
      conn.execute_batch("DROP TABLE mutation_queue").unwrap();
    }
    assert!(matches!(store.load(), Err(SyncError::Storage(_))));
  }

  #[test]
  fn test_entity_round_trip() {
    let store = SqliteStore::open_in_memory().unwrap();
    let key = QueryKey::new("projects").with("active").with(1);
    let at = Utc::now();

    assert!(store.load_entry(&key).unwrap().is_none());
    store.store_entry(&key, &json!([{"id": 1}]), at).unwrap();

    let entry = store.load_entry(&key).unwrap().unwrap();
    assert_eq!(entry.value, json!([{"id": 1}]));
    assert_eq!(
      entry.fetched_at.timestamp_micros(),
      at.timestamp_micros()
    );

    store.clear().unwrap();
    assert!(store.load_entry(&key).unwrap().is_none());
  }
}
