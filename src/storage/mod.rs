//! Persistence primitives for the offline queue and the entity cache.
//!
//! Stores only ever receive masked payloads. The queue store holds the full ordered list
//! of queued mutations; the entity store holds the last committed value per query key so
//! reads can be served while offline after a restart.

mod sqlite;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::cache::QueryKey;
use crate::error::SyncError;
use crate::queue::QueuedMutation;

pub use sqlite::SqliteStore;

/// Durable storage for the offline mutation queue.
pub trait QueueStore: Send + Sync {
  /// Load the persisted queue in order.
  ///
  /// Stored bytes that cannot be decoded are [`SyncError::QueueCorruption`]; a store that
  /// cannot be read at all is [`SyncError::Storage`].
  fn load(&self) -> std::result::Result<Vec<QueuedMutation>, SyncError>;

  /// Replace the persisted queue with `entries`.
  fn save(&self, entries: &[QueuedMutation]) -> Result<()>;
}

/// A persisted cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
  pub value: Value,
  pub fetched_at: DateTime<Utc>,
}

/// Optional write-through persistence for committed cache values.
pub trait EntityStore: Send + Sync {
  fn load_entry(&self, key: &QueryKey) -> Result<Option<StoredEntry>>;

  fn store_entry(&self, key: &QueryKey, value: &Value, fetched_at: DateTime<Utc>) -> Result<()>;

  /// Drop every persisted entry, e.g. at the end of a session.
  fn clear(&self) -> Result<()>;
}

/// Storage that doesn't keep anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStore;

impl QueueStore for NoopStore {
  fn load(&self) -> std::result::Result<Vec<QueuedMutation>, SyncError> {
    Ok(Vec::new())
  }

  fn save(&self, _entries: &[QueuedMutation]) -> Result<()> {
    Ok(()) // Discard
  }
}

impl EntityStore for NoopStore {
  fn load_entry(&self, _key: &QueryKey) -> Result<Option<StoredEntry>> {
    Ok(None) // Always miss
  }

  fn store_entry(&self, _key: &QueryKey, _value: &Value, _fetched_at: DateTime<Utc>) -> Result<()> {
    Ok(()) // Discard
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// In-process store. The queue is kept serialized so it behaves like a file: it survives
/// a [`SyncContext`](crate::SyncContext) being dropped and rebuilt, and it can be damaged.
#[derive(Default)]
pub struct MemoryStore {
  queue: Mutex<Vec<u8>>,
  entities: Mutex<HashMap<QueryKey, StoredEntry>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Overwrite the serialized queue bytes.
  pub fn set_raw_queue(&self, raw: impl Into<Vec<u8>>) {
    *self.queue.lock().unwrap_or_else(PoisonError::into_inner) = raw.into();
  }

  pub fn raw_queue(&self) -> Vec<u8> {
    self
      .queue
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

impl QueueStore for MemoryStore {
  fn load(&self) -> std::result::Result<Vec<QueuedMutation>, SyncError> {
    let raw = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
    if raw.is_empty() {
      return Ok(Vec::new());
    }
    serde_json::from_slice(&raw)
      .map_err(|e| SyncError::QueueCorruption(format!("failed to decode queue: {}", e)))
  }

  fn save(&self, entries: &[QueuedMutation]) -> Result<()> {
    let data = serde_json::to_vec(entries).map_err(|e| eyre!("Failed to encode queue: {}", e))?;
    *self.queue.lock().unwrap_or_else(PoisonError::into_inner) = data;
    Ok(())
  }
}

impl EntityStore for MemoryStore {
  fn load_entry(&self, key: &QueryKey) -> Result<Option<StoredEntry>> {
    let entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(entities.get(key).cloned())
  }

  fn store_entry(&self, key: &QueryKey, value: &Value, fetched_at: DateTime<Utc>) -> Result<()> {
    let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
    entities.insert(
      key.clone(),
      StoredEntry {
        value: value.clone(),
        fetched_at,
      },
    );
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self
      .entities
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
    Ok(())
  }
}

/// Parse a stored RFC 3339 timestamp.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
