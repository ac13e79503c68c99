//! Cache entry snapshots and the read-side result types.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::SyncError;

/// Last-known result for a query key plus freshness metadata.
///
/// Callers only ever see clones; the live entry is owned by the
/// [`QueryCache`](super::QueryCache).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
  /// Current visible value (committed or optimistic)
  pub value: Option<Value>,
  /// Start time of the fetch that produced the committed value
  pub fetched_at: Option<DateTime<Utc>>,
  /// Eligible for refresh; never presented as fresh
  pub is_stale: bool,
  /// A fetch for this key is running
  pub in_flight: bool,
  /// The visible value includes at least one unconfirmed optimistic patch
  pub optimistic: bool,
  /// Error from the most recent fetch, cleared by the next success
  pub error: Option<SyncError>,
}

impl CacheEntry {
  /// Whether `now - fetched_at` exceeds `stale_time`. Entries never fetched count as
  /// expired.
  pub fn is_expired(&self, now: DateTime<Utc>, stale_time: Duration) -> bool {
    match self.fetched_at {
      Some(at) => now - at > stale_time,
      None => true,
    }
  }
}

/// Options for a single read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
  /// When false the read only reports what is cached and never fetches
  pub enabled: bool,
  /// Overrides the configured stale time for this read
  pub stale_time: Option<Duration>,
  /// Fetch even when the entry is fresh or a fetch is already running
  pub force: bool,
}

impl Default for ReadOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      stale_time: None,
      force: false,
    }
  }
}

impl ReadOptions {
  pub fn disabled() -> Self {
    Self {
      enabled: false,
      ..Self::default()
    }
  }

  pub fn forced() -> Self {
    Self {
      force: true,
      ..Self::default()
    }
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }
}

/// What a read call returns: the cached value and how much to trust it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadState<T> {
  pub value: Option<T>,
  pub is_loading: bool,
  pub is_stale: bool,
  pub is_optimistic: bool,
  pub fetched_at: Option<DateTime<Utc>>,
  pub error: Option<SyncError>,
}

impl<T> ReadState<T> {
  pub fn data(&self) -> Option<&T> {
    self.value.as_ref()
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }
}

impl<T: DeserializeOwned> ReadState<T> {
  /// Decode an entry snapshot. A value that does not decode into `T` is reported as a
  /// [`SyncError::Decode`] with no value, so the caller keeps whatever it rendered last.
  pub(crate) fn from_entry(entry: &CacheEntry) -> Self {
    let mut error = entry.error.clone();
    let value = match &entry.value {
      Some(v) => match serde_json::from_value(v.clone()) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
          error = Some(SyncError::Decode(e.to_string()));
          None
        }
      },
      None => None,
    };

    Self {
      value,
      is_loading: entry.in_flight,
      is_stale: entry.is_stale,
      is_optimistic: entry.optimistic,
      fetched_at: entry.fetched_at,
      error,
    }
  }
}
