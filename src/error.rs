//! Error taxonomy shared by reads, mutations and the offline queue.

use serde::{Deserialize, Serialize};

/// Failure classes reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Backend unreachable or answered with a transient failure
  Network,
  /// The request did not complete in time
  Timeout,
  /// Payload rejected by the backend
  Validation,
  /// Unique key or constraint violation
  Conflict,
  /// Target row or function does not exist
  NotFound,
}

impl ErrorKind {
  /// Network and timeout failures are worth another attempt; everything else is final.
  pub fn is_retryable(self) -> bool {
    matches!(self, ErrorKind::Network | ErrorKind::Timeout)
  }
}

/// Error returned by a transport send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
  pub kind: ErrorKind,
  pub message: String,
}

impl TransportError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Network, message)
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Timeout, message)
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Validation, message)
  }

  pub fn conflict(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Conflict, message)
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::NotFound, message)
  }

  pub fn is_retryable(&self) -> bool {
    self.kind.is_retryable()
  }
}

/// Errors surfaced to callers of the sync layer.
///
/// Reads never return these directly; they show up in
/// [`ReadState::error`](crate::cache::ReadState). Mutations resolve their handle with one
/// exactly once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SyncError {
  #[error("network error: {0}")]
  Network(String),
  #[error("request timed out: {0}")]
  Timeout(String),
  #[error("validation failed: {0}")]
  Validation(String),
  #[error("conflict: {0}")]
  Conflict(String),
  #[error("not found: {0}")]
  NotFound(String),
  #[error("offline: {0}")]
  Offline(String),
  #[error("mutation queue corrupted: {0}")]
  QueueCorruption(String),
  #[error("storage error: {0}")]
  Storage(String),
  #[error("failed to decode cached value: {0}")]
  Decode(String),
  #[error("cancelled: {0}")]
  Cancelled(String),
}

impl SyncError {
  /// Whether the offline queue should try again later.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
  }

  /// Not-found responses mean the cached view of the entity is outdated.
  pub fn is_stale_signal(&self) -> bool {
    matches!(self, SyncError::NotFound(_))
  }
}

impl From<TransportError> for SyncError {
  fn from(err: TransportError) -> Self {
    match err.kind {
      ErrorKind::Network => SyncError::Network(err.message),
      ErrorKind::Timeout => SyncError::Timeout(err.message),
      ErrorKind::Validation => SyncError::Validation(err.message),
      ErrorKind::Conflict => SyncError::Conflict(err.message),
      ErrorKind::NotFound => SyncError::NotFound(err.message),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retryable_kinds() {
    assert!(ErrorKind::Network.is_retryable());
    assert!(ErrorKind::Timeout.is_retryable());
    assert!(!ErrorKind::Validation.is_retryable());
    assert!(!ErrorKind::Conflict.is_retryable());
    assert!(!ErrorKind::NotFound.is_retryable());
  }

  #[test]
  fn test_transport_error_conversion() {
    let err: SyncError = TransportError::conflict("duplicate key").into();
    assert_eq!(err, SyncError::Conflict("duplicate key".to_string()));
    assert!(!err.is_retryable());

    let err: SyncError = TransportError::timeout("15s elapsed").into();
    assert!(err.is_retryable());
  }

  #[test]
  fn test_serialized_shape() {
    let json = serde_json::to_value(SyncError::NotFound("projects/7".to_string())).unwrap();
    assert_eq!(json, serde_json::json!({"kind": "not_found", "message": "projects/7"}));
  }
}
