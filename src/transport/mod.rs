//! Backend transport contract and implementations.

mod http;
mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::mutation::MutationDescriptor;

pub use http::HttpTransport;
pub use memory::{AppliedMutation, MemoryTransport};

/// Sends mutations to the backend.
///
/// Implementations classify failures with [`ErrorKind`](crate::error::ErrorKind); only
/// network and timeout failures are retried by the queue.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  /// Apply `mutation` and return the backend's representation of the result
  /// (`Value::Null` when it returns nothing).
  async fn send(&self, mutation: &MutationDescriptor) -> Result<Value, TransportError>;

  /// Cheap reachability check used by the connectivity probe.
  async fn ping(&self) -> Result<(), TransportError> {
    Ok(())
  }
}
