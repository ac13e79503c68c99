//! Result handle returned by [`Dispatcher::mutate`](super::Dispatcher::mutate).

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::SyncError;
use crate::mutation::MutationId;

/// The state of a submitted mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState {
  /// Queued or in flight
  Pending,
  /// Confirmed by the backend, with its response
  Committed(Value),
  /// Rejected, exhausted its retries, or was discarded
  Failed(SyncError),
}

impl MutationState {
  pub fn is_pending(&self) -> bool {
    matches!(self, MutationState::Pending)
  }

  pub fn is_committed(&self) -> bool {
    matches!(self, MutationState::Committed(_))
  }

  pub fn is_failed(&self) -> bool {
    matches!(self, MutationState::Failed(_))
  }

  pub fn error(&self) -> Option<&SyncError> {
    match self {
      MutationState::Failed(e) => Some(e),
      _ => None,
    }
  }
}

/// Resolves exactly once, when the mutation reaches a terminal state.
///
/// Await it with [`wait`](Self::wait), or call [`poll`](Self::poll) from an event loop
/// tick and read [`state`](Self::state). Dropping the handle does not cancel the
/// mutation.
#[derive(Debug)]
pub struct MutationHandle {
  id: MutationId,
  state: MutationState,
  receiver: Option<oneshot::Receiver<Result<Value, SyncError>>>,
}

impl MutationHandle {
  pub(crate) fn new(id: MutationId, receiver: oneshot::Receiver<Result<Value, SyncError>>) -> Self {
    Self {
      id,
      state: MutationState::Pending,
      receiver: Some(receiver),
    }
  }

  pub fn id(&self) -> MutationId {
    self.id
  }

  pub fn state(&self) -> &MutationState {
    &self.state
  }

  /// Check for a result without blocking.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(result) => {
        self.resolve(result);
        true
      }
      Err(oneshot::error::TryRecvError::Empty) => false,
      Err(oneshot::error::TryRecvError::Closed) => {
        self.resolve(Err(cancelled()));
        true
      }
    }
  }

  /// Wait for the terminal result.
  pub async fn wait(mut self) -> Result<Value, SyncError> {
    if let Some(receiver) = self.receiver.take() {
      let result = receiver.await.unwrap_or_else(|_| Err(cancelled()));
      self.resolve(result);
    }

    match self.state {
      MutationState::Committed(value) => Ok(value),
      MutationState::Failed(e) => Err(e),
      MutationState::Pending => Err(cancelled()),
    }
  }

  fn resolve(&mut self, result: Result<Value, SyncError>) {
    self.receiver = None;
    self.state = match result {
      Ok(value) => MutationState::Committed(value),
      Err(e) => MutationState::Failed(e),
    };
  }
}

fn cancelled() -> SyncError {
  SyncError::Cancelled("the sync context shut down before the mutation resolved".to_string())
}
