//! Offline-resilient data layer for the estimation client.
//!
//! Reads go through a [`QueryCache`] that serves cached values immediately and refetches
//! in the background when they go stale. Writes go through a [`Dispatcher`] that applies
//! optimistic updates, queues mutations while offline, and replays them in order once
//! connectivity settles. A [`SyncContext`] owns both for the length of a session.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod mask;
pub mod mutation;
pub mod optimistic;
pub mod queue;
pub mod storage;
pub mod transport;

pub use cache::{CacheEntry, KeySegment, QueryCache, QueryKey, QueryObserver, ReadOptions, ReadState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use context::{SyncContext, SyncContextBuilder};
pub use dispatch::{Dispatcher, FlushReport, MutateOptions, MutationHandle, MutationState};
pub use error::{ErrorKind, SyncError, TransportError};
pub use mask::FieldMask;
pub use mutation::{MutationDescriptor, MutationId, Operation};
pub use queue::{OfflineQueue, QueueStatus, QueuedMutation};
pub use storage::{EntityStore, MemoryStore, NoopStore, QueueStore, SqliteStore};
pub use transport::{HttpTransport, MemoryTransport, Transport};
