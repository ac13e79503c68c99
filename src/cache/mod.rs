//! Query cache for remote reads.
//!
//! This module provides the read side of the sync layer:
//! - Query keys with prefix matching for invalidation
//! - Cache entries with staleness, in-flight and optimistic flags
//! - A coordinator that dedups fetches, applies last-fetch-wins and notifies observers
//! - Offline hydration from a persisted entity store

mod coordinator;
mod entry;
mod key;

pub use coordinator::{QueryCache, QueryObserver};
pub use entry::{CacheEntry, ReadOptions, ReadState};
pub use key::{KeySegment, QueryKey};
