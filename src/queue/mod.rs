//! Durable, ordered queue of mutations waiting for the backend.
//!
//! The queue owns scheduling state only: which mutations are pending, which are in flight
//! and which failed for good. Sending and reconciliation live in
//! [`Dispatcher`](crate::dispatch::Dispatcher), which drains the queue during a flush.
//!
//! Ordering rule: walking the queue in submission order, a pending mutation may start only
//! when its [`EntityGroup`] conflicts with nothing in flight, nothing holding a direct-send
//! lock, and no earlier pending mutation. Failed entries never block later ones. A pending
//! mutation waiting out a retry backoff is not eligible, but still holds back later
//! mutations of its own entity.

mod backoff;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::mask::FieldMask;
use crate::mutation::{EntityGroup, MutationDescriptor, MutationId};
use crate::storage::QueueStore;

pub use backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
  Pending,
  InFlight,
  Failed,
}

/// A mutation waiting in (or parked in) the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
  pub mutation: MutationDescriptor,
  pub attempts: u32,
  pub last_error: Option<SyncError>,
  pub status: QueueStatus,
  /// The persisted copy had sensitive fields masked and cannot be replayed
  #[serde(default)]
  pub redacted: bool,
}

impl QueuedMutation {
  pub fn pending(mutation: MutationDescriptor) -> Self {
    Self {
      mutation,
      attempts: 0,
      last_error: None,
      status: QueueStatus::Pending,
      redacted: false,
    }
  }
}

#[derive(Default)]
struct QueueState {
  entries: Vec<QueuedMutation>,
  /// Entity locks held by sends that bypass the queue
  direct: HashMap<MutationId, EntityGroup>,
  /// Earliest next attempt of pending mutations that are backing off. Not persisted: a
  /// restart retries right away.
  not_before: HashMap<MutationId, Instant>,
}

impl QueueState {
  fn position(&self, id: MutationId) -> Option<usize> {
    self.entries.iter().position(|e| e.mutation.id == id)
  }

  fn get_mut(&mut self, id: MutationId) -> Option<&mut QueuedMutation> {
    self.entries.iter_mut().find(|e| e.mutation.id == id)
  }

  fn in_flight_groups(&self) -> Vec<EntityGroup> {
    self
      .entries
      .iter()
      .filter(|e| e.status == QueueStatus::InFlight)
      .map(|e| e.mutation.entity_group())
      .chain(self.direct.values().cloned())
      .collect()
  }

  fn backing_off(&self, id: MutationId, now: Instant) -> bool {
    self.not_before.get(&id).is_some_and(|at| *at > now)
  }

  fn eligible(&self, limit: usize, now: Instant) -> Vec<usize> {
    let mut blockers = self.in_flight_groups();
    let mut picked = Vec::new();

    for (i, entry) in self.entries.iter().enumerate() {
      if picked.len() >= limit {
        break;
      }
      if entry.status != QueueStatus::Pending {
        continue;
      }
      let group = entry.mutation.entity_group();
      if !self.backing_off(entry.mutation.id, now)
        && !blockers.iter().any(|b| b.conflicts_with(&group))
      {
        picked.push(i);
      }
      blockers.push(group);
    }
    picked
  }
}

/// The offline mutation queue. Every state change is written through to the
/// [`QueueStore`] while the queue lock is held, so persisted snapshots are never
/// reordered.
pub struct OfflineQueue {
  state: Mutex<QueueState>,
  store: Arc<dyn QueueStore>,
  mask: Arc<FieldMask>,
  /// Signalled whenever an entity lock is released
  released: Notify,
  recovered_from: Option<SyncError>,
}

impl OfflineQueue {
  /// Load the persisted queue.
  ///
  /// Mutations that were in flight when the process stopped go back to pending (they may
  /// have reached the backend; replay relies on conflict targets to stay idempotent).
  /// Undecodable state resets the queue to empty. A store that cannot be read is left
  /// untouched and the error is returned.
  pub fn open(store: Arc<dyn QueueStore>, mask: Arc<FieldMask>) -> Result<Self, SyncError> {
    let (mut entries, recovered_from) = match store.load() {
      Ok(entries) => (entries, None),
      Err(e @ SyncError::QueueCorruption(_)) => {
        error!(error = %e, "Mutation queue unreadable, resetting to empty; queued writes were lost");
        if let Err(e) = store.save(&[]) {
          warn!(error = %e, "Failed to reset mutation queue storage");
        }
        (Vec::new(), Some(e))
      }
      Err(e) => return Err(e),
    };

    for entry in &mut entries {
      if entry.status == QueueStatus::InFlight {
        entry.status = QueueStatus::Pending;
      }
      if entry.redacted && entry.status == QueueStatus::Pending {
        entry.status = QueueStatus::Failed;
        entry.last_error = Some(SyncError::Validation(
          "sensitive fields were not persisted across restart; resubmit the change".to_string(),
        ));
      }
    }
    entries.sort_by_key(|e| e.mutation.created_at);

    if !entries.is_empty() {
      info!(count = entries.len(), "Restored mutation queue");
    }

    let queue = Self {
      state: Mutex::new(QueueState {
        entries,
        ..QueueState::default()
      }),
      store,
      mask,
      released: Notify::new(),
      recovered_from,
    };
    {
      let state = queue.lock();
      queue.persist(&state);
    }
    Ok(queue)
  }

  /// The corruption that was recovered from when the queue was opened, if any.
  pub fn recovered_from(&self) -> Option<&SyncError> {
    self.recovered_from.as_ref()
  }

  /// Append a mutation as pending, keeping the queue in `created_at` order.
  pub fn enqueue(&self, mutation: MutationDescriptor) {
    let mut state = self.lock();
    let at = state
      .entries
      .iter()
      .rposition(|e| e.mutation.created_at <= mutation.created_at)
      .map_or(0, |i| i + 1);
    debug!(
      id = %mutation.id,
      group = %mutation.entity_group(),
      variables = %self.mask.display(&mutation.collection, &mutation.variables),
      "Enqueued mutation"
    );
    state.entries.insert(at, QueuedMutation::pending(mutation));
    self.persist(&state);
  }

  /// Mark up to `limit` eligible mutations in flight and return them.
  pub fn take_eligible(&self, limit: usize) -> Vec<QueuedMutation> {
    if limit == 0 {
      return Vec::new();
    }
    let mut state = self.lock();
    let picked = state.eligible(limit, Instant::now());
    if picked.is_empty() {
      return Vec::new();
    }

    let taken: Vec<QueuedMutation> = picked
      .into_iter()
      .map(|i| {
        let entry = &mut state.entries[i];
        entry.status = QueueStatus::InFlight;
        entry.clone()
      })
      .collect();
    for entry in &taken {
      state.not_before.remove(&entry.mutation.id);
    }
    self.persist(&state);
    taken
  }

  pub fn has_eligible(&self) -> bool {
    !self.lock().eligible(1, Instant::now()).is_empty()
  }

  /// When the earliest backing-off mutation becomes eligible again.
  pub fn next_retry_at(&self) -> Option<Instant> {
    let state = self.lock();
    state
      .entries
      .iter()
      .filter(|e| e.status == QueueStatus::Pending)
      .filter_map(|e| state.not_before.get(&e.mutation.id).copied())
      .min()
  }

  /// Take the entity lock for a send that bypasses the queue. Fails while any queued or
  /// direct mutation on a conflicting entity is ahead of it.
  pub fn try_lock_direct(&self, mutation: &MutationDescriptor) -> bool {
    let mut state = self.lock();
    let group = mutation.entity_group();
    let blocked = state
      .entries
      .iter()
      .filter(|e| e.status != QueueStatus::Failed)
      .map(|e| e.mutation.entity_group())
      .chain(state.direct.values().cloned())
      .any(|g| g.conflicts_with(&group));
    if blocked {
      return false;
    }
    state.direct.insert(mutation.id, group);
    true
  }

  /// Wait until the entity lock for `mutation` can be taken.
  pub async fn lock_direct(&self, mutation: &MutationDescriptor) {
    loop {
      let notified = self.released.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if self.try_lock_direct(mutation) {
        return;
      }
      notified.await;
    }
  }

  pub fn unlock_direct(&self, id: MutationId) {
    self.lock().direct.remove(&id);
    self.released.notify_waiters();
  }

  /// Return an in-flight mutation to pending after a retryable failure. It is not eligible
  /// again before `until`.
  pub fn back_off(&self, id: MutationId, attempts: u32, err: SyncError, until: Instant) {
    {
      let mut state = self.lock();
      let Some(entry) = state.get_mut(id) else {
        return;
      };
      entry.status = QueueStatus::Pending;
      entry.attempts = attempts;
      entry.last_error = Some(err);
      state.not_before.insert(id, until);
      self.persist(&state);
    }
    self.released.notify_waiters();
  }

  /// Put every in-flight mutation back to pending, e.g. when its send was abandoned.
  pub fn release_in_flight(&self) -> usize {
    let released = {
      let mut state = self.lock();
      let mut released = 0;
      for entry in state.entries.iter_mut() {
        if entry.status == QueueStatus::InFlight {
          entry.status = QueueStatus::Pending;
          released += 1;
        }
      }
      if released > 0 {
        self.persist(&state);
      }
      released
    };
    if released > 0 {
      self.released.notify_waiters();
    }
    released
  }

  /// Confirmed by the backend: drop it from the queue.
  pub fn succeed(&self, id: MutationId) -> Option<QueuedMutation> {
    let removed = {
      let mut state = self.lock();
      let removed = state.position(id).map(|i| state.entries.remove(i));
      state.not_before.remove(&id);
      if removed.is_some() {
        self.persist(&state);
      }
      removed
    };
    self.released.notify_waiters();
    removed
  }

  /// Park the mutation as failed. It stays visible until discarded or retried.
  pub fn fail(&self, id: MutationId, attempts: u32, err: SyncError) {
    self.settle(id, QueueStatus::Failed, attempts, Some(err));
  }

  /// Return an in-flight mutation to pending, e.g. because connectivity dropped.
  pub fn release(&self, id: MutationId, attempts: u32, err: Option<SyncError>) {
    self.settle(id, QueueStatus::Pending, attempts, err);
  }

  fn settle(&self, id: MutationId, status: QueueStatus, attempts: u32, err: Option<SyncError>) {
    {
      let mut state = self.lock();
      state.not_before.remove(&id);
      if let Some(entry) = state.get_mut(id) {
        entry.status = status;
        entry.attempts = attempts;
        if err.is_some() {
          entry.last_error = err;
        }
        self.persist(&state);
      }
    }
    self.released.notify_waiters();
  }

  /// Pending and in-flight mutations.
  pub fn pending_count(&self) -> usize {
    self
      .lock()
      .entries
      .iter()
      .filter(|e| e.status != QueueStatus::Failed)
      .count()
  }

  pub fn failed_mutations(&self) -> Vec<QueuedMutation> {
    self
      .lock()
      .entries
      .iter()
      .filter(|e| e.status == QueueStatus::Failed)
      .cloned()
      .collect()
  }

  pub fn get(&self, id: MutationId) -> Option<QueuedMutation> {
    self
      .lock()
      .entries
      .iter()
      .find(|e| e.mutation.id == id)
      .cloned()
  }

  pub fn snapshot(&self) -> Vec<QueuedMutation> {
    self.lock().entries.clone()
  }

  /// Remove a mutation that is not in flight.
  pub fn discard(&self, id: MutationId) -> Result<QueuedMutation, SyncError> {
    let removed = {
      let mut state = self.lock();
      let Some(i) = state.position(id) else {
        return Err(SyncError::NotFound(format!("mutation {} is not queued", id)));
      };
      if state.entries[i].status == QueueStatus::InFlight {
        return Err(SyncError::Conflict(format!("mutation {} is in flight", id)));
      }
      let removed = state.entries.remove(i);
      state.not_before.remove(&id);
      self.persist(&state);
      removed
    };
    self.released.notify_waiters();
    info!(%id, "Discarded queued mutation");
    Ok(removed)
  }

  /// Give a failed mutation a fresh set of attempts.
  pub fn retry(&self, id: MutationId) -> Result<(), SyncError> {
    let mut state = self.lock();
    let Some(entry) = state.get_mut(id) else {
      return Err(SyncError::NotFound(format!("mutation {} is not queued", id)));
    };
    if entry.status != QueueStatus::Failed {
      return Err(SyncError::Conflict(format!("mutation {} has not failed", id)));
    }
    if entry.redacted {
      return Err(SyncError::Validation(format!(
        "mutation {} lost sensitive fields and cannot be replayed",
        id
      )));
    }
    entry.status = QueueStatus::Pending;
    entry.attempts = 0;
    state.not_before.remove(&id);
    self.persist(&state);
    Ok(())
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Write the queue through to storage, masking sensitive fields. A failed write leaves
  /// the in-memory queue authoritative.
  fn persist(&self, state: &QueueState) {
    let masked: Vec<QueuedMutation> = state
      .entries
      .iter()
      .map(|entry| {
        let m = &entry.mutation;
        if !self.mask.redacts(&m.collection, &m.variables) {
          return entry.clone();
        }
        let mut copy = entry.clone();
        copy.mutation.variables = self.mask.mask(&m.collection, &m.variables);
        copy.redacted = true;
        copy
      })
      .collect();

    if let Err(e) = self.store.save(&masked) {
      warn!(error = %e, "Failed to persist mutation queue");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mutation::Operation;
  use crate::storage::MemoryStore;
  use chrono::{Duration, Utc};
  use serde_json::{json, Value};

  fn update(id: i64, at_secs: i64) -> MutationDescriptor {
    let at = Utc::now() + Duration::seconds(at_secs);
    MutationDescriptor::new("projects", Operation::Update, json!({"id": id}), at, "id")
  }

  fn open(store: &Arc<MemoryStore>) -> OfflineQueue {
    OfflineQueue::open(store.clone(), Arc::new(FieldMask::new())).unwrap()
  }

  #[test]
  fn test_enqueue_persists_pending() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    let m = update(1, 0);
    queue.enqueue(m.clone());

    assert_eq!(queue.pending_count(), 1);
    let persisted = store.load().unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].mutation.id, m.id);
    assert_eq!(persisted[0].status, QueueStatus::Pending);
  }

  #[test]
  fn test_one_in_flight_per_entity() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    let first = update(1, 1);
    let second = update(1, 2);
    let other = update(2, 3);
    queue.enqueue(first.clone());
    queue.enqueue(second.clone());
    queue.enqueue(other.clone());

    let taken: Vec<_> = queue.take_eligible(10).into_iter().map(|e| e.mutation.id).collect();
    assert_eq!(taken, vec![first.id, other.id]);

    // Second waits until the first leaves flight.
    assert!(queue.take_eligible(10).is_empty());
    queue.succeed(first.id);
    let taken: Vec<_> = queue.take_eligible(10).into_iter().map(|e| e.mutation.id).collect();
    assert_eq!(taken, vec![second.id]);
  }

  #[test]
  fn test_upserts_on_one_natural_key_never_overlap() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    let upsert = |id: i64, at_secs: i64| {
      MutationDescriptor::new(
        "financial_settings",
        Operation::Upsert,
        json!({"id": id, "project_id": 3}),
        Utc::now() + Duration::seconds(at_secs),
        "id",
      )
      .with_conflict_target("project_id")
    };
    let first = upsert(10, 1);
    let second = upsert(11, 2);
    queue.enqueue(first.clone());
    queue.enqueue(second.clone());

    let taken: Vec<_> = queue.take_eligible(10).into_iter().map(|e| e.mutation.id).collect();
    assert_eq!(taken, vec![first.id]);
    queue.succeed(first.id);
    assert_eq!(queue.take_eligible(10)[0].mutation.id, second.id);
  }

  #[test]
  fn test_enqueue_orders_by_created_at() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    let late = update(1, 10);
    let early = update(1, 5);
    queue.enqueue(late.clone());
    queue.enqueue(early.clone());

    let order: Vec<_> = queue.snapshot().into_iter().map(|e| e.mutation.id).collect();
    assert_eq!(order, vec![early.id, late.id]);
  }

  #[test]
  fn test_collection_wide_mutation_blocks_rows() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    let bulk = MutationDescriptor::new(
      "projects",
      Operation::BulkUpdate,
      json!([{"id": 1}, {"id": 2}]),
      Utc::now(),
      "id",
    );
    queue.enqueue(bulk.clone());
    queue.enqueue(update(2, 5));

    let taken = queue.take_eligible(10);
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].mutation.id, bulk.id);
  }

  #[test]
  fn test_limit_is_respected() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    for id in 0..5 {
      queue.enqueue(update(id, id));
    }
    assert_eq!(queue.take_eligible(2).len(), 2);
    assert_eq!(queue.take_eligible(0).len(), 0);
    assert_eq!(queue.take_eligible(10).len(), 3);
  }

  #[test]
  fn test_failed_entries_do_not_block() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    let first = update(1, 1);
    let second = update(1, 2);
    queue.enqueue(first.clone());
    queue.enqueue(second.clone());

    queue.take_eligible(10);
    queue.fail(first.id, 1, SyncError::Validation("bad margin".to_string()));

    let taken = queue.take_eligible(10);
    assert_eq!(taken[0].mutation.id, second.id);
    assert_eq!(queue.failed_mutations().len(), 1);
    assert_eq!(queue.pending_count(), 1);
  }

  #[test]
  fn test_restart_resets_in_flight() {
    let store = Arc::new(MemoryStore::new());
    let m = update(1, 0);
    {
      let queue = open(&store);
      queue.enqueue(m.clone());
      queue.take_eligible(1);
      assert_eq!(store.load().unwrap()[0].status, QueueStatus::InFlight);
    }

    let queue = open(&store);
    assert_eq!(queue.get(m.id).unwrap().status, QueueStatus::Pending);
    assert_eq!(queue.take_eligible(1)[0].mutation.id, m.id);
  }

  #[test]
  fn test_corruption_resets_to_empty() {
    let store = Arc::new(MemoryStore::new());
    store.set_raw_queue("[{\"mutation\": 12}]");

    let queue = open(&store);
    assert_eq!(queue.pending_count(), 0);
    assert!(matches!(queue.recovered_from(), Some(SyncError::QueueCorruption(_))));
    assert!(store.load().unwrap().is_empty());

    queue.enqueue(update(1, 0));
    assert_eq!(store.load().unwrap().len(), 1);
  }

  struct UnreadableStore {
    saves: std::sync::atomic::AtomicUsize,
  }

  impl QueueStore for UnreadableStore {
    fn load(&self) -> Result<Vec<QueuedMutation>, SyncError> {
      Err(SyncError::Storage("database is locked".to_string()))
    }

    fn save(&self, _entries: &[QueuedMutation]) -> color_eyre::Result<()> {
      self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
      Ok(())
    }
  }

  #[test]
  fn test_storage_error_is_not_corruption() {
    let store = Arc::new(UnreadableStore {
      saves: Default::default(),
    });
    let opened = OfflineQueue::open(store.clone(), Arc::new(FieldMask::new()));

    assert!(matches!(opened, Err(SyncError::Storage(_))));
    assert_eq!(store.saves.load(std::sync::atomic::Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_backing_off_entry_stays_pending_and_holds_its_entity() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    let failing = update(1, 1);
    let behind = update(1, 2);
    let other = update(2, 3);
    queue.enqueue(failing.clone());
    queue.enqueue(behind.clone());
    queue.enqueue(other.clone());
    assert_eq!(queue.take_eligible(10).len(), 2);

    let until = Instant::now() + std::time::Duration::from_secs(10);
    queue.back_off(failing.id, 1, SyncError::Network("reset".to_string()), until);
    queue.succeed(other.id);

    let entry = queue.get(failing.id).unwrap();
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.attempts, 1);
    assert_eq!(queue.next_retry_at(), Some(until));
    assert!(queue.take_eligible(10).is_empty());
    assert!(!queue.has_eligible());

    // Other entities are not held up.
    let unrelated = update(3, 4);
    queue.enqueue(unrelated.clone());
    let taken: Vec<_> = queue.take_eligible(10).into_iter().map(|e| e.mutation.id).collect();
    assert_eq!(taken, vec![unrelated.id]);

    tokio::time::advance(std::time::Duration::from_secs(10)).await;
    let taken: Vec<_> = queue.take_eligible(10).into_iter().map(|e| e.mutation.id).collect();
    assert_eq!(taken, vec![failing.id]);
    assert_eq!(queue.next_retry_at(), None);
  }

  #[test]
  fn test_release_in_flight() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    queue.enqueue(update(1, 0));
    queue.enqueue(update(2, 1));
    queue.take_eligible(10);

    assert_eq!(queue.release_in_flight(), 2);
    assert!(store
      .load()
      .unwrap()
      .iter()
      .all(|e| e.status == QueueStatus::Pending));
  }

  #[test]
  fn test_sensitive_fields_never_persisted() {
    let store = Arc::new(MemoryStore::new());
    let mask = Arc::new(FieldMask::new().with_collection("comments", ["content"]));
    let queue = OfflineQueue::open(store.clone(), mask.clone()).unwrap();
    let m = MutationDescriptor::new(
      "comments",
      Operation::Insert,
      json!({"content": "secret", "project_id": 4}),
      Utc::now(),
      "id",
    );
    queue.enqueue(m.clone());

    // In memory the real payload is kept for sending.
    assert_eq!(queue.get(m.id).unwrap().mutation.variables["content"], "secret");

    let raw = String::from_utf8(store.raw_queue()).unwrap();
    assert!(!raw.contains("secret"));
    let persisted = store.load().unwrap();
    assert!(persisted[0].redacted);
    assert_eq!(persisted[0].mutation.variables["content"], Value::from("[REDACTED]"));

    // After a restart the placeholder payload must not be replayed.
    let reopened = OfflineQueue::open(store, mask).unwrap();
    assert!(reopened.take_eligible(10).is_empty());
    let failed = reopened.failed_mutations();
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0].last_error, Some(SyncError::Validation(_))));
    assert!(reopened.retry(m.id).is_err());
  }

  #[test]
  fn test_discard_and_retry() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    let m = update(1, 0);
    queue.enqueue(m.clone());

    queue.take_eligible(1);
    assert!(matches!(queue.discard(m.id), Err(SyncError::Conflict(_))));

    queue.fail(m.id, 8, SyncError::Network("unreachable".to_string()));
    queue.retry(m.id).unwrap();
    let entry = queue.get(m.id).unwrap();
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.attempts, 0);

    assert_eq!(queue.discard(m.id).unwrap().mutation.id, m.id);
    assert!(matches!(queue.discard(m.id), Err(SyncError::NotFound(_))));
  }

  #[test]
  fn test_direct_lock_waits_for_queue() {
    let store = Arc::new(MemoryStore::new());
    let queue = open(&store);
    let queued = update(1, 0);
    let direct = update(1, 1);
    queue.enqueue(queued.clone());

    assert!(!queue.try_lock_direct(&direct));
    assert!(queue.try_lock_direct(&update(2, 1)));

    queue.take_eligible(1);
    queue.succeed(queued.id);
    assert!(queue.try_lock_direct(&direct));

    // The direct lock blocks the queue in turn.
    queue.enqueue(update(1, 2));
    assert!(queue.take_eligible(10).is_empty());
    queue.unlock_direct(direct.id);
    assert_eq!(queue.take_eligible(10).len(), 1);
  }

  #[tokio::test]
  async fn test_lock_direct_wakes_on_release() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(open(&store));
    let queued = update(1, 0);
    queue.enqueue(queued.clone());
    queue.take_eligible(1);

    let waiter = {
      let queue = queue.clone();
      let direct = update(1, 1);
      tokio::spawn(async move { queue.lock_direct(&direct).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    queue.succeed(queued.id);
    tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
      .await
      .unwrap()
      .unwrap();
  }
}
