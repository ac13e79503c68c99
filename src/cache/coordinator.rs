//! The query cache coordinator: the single owner of cache entries and optimistic patches.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::entry::{CacheEntry, ReadOptions, ReadState};
use super::key::QueryKey;
use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::mask::FieldMask;
use crate::mutation::{MutationDescriptor, MutationId};
use crate::optimistic::{OptimisticPatch, PatchBook, Reconciled, Updater};
use crate::storage::EntityStore;

type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, SyncError>> + Send + Sync>;

type FetchTask = Shared<BoxFuture<'static, ()>>;

struct Running {
  seq: u64,
  task: FetchTask,
}

struct Slot {
  entry: CacheEntry,
  fetcher: Option<Fetcher>,
  running: Option<Running>,
  /// Fetch sequence numbers start at 1; 0 marks hydrated values
  next_seq: u64,
  /// `(started_at, seq)` of the fetch that produced the committed value
  applied: Option<(DateTime<Utc>, u64)>,
  /// Stale until a fetch with `seq >=` this boundary succeeds
  invalidated: Option<u64>,
  version: watch::Sender<u64>,
}

impl Slot {
  fn new() -> Self {
    Self {
      entry: CacheEntry::default(),
      fetcher: None,
      running: None,
      next_seq: 1,
      applied: None,
      invalidated: None,
      version: watch::channel(0).0,
    }
  }

  fn is_observed(&self) -> bool {
    self.version.receiver_count() > 0
  }

  fn notify(&self) {
    self.version.send_modify(|v| *v = v.wrapping_add(1));
  }

  fn invalidate(&mut self) {
    self.invalidated = Some(self.next_seq);
    self.entry.is_stale = true;
  }

  fn show(&mut self, reconciled: Reconciled) {
    self.entry.value = reconciled.value;
    self.entry.optimistic = reconciled.optimistic;
  }
}

struct CacheState {
  slots: HashMap<QueryKey, Slot>,
  book: PatchBook,
}

struct Inner {
  state: Mutex<CacheState>,
  mask: Arc<FieldMask>,
  store: Arc<dyn EntityStore>,
  clock: Arc<dyn Clock>,
  connectivity: ConnectivityMonitor,
  stale_time: Duration,
}

/// Serves reads from memory, refreshes them in the background and holds optimistic
/// patches until their mutation resolves.
///
/// All state sits behind one mutex that is never held across an await, so every update
/// a reader can observe is an atomic swap. Values are masked before they are stored.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

impl QueryCache {
  pub fn new(
    mask: Arc<FieldMask>,
    connectivity: ConnectivityMonitor,
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    stale_time: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(CacheState {
          slots: HashMap::new(),
          book: PatchBook::new(Arc::clone(&mask)),
        }),
        mask,
        store,
        clock,
        connectivity,
        stale_time,
      }),
    }
  }

  /// Return what is cached for `key` right now and schedule a background fetch when the
  /// entry is missing, stale or `options.force` is set.
  ///
  /// Never fails: fetch errors show up in [`ReadState::error`] on later reads.
  pub fn read<T, F, Fut>(&self, key: &QueryKey, fetch: F, options: ReadOptions) -> ReadState<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let mut state = self.lock();
    let slot = self.slot(&mut state.slots, key);
    slot.fetcher = Some(boxed_fetcher(fetch));

    if self.should_fetch(slot, &options) {
      self.start_fetch(slot, key);
    }
    ReadState::from_entry(&self.view(&slot.entry, &options))
  }

  /// Like [`read`](Self::read) but waits for the fetch to finish. Joins a fetch that is
  /// already running instead of starting another one.
  pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, fetch: F, options: ReadOptions) -> ReadState<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let pending = {
      let mut state = self.lock();
      let slot = self.slot(&mut state.slots, key);
      slot.fetcher = Some(boxed_fetcher(fetch));

      let joined = slot
        .running
        .as_ref()
        .filter(|_| options.enabled && !options.force)
        .map(|running| running.task.clone());
      if joined.is_some() {
        joined
      } else if self.should_fetch(slot, &options) {
        self.start_fetch(slot, key)
      } else {
        None
      }
    };

    if let Some(task) = pending {
      task.await;
    }
    self.peek_with(key, &options)
  }

  /// Current state of `key` without fetching.
  pub fn peek<T: DeserializeOwned>(&self, key: &QueryKey) -> ReadState<T> {
    self.peek_with(key, &ReadOptions::default())
  }

  fn peek_with<T: DeserializeOwned>(&self, key: &QueryKey, options: &ReadOptions) -> ReadState<T> {
    let state = self.lock();
    match state.slots.get(key) {
      Some(slot) => ReadState::from_entry(&self.view(&slot.entry, options)),
      None => ReadState::from_entry(&self.view(&CacheEntry::default(), options)),
    }
  }

  /// Snapshot of the entry for `key`, staleness included.
  pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
    let state = self.lock();
    state
      .slots
      .get(key)
      .map(|slot| self.view(&slot.entry, &ReadOptions::default()))
  }

  /// Watch `key` for changes. While any observer is alive the key counts as actively
  /// observed and is refetched when invalidated.
  pub fn observe(&self, key: &QueryKey) -> QueryObserver {
    let mut state = self.lock();
    let slot = self.slot(&mut state.slots, key);
    QueryObserver {
      cache: self.clone(),
      key: key.clone(),
      version: slot.version.subscribe(),
    }
  }

  /// Mark every entry under `prefix` stale and refetch the observed ones. Returns the
  /// number of entries touched.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let online = self.inner.connectivity.is_online();
    let mut state = self.lock();
    let mut touched = 0;

    for (key, slot) in state.slots.iter_mut() {
      if !key.starts_with(prefix) {
        continue;
      }
      touched += 1;
      slot.invalidate();
      if online && slot.is_observed() {
        // Supersedes any fetch that started before the invalidation.
        self.start_fetch(slot, key);
      }
      slot.notify();
    }

    debug!(%prefix, touched, "Invalidated cache entries");
    touched
  }

  /// Refetch observed entries that are stale or expired, e.g. after reconnecting.
  pub fn refresh_stale_observed(&self) -> usize {
    if !self.inner.connectivity.is_online() {
      return 0;
    }
    let options = ReadOptions::default();
    let mut state = self.lock();
    let mut started = 0;

    for (key, slot) in state.slots.iter_mut() {
      if slot.is_observed() && slot.running.is_none() && self.needs_refresh(slot, &options) {
        if self.start_fetch(slot, key).is_some() {
          started += 1;
        }
      }
    }
    started
  }

  /// Write an authoritative value, as if a fetch had just returned it.
  pub fn set_data(&self, key: &QueryKey, value: Value) {
    let masked = self.mask_for(key, &value);
    let now = self.inner.clock.now();
    {
      let mut guard = self.lock();
      let CacheState { slots, book } = &mut *guard;
      let slot = self.slot(slots, key);
      let seq = slot.next_seq;
      slot.next_seq += 1;
      Self::commit_fetched(slot, book, key, masked.clone(), now, seq);
      slot.notify();
    }
    self.write_through(key, &masked, now);
  }

  /// Drop every entry and patch, persisted entries included. Observers stay attached and
  /// see an empty entry.
  pub fn clear(&self) {
    {
      let mut state = self.lock();
      state.book.clear();
      state.slots.retain(|_, slot| slot.is_observed());
      for slot in state.slots.values_mut() {
        let version = std::mem::replace(&mut slot.version, watch::channel(0).0);
        *slot = Slot {
          version,
          ..Slot::new()
        };
        slot.notify();
      }
    }
    if let Err(e) = self.inner.store.clear() {
      warn!(error = %e, "Failed to clear persisted cache");
    }
  }

  /// Patches currently stacked on `key`, oldest first.
  pub fn patches(&self, key: &QueryKey) -> Vec<OptimisticPatch> {
    self.lock().book.patches(key)
  }

  /// Install the provisional value of every affected key.
  pub(crate) fn apply_optimistic(&self, mutation: &Arc<MutationDescriptor>, updater: &Updater) {
    let mut guard = self.lock();
    let CacheState { slots, book } = &mut *guard;
    for key in &mutation.affected_keys {
      self.slot(slots, key);
    }

    let reconciled = book.apply(mutation, updater, |key| {
      slots.get(key).and_then(|slot| slot.entry.value.clone())
    });
    for r in reconciled {
      if let Some(slot) = slots.get_mut(&r.key) {
        slot.show(r);
        slot.notify();
      }
    }
  }

  /// Resolve a mutation's patches successfully.
  pub(crate) fn commit(&self, id: MutationId, server_result: Option<&Value>) {
    let mut guard = self.lock();
    let CacheState { slots, book } = &mut *guard;
    for r in book.commit(id, server_result) {
      if let Some(slot) = slots.get_mut(&r.key) {
        slot.show(r);
        slot.notify();
      }
    }
  }

  /// Undo a mutation's patches. The affected entries become stale.
  pub(crate) fn rollback(&self, id: MutationId) {
    let online = self.inner.connectivity.is_online();
    let mut guard = self.lock();
    let CacheState { slots, book } = &mut *guard;
    for r in book.rollback(id) {
      let key = r.key.clone();
      if let Some(slot) = slots.get_mut(&key) {
        slot.show(r);
        slot.invalidate();
        if online && slot.is_observed() {
          self.start_fetch(slot, &key);
        }
        slot.notify();
      }
    }
  }

  pub(crate) fn has_patches_for(&self, id: MutationId) -> bool {
    self.lock().book.contains(id)
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Slot for `key`, hydrated from the entity store on first use.
  fn slot<'a>(&self, slots: &'a mut HashMap<QueryKey, Slot>, key: &QueryKey) -> &'a mut Slot {
    slots.entry(key.clone()).or_insert_with(|| {
      let mut slot = Slot::new();
      match self.inner.store.load_entry(key) {
        Ok(Some(stored)) => {
          debug!(%key, "Hydrated cache entry from storage");
          slot.entry.value = Some(stored.value);
          slot.entry.fetched_at = Some(stored.fetched_at);
          slot.applied = Some((stored.fetched_at, 0));
        }
        Ok(None) => {}
        Err(e) => warn!(%key, error = %e, "Failed to load persisted cache entry"),
      }
      slot
    })
  }

  fn stale_time(&self, options: &ReadOptions) -> Duration {
    options.stale_time.unwrap_or(self.inner.stale_time)
  }

  fn needs_refresh(&self, slot: &Slot, options: &ReadOptions) -> bool {
    slot.entry.value.is_none()
      || slot.invalidated.is_some()
      || slot
        .entry
        .is_expired(self.inner.clock.now(), self.stale_time(options))
  }

  fn should_fetch(&self, slot: &Slot, options: &ReadOptions) -> bool {
    if !options.enabled || !self.inner.connectivity.is_online() {
      return false;
    }
    if options.force {
      return true;
    }
    slot.running.is_none() && self.needs_refresh(slot, options)
  }

  /// Snapshot with expiry folded into `is_stale`.
  fn view(&self, entry: &CacheEntry, options: &ReadOptions) -> CacheEntry {
    let mut view = entry.clone();
    view.is_stale =
      entry.is_stale || entry.is_expired(self.inner.clock.now(), self.stale_time(options));
    view
  }

  fn mask_for(&self, key: &QueryKey, value: &Value) -> Value {
    self.inner.mask.mask(key.collection().unwrap_or_default(), value)
  }

  /// Spawn a fetch for `key` that supersedes any running one. Returns `None` when there is
  /// nothing to fetch with or no runtime to run on.
  fn start_fetch(&self, slot: &mut Slot, key: &QueryKey) -> Option<FetchTask> {
    let fetcher = slot.fetcher.clone()?;
    let runtime = match tokio::runtime::Handle::try_current() {
      Ok(handle) => handle,
      Err(_) => {
        warn!(%key, "No async runtime, skipping fetch");
        return None;
      }
    };

    let seq = slot.next_seq;
    slot.next_seq += 1;
    let started_at = self.inner.clock.now();
    debug!(%key, seq, "Fetching");

    let cache = self.clone();
    let task_key = key.clone();
    let task = async move {
      let result = AssertUnwindSafe(fetcher())
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(SyncError::Cancelled("fetch panicked".to_string())));
      cache.complete_fetch(&task_key, seq, started_at, result);
    }
    .boxed()
    .shared();

    slot.running = Some(Running {
      seq,
      task: task.clone(),
    });
    slot.entry.in_flight = true;
    slot.notify();
    runtime.spawn(task.clone());
    Some(task)
  }

  fn complete_fetch(
    &self,
    key: &QueryKey,
    seq: u64,
    started_at: DateTime<Utc>,
    result: Result<Value, SyncError>,
  ) {
    let persisted = {
      let mut guard = self.lock();
      let CacheState { slots, book } = &mut *guard;
      let Some(slot) = slots.get_mut(key) else {
        return; // cleared meanwhile
      };

      let current = slot.running.as_ref().is_some_and(|r| r.seq == seq);
      if current {
        slot.running = None;
        slot.entry.in_flight = false;
      }

      let persisted = match result {
        Ok(_) if slot.applied.is_some_and(|applied| applied > (started_at, seq)) => {
          debug!(%key, seq, "Discarding late fetch result");
          None
        }
        Ok(value) => {
          let masked = self.mask_for(key, &value);
          Self::commit_fetched(slot, book, key, masked.clone(), started_at, seq);
          Some(masked)
        }
        Err(e) if current => {
          warn!(%key, error = %e, "Fetch failed");
          slot.entry.error = Some(e);
          slot.invalidated.get_or_insert(slot.next_seq);
          slot.entry.is_stale = true;
          None
        }
        // A newer fetch is running; its outcome decides.
        Err(_) => None,
      };
      slot.notify();
      persisted
    };

    if let Some(masked) = persisted {
      self.write_through(key, &masked, started_at);
    }
  }

  fn commit_fetched(
    slot: &mut Slot,
    book: &mut PatchBook,
    key: &QueryKey,
    masked: Value,
    started_at: DateTime<Utc>,
    seq: u64,
  ) {
    slot.applied = Some((started_at, seq));
    slot.entry.fetched_at = Some(started_at);
    slot.entry.error = None;
    if slot.invalidated.is_some_and(|boundary| seq >= boundary) {
      slot.invalidated = None;
    }
    slot.entry.is_stale = slot.invalidated.is_some();

    match book.rebase(key, masked.clone()) {
      Some(reconciled) => slot.show(reconciled),
      None => {
        slot.entry.value = Some(masked);
        slot.entry.optimistic = false;
      }
    }
  }

  fn write_through(&self, key: &QueryKey, value: &Value, fetched_at: DateTime<Utc>) {
    if let Err(e) = self.inner.store.store_entry(key, value, fetched_at) {
      warn!(%key, error = %e, "Failed to persist cache entry");
    }
  }
}

fn boxed_fetcher<T, F, Fut>(fetch: F) -> Fetcher
where
  T: Serialize + Send + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
{
  Arc::new(move || {
    let pending = fetch();
    async move {
      let value = pending.await?;
      serde_json::to_value(value).map_err(|e| SyncError::Decode(e.to_string()))
    }
    .boxed()
  })
}

/// Handle that keeps a key actively observed and wakes on every change to it.
pub struct QueryObserver {
  cache: QueryCache,
  key: QueryKey,
  version: watch::Receiver<u64>,
}

impl QueryObserver {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Wait for the next change. Returns false once the cache is gone.
  pub async fn changed(&mut self) -> bool {
    self.version.changed().await.is_ok()
  }

  pub fn current<T: DeserializeOwned>(&self) -> ReadState<T> {
    self.cache.peek(&self.key)
  }
}
