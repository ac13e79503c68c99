//! Mutation dispatch: optimistic apply, durable queueing, replay and reconciliation.
//!
//! Every mutation that may be deferred goes through the offline queue, even when the
//! backend is reachable: it is persisted first and the flush that follows performs the
//! send. A crash between submit and acknowledgment therefore replays the mutation instead
//! of losing it. Mutations submitted with [`MutateOptions::online_only`] skip the queue and
//! are sent exactly once.

mod handle;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{QueryCache, QueryKey};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::error::SyncError;
use crate::mask::FieldMask;
use crate::mutation::{MutationDescriptor, MutationId, Operation};
use crate::optimistic::{updater, Updater};
use crate::queue::{Backoff, OfflineQueue, QueueStatus, QueuedMutation};
use crate::transport::Transport;

pub use handle::{MutationHandle, MutationState};

pub type SuccessCallback = Box<dyn FnOnce(&Value) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(&SyncError) + Send>;

/// Per-call options for [`Dispatcher::mutate`].
pub struct MutateOptions {
  pub optimistic_updater: Option<Updater>,
  pub affected_keys: Vec<QueryKey>,
  pub conflict_target: Option<String>,
  /// Queue the mutation when it cannot be sent now. When false the mutation is sent once
  /// and fails immediately while offline.
  pub allow_offline: bool,
  /// Replace the optimistic value of every affected key with the backend response
  pub use_server_result: bool,
  pub on_success: Option<SuccessCallback>,
  pub on_error: Option<ErrorCallback>,
}

impl Default for MutateOptions {
  fn default() -> Self {
    Self {
      optimistic_updater: None,
      affected_keys: Vec::new(),
      conflict_target: None,
      allow_offline: true,
      use_server_result: false,
      on_success: None,
      on_error: None,
    }
  }
}

impl MutateOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn optimistic<F>(mut self, f: F) -> Self
  where
    F: Fn(Option<&Value>, &MutationDescriptor) -> Value + Send + Sync + 'static,
  {
    self.optimistic_updater = Some(updater(f));
    self
  }

  pub fn affects(mut self, key: QueryKey) -> Self {
    self.affected_keys.push(key);
    self
  }

  pub fn conflict_target(mut self, target: impl Into<String>) -> Self {
    self.conflict_target = Some(target.into());
    self
  }

  /// Never defer: fail right away instead of queueing.
  pub fn online_only(mut self) -> Self {
    self.allow_offline = false;
    self
  }

  pub fn use_server_result(mut self) -> Self {
    self.use_server_result = true;
    self
  }

  pub fn on_success<F>(mut self, f: F) -> Self
  where
    F: FnOnce(&Value) + Send + 'static,
  {
    self.on_success = Some(Box::new(f));
    self
  }

  pub fn on_error<F>(mut self, f: F) -> Self
  where
    F: FnOnce(&SyncError) + Send + 'static,
  {
    self.on_error = Some(Box::new(f));
    self
  }
}

/// Retry and scheduling limits.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
  pub primary_key: String,
  pub max_attempts: u32,
  pub backoff: Backoff,
  pub max_concurrency: usize,
  pub send_timeout: Duration,
}

impl Default for DispatchSettings {
  fn default() -> Self {
    Self::from(&SyncConfig::default())
  }
}

impl From<&SyncConfig> for DispatchSettings {
  fn from(config: &SyncConfig) -> Self {
    Self {
      primary_key: config.primary_key.clone(),
      max_attempts: config.max_attempts.max(1),
      backoff: config.backoff(),
      max_concurrency: config.max_concurrency.max(1),
      send_timeout: config.send_timeout(),
    }
  }
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
  pub committed: usize,
  pub failed: usize,
  /// Returned to the queue because connectivity dropped
  pub deferred: usize,
}

impl FlushReport {
  fn record(&mut self, outcome: Outcome) {
    match outcome {
      Outcome::Committed => self.committed += 1,
      Outcome::Failed => self.failed += 1,
      Outcome::Deferred => self.deferred += 1,
      Outcome::Retrying => {}
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
  Committed,
  Failed,
  Deferred,
  /// Back in the queue until its backoff elapses
  Retrying,
}

struct Completion {
  sender: oneshot::Sender<Result<Value, SyncError>>,
  on_success: Option<SuccessCallback>,
  on_error: Option<ErrorCallback>,
  use_server_result: bool,
}

/// A flush in progress. Cloning it joins the same cycle.
pub type FlushCycle = Shared<BoxFuture<'static, FlushReport>>;

struct RunningFlush {
  cycle: FlushCycle,
  abort: AbortHandle,
}

struct Inner {
  cache: QueryCache,
  queue: Arc<OfflineQueue>,
  transport: Arc<dyn Transport>,
  connectivity: ConnectivityMonitor,
  clock: Arc<dyn Clock>,
  mask: Arc<FieldMask>,
  settings: DispatchSettings,
  completions: Mutex<HashMap<MutationId, Completion>>,
  flush: Mutex<Option<RunningFlush>>,
  /// Wakes a running flush cycle when new work is queued
  wake: Notify,
  flush_cycles: AtomicU64,
}

/// Orchestrates mutations end to end. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
  inner: Arc<Inner>,
}

impl Dispatcher {
  pub fn new(
    cache: QueryCache,
    queue: Arc<OfflineQueue>,
    transport: Arc<dyn Transport>,
    connectivity: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
    mask: Arc<FieldMask>,
    settings: DispatchSettings,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        cache,
        queue,
        transport,
        connectivity,
        clock,
        mask,
        settings,
        completions: Mutex::new(HashMap::new()),
        flush: Mutex::new(None),
        wake: Notify::new(),
        flush_cycles: AtomicU64::new(0),
      }),
    }
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.inner.queue
  }

  /// Number of flush cycles started so far.
  pub fn flush_cycles(&self) -> u64 {
    self.inner.flush_cycles.load(Ordering::SeqCst)
  }

  /// Submit a write. The optimistic value (if any) is visible in the cache before this
  /// returns. Must be called from within a tokio runtime.
  ///
  /// On success the optimistic patch is confirmed and the affected keys are invalidated,
  /// so the cache shows the backend's value once they are refetched. Set
  /// [`MutateOptions::use_server_result`] to write the backend response into the affected
  /// keys directly when it has the shape those reads expect.
  pub fn mutate(
    &self,
    collection: impl Into<String>,
    operation: Operation,
    variables: Value,
    options: MutateOptions,
  ) -> MutationHandle {
    let inner = &self.inner;
    let mut descriptor = MutationDescriptor::new(
      collection,
      operation,
      variables,
      inner.clock.now(),
      &inner.settings.primary_key,
    )
    .with_affected_keys(options.affected_keys);
    if let Some(target) = options.conflict_target {
      descriptor = descriptor.with_conflict_target(target);
    }
    let mutation = Arc::new(descriptor);

    let (sender, receiver) = oneshot::channel();
    self.completions().insert(
      mutation.id,
      Completion {
        sender,
        on_success: options.on_success,
        on_error: options.on_error,
        use_server_result: options.use_server_result,
      },
    );
    let handle = MutationHandle::new(mutation.id, receiver);

    if let Some(updater) = &options.optimistic_updater {
      inner.cache.apply_optimistic(&mutation, updater);
    }

    info!(
      id = %mutation.id,
      operation = ?mutation.operation,
      group = %mutation.entity_group(),
      variables = %inner.mask.display(&mutation.collection, &mutation.variables),
      "Mutation submitted"
    );

    if options.allow_offline {
      inner.queue.enqueue((*mutation).clone());
      if inner.connectivity.is_online() {
        self.request_flush();
      }
    } else if !inner.connectivity.is_online() {
      let err = SyncError::Offline(format!(
        "{} on {} cannot be deferred",
        operation_name(mutation.operation),
        mutation.collection
      ));
      self.finish_err(&mutation, err);
    } else {
      let this = self.clone();
      tokio::spawn(async move { this.send_direct(mutation).await });
    }

    handle
  }

  /// Drain the queue. Concurrent callers share the cycle that is already running.
  pub fn flush(&self) -> FlushCycle {
    let mut slot = self.flush_slot();
    if let Some(running) = slot.as_ref() {
      return running.cycle.clone();
    }

    let this = self.clone();
    let task = tokio::spawn(async move { this.run_cycle().await });
    let abort = task.abort_handle();
    let inner = Arc::clone(&self.inner);
    let cycle = async move {
      match task.await {
        Ok(report) => report,
        Err(e) => {
          if e.is_panic() {
            error!(error = %e, "Flush cycle panicked");
            *inner.flush.lock().unwrap_or_else(PoisonError::into_inner) = None;
          }
          FlushReport::default()
        }
      }
    }
    .boxed()
    .shared();
    *slot = Some(RunningFlush {
      cycle: cycle.clone(),
      abort,
    });
    // Resolves joiners even if every caller drops its future.
    tokio::spawn(cycle.clone());
    cycle
  }

  /// Start a flush in the background, or nudge the running one.
  pub fn request_flush(&self) {
    self.inner.wake.notify_one();
    drop(self.flush());
  }

  /// Remove a mutation that is not in flight, undoing its optimistic patch. Its handle
  /// resolves with [`SyncError::Cancelled`] if it had not resolved yet.
  pub fn discard(&self, id: MutationId) -> Result<(), SyncError> {
    self.inner.queue.discard(id)?;
    self.inner.cache.rollback(id);
    self.complete(id, Err(SyncError::Cancelled(format!("mutation {} was discarded", id))));
    Ok(())
  }

  /// Give a failed mutation another round of attempts.
  pub fn retry(&self, id: MutationId) -> Result<(), SyncError> {
    self.inner.queue.retry(id)?;
    info!(%id, "Retrying failed mutation");
    if self.inner.connectivity.is_online() {
      self.request_flush();
    }
    Ok(())
  }

  /// Stop the running flush and resolve every outstanding handle with
  /// [`SyncError::Cancelled`]. Queued mutations stay persisted for the next session.
  pub fn cancel_outstanding(&self) {
    if let Some(running) = self.flush_slot().take() {
      running.abort.abort();
      let released = self.inner.queue.release_in_flight();
      debug!(released, "Stopped running flush");
    }
    let outstanding: Vec<MutationId> = self.completions().keys().copied().collect();
    for id in outstanding {
      self.complete(
        id,
        Err(SyncError::Cancelled("the sync context shut down".to_string())),
      );
    }
  }

  async fn run_cycle(&self) -> FlushReport {
    let inner = &self.inner;
    let cycle = inner.flush_cycles.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(cycle, pending = inner.queue.pending_count(), "Flush started");

    let mut report = FlushReport::default();
    let mut tasks = JoinSet::new();
    let mut running: HashSet<MutationId> = HashSet::new();
    let mut retrying: HashSet<MutationId> = HashSet::new();
    let mut connectivity = inner.connectivity.subscribe();

    loop {
      let online = inner.connectivity.is_online();
      if online {
        let room = inner.settings.max_concurrency.saturating_sub(tasks.len());
        for entry in inner.queue.take_eligible(room) {
          let id = entry.mutation.id;
          running.insert(id);
          retrying.remove(&id);
          let this = self.clone();
          tasks.spawn(async move { (id, this.process(entry).await) });
        }
      }
      let retry_at = if online {
        inner.queue.next_retry_at()
      } else {
        None
      };
      if tasks.is_empty() && retry_at.is_none() {
        break;
      }

      tokio::select! {
        joined = tasks.join_next(), if !tasks.is_empty() => match joined {
          Some(Ok((id, outcome))) => {
            running.remove(&id);
            if outcome == Outcome::Retrying {
              retrying.insert(id);
            }
            report.record(outcome);
          }
          Some(Err(e)) => error!(error = %e, "Send task panicked"),
          None => {}
        },
        _ = sleep_until(retry_at) => {}
        _ = wait_offline(&mut connectivity), if online => {}
        _ = inner.wake.notified() => {}
      }
    }

    // Backing off when connectivity dropped: picked up by the next flush.
    report.deferred += retrying
      .iter()
      .filter(|id| inner.queue.get(**id).is_some_and(|e| e.status == QueueStatus::Pending))
      .count();

    // Whatever is left belonged to a task that panicked before settling.
    for id in running {
      let attempts = inner.queue.get(id).map_or(0, |e| e.attempts);
      let err = SyncError::Cancelled("send task panicked".to_string());
      inner.queue.fail(id, attempts, err.clone());
      if let Some(entry) = inner.queue.get(id) {
        self.finish_err(&entry.mutation, err);
      }
      report.failed += 1;
    }

    *self.flush_slot() = None;

    if report != FlushReport::default() {
      info!(
        cycle,
        committed = report.committed,
        failed = report.failed,
        deferred = report.deferred,
        remaining = inner.queue.pending_count(),
        "Flush finished"
      );
    }

    // Work queued after the last scheduling pass.
    if inner.connectivity.is_online() && inner.queue.has_eligible() {
      drop(self.flush());
    }
    report
  }

  /// Make one attempt at a queued mutation. A retryable failure puts it back in the queue
  /// with a backoff instead of holding a send slot while it waits.
  async fn process(&self, entry: QueuedMutation) -> Outcome {
    let inner = &self.inner;
    let mutation = entry.mutation;
    let id = mutation.id;
    let attempts = entry.attempts;

    if !inner.connectivity.is_online() {
      inner.queue.release(id, attempts, None);
      debug!(%id, "Offline, returning mutation to the queue");
      return Outcome::Deferred;
    }

    match self.send_once(&mutation).await {
      Ok(value) => {
        inner.queue.succeed(id);
        self.finish_ok(&mutation, value);
        Outcome::Committed
      }
      Err(e) if e.is_retryable() => {
        let attempts = attempts + 1;
        if attempts >= inner.settings.max_attempts {
          warn!(%id, attempts, error = %e, "Giving up on mutation");
          inner.queue.fail(id, attempts, e.clone());
          self.finish_err(&mutation, e);
          return Outcome::Failed;
        }

        let delay = inner.settings.backoff.delay(attempts);
        warn!(%id, attempts, ?delay, error = %e, "Send failed, retrying");
        inner.queue.back_off(id, attempts, e, Instant::now() + delay);
        Outcome::Retrying
      }
      Err(e) => {
        warn!(%id, error = %e, "Mutation rejected");
        inner.queue.fail(id, attempts + 1, e.clone());
        self.finish_err(&mutation, e);
        Outcome::Failed
      }
    }
  }

  async fn send_direct(&self, mutation: Arc<MutationDescriptor>) {
    let inner = &self.inner;
    let timeout = inner.settings.send_timeout;

    if tokio::time::timeout(timeout, inner.queue.lock_direct(&mutation))
      .await
      .is_err()
    {
      let group = mutation.entity_group();
      self.finish_err(
        &mutation,
        SyncError::Timeout(format!("{} stayed busy for {:?}", group, timeout)),
      );
      return;
    }

    let result = self.send_once(&mutation).await;
    inner.queue.unlock_direct(mutation.id);
    match result {
      Ok(value) => self.finish_ok(&mutation, value),
      Err(e) => self.finish_err(&mutation, e),
    }
  }

  async fn send_once(&self, mutation: &MutationDescriptor) -> Result<Value, SyncError> {
    let timeout = self.inner.settings.send_timeout;
    match tokio::time::timeout(timeout, self.inner.transport.send(mutation)).await {
      Ok(result) => result.map_err(SyncError::from),
      Err(_) => Err(SyncError::Timeout(format!("no response within {:?}", timeout))),
    }
  }

  /// Terminal success: commit the patch, refresh dependent reads, resolve the handle.
  fn finish_ok(&self, mutation: &MutationDescriptor, value: Value) {
    let use_server_result = self
      .completions()
      .get(&mutation.id)
      .is_some_and(|c| c.use_server_result);

    let inner = &self.inner;
    inner
      .cache
      .commit(mutation.id, use_server_result.then_some(&value));
    self.invalidate_affected(mutation);
    info!(id = %mutation.id, "Mutation committed");
    self.complete(mutation.id, Ok(value));
  }

  /// Terminal failure: roll back, resolve the handle with the error.
  fn finish_err(&self, mutation: &MutationDescriptor, err: SyncError) {
    self.inner.cache.rollback(mutation.id);
    if err.is_stale_signal() {
      self.invalidate_affected(mutation);
    }
    self.complete(mutation.id, Err(err));
  }

  fn invalidate_affected(&self, mutation: &MutationDescriptor) {
    for key in &mutation.affected_keys {
      self.inner.cache.invalidate(key);
    }
  }

  /// Fire the callback and resolve the handle. Only the first call per mutation has any
  /// effect.
  fn complete(&self, id: MutationId, result: Result<Value, SyncError>) {
    let Some(completion) = self.completions().remove(&id) else {
      return;
    };

    match &result {
      Ok(value) => {
        if let Some(on_success) = completion.on_success {
          on_success(value);
        }
      }
      Err(e) => {
        if let Some(on_error) = completion.on_error {
          on_error(e);
        }
      }
    }
    // The caller may have dropped the handle.
    let _ = completion.sender.send(result);
  }

  fn flush_slot(&self) -> MutexGuard<'_, Option<RunningFlush>> {
    self.inner.flush.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn completions(&self) -> MutexGuard<'_, HashMap<MutationId, Completion>> {
    self
      .inner
      .completions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }
}

async fn sleep_until(at: Option<Instant>) {
  match at {
    Some(at) => tokio::time::sleep_until(at).await,
    None => std::future::pending().await,
  }
}

async fn wait_offline(rx: &mut watch::Receiver<Connectivity>) {
  loop {
    let state = *rx.borrow_and_update();
    if !state.is_online() {
      return;
    }
    if rx.changed().await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}

fn operation_name(operation: Operation) -> &'static str {
  match operation {
    Operation::Insert => "insert",
    Operation::Update => "update",
    Operation::Delete => "delete",
    Operation::BulkInsert => "bulk insert",
    Operation::BulkUpdate => "bulk update",
    Operation::Upsert => "upsert",
    Operation::RemoteCall => "remote call",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ReadOptions, ReadState};
  use crate::clock::SystemClock;
  use crate::error::ErrorKind;
  use crate::storage::{MemoryStore, NoopStore};
  use crate::transport::MemoryTransport;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use tokio::task::JoinHandle;

  const QUIET: Duration = Duration::from_millis(250);

  struct Harness {
    dispatcher: Dispatcher,
    cache: QueryCache,
    backend: MemoryTransport,
    monitor: ConnectivityMonitor,
    _debouncer: JoinHandle<()>,
  }

  fn settings() -> DispatchSettings {
    DispatchSettings {
      max_attempts: 4,
      backoff: Backoff {
        base: Duration::from_millis(100),
        cap: Duration::from_secs(1),
        jitter: false,
      },
      ..DispatchSettings::default()
    }
  }

  fn harness(online: bool, backend: MemoryTransport, settings: DispatchSettings) -> Harness {
    let mask = Arc::new(FieldMask::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let monitor = ConnectivityMonitor::new(online, QUIET);
    let debouncer = monitor.start();
    let cache = QueryCache::new(
      mask.clone(),
      monitor.clone(),
      Arc::new(NoopStore),
      clock.clone(),
      chrono::Duration::minutes(5),
    );
    let queue = Arc::new(OfflineQueue::open(Arc::new(MemoryStore::new()), mask.clone()).unwrap());
    let dispatcher = Dispatcher::new(
      cache.clone(),
      queue,
      Arc::new(backend.clone()),
      monitor.clone(),
      clock,
      mask,
      settings,
    );
    Harness {
      dispatcher,
      cache,
      backend,
      monitor,
      _debouncer: debouncer,
    }
  }

  async fn set_online(monitor: &ConnectivityMonitor, online: bool) {
    monitor.report(online);
    tokio::time::sleep(QUIET + Duration::from_millis(10)).await;
    assert_eq!(monitor.is_online(), online);
  }

  fn project_key() -> QueryKey {
    QueryKey::new("projects").with(1)
  }

  fn set_margin(current: Option<&Value>, m: &MutationDescriptor) -> Value {
    let mut row = current.cloned().unwrap_or_else(|| json!({}));
    row["margin"] = m.variables["margin"].clone();
    row
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_mutations_replay_in_order() {
    let backend = MemoryTransport::new();
    backend.seed("projects", vec![json!({"id": 1, "margin": 10})]);
    let h = harness(false, backend, settings());

    let m1 = h.dispatcher.mutate(
      "projects",
      Operation::Update,
      json!({"id": 1, "margin": 11}),
      MutateOptions::new(),
    );
    tokio::time::sleep(Duration::from_millis(5)).await;
    let m2 = h.dispatcher.mutate(
      "projects",
      Operation::Update,
      json!({"id": 1, "margin": 12}),
      MutateOptions::new(),
    );
    assert_eq!(h.dispatcher.queue().pending_count(), 2);
    assert_eq!(h.backend.sends(), 0);

    set_online(&h.monitor, true).await;
    let report = h.dispatcher.flush().await;
    assert_eq!(report.committed, 2);

    let applied: Vec<_> = h.backend.applied().into_iter().map(|a| a.id).collect();
    assert_eq!(applied, vec![m1.id(), m2.id()]);
    assert_eq!(h.backend.rows("projects")[0]["margin"], 12);
    assert!(m1.wait().await.is_ok());
    assert!(m2.wait().await.is_ok());
  }

  #[tokio::test(start_paused = true)]
  async fn test_upsert_replay_after_dropped_ack_is_idempotent() {
    let backend = MemoryTransport::new();
    backend.drop_next_ack();
    let h = harness(true, backend, settings());

    let handle = h.dispatcher.mutate(
      "financial_settings",
      Operation::Upsert,
      json!({"project_id": 3, "vat": 21}),
      MutateOptions::new().conflict_target("project_id"),
    );

    let result = handle.wait().await.unwrap();
    assert_eq!(result["vat"], 21);
    assert_eq!(h.backend.sends(), 2);
    assert_eq!(h.backend.rows("financial_settings").len(), 1);
    assert_eq!(h.dispatcher.queue().pending_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_distinct_entities_run_concurrently_same_entity_never_overlaps() {
    let backend = MemoryTransport::new().with_latency(Duration::from_millis(50));
    backend.seed(
      "projects",
      (1..=4).map(|id| json!({"id": id, "margin": 0})).collect(),
    );
    let h = harness(false, backend, settings());

    let mut handles = Vec::new();
    for (id, margin) in [(1, 1), (2, 1), (3, 1), (4, 1), (4, 2)] {
      handles.push(h.dispatcher.mutate(
        "projects",
        Operation::Update,
        json!({"id": id, "margin": margin}),
        MutateOptions::new(),
      ));
      tokio::time::sleep(Duration::from_millis(1)).await;
    }

    set_online(&h.monitor, true).await;
    let report = h.dispatcher.flush().await;
    assert_eq!(report.committed, 5);
    assert_eq!(h.backend.peak_concurrency(), 4);
    assert_eq!(h.backend.peak_per_group(), 1);

    let shared: Vec<_> = h
      .backend
      .applied()
      .into_iter()
      .filter(|a| a.group == "projects/4")
      .map(|a| a.id)
      .collect();
    assert_eq!(shared, vec![handles[3].id(), handles[4].id()]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rejected_mutation_rolls_back_once() {
    let backend = MemoryTransport::new();
    backend.seed("projects", vec![json!({"id": 1, "margin": 10})]);
    backend.fail_next(ErrorKind::Validation);
    let h = harness(true, backend, settings());
    h.cache.set_data(&project_key(), json!({"id": 1, "margin": 10}));

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    let handle = h.dispatcher.mutate(
      "projects",
      Operation::Update,
      json!({"id": 1, "margin": -5}),
      MutateOptions::new()
        .optimistic(set_margin)
        .affects(project_key())
        .on_error(move |_| {
          counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let optimistic: ReadState<Value> = h.cache.peek(&project_key());
    assert_eq!(optimistic.value, Some(json!({"id": 1, "margin": -5})));

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    let state: ReadState<Value> = h.cache.peek(&project_key());
    assert_eq!(state.value, Some(json!({"id": 1, "margin": 10})));
    assert!(!state.is_optimistic);

    let failed = h.dispatcher.queue().failed_mutations();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, QueueStatus::Failed);

    // Discarding a failed mutation does not fire the callback again.
    h.dispatcher.discard(failed[0].mutation.id).unwrap();
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(h.dispatcher.queue().failed_mutations().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_exhaust_into_failure() {
    let backend = MemoryTransport::new();
    backend.set_reachable(false);
    let h = harness(true, backend, settings());
    h.cache.set_data(&project_key(), json!({"id": 1, "margin": 10}));

    let handle = h.dispatcher.mutate(
      "projects",
      Operation::Update,
      json!({"id": 1, "margin": 30}),
      MutateOptions::new().optimistic(set_margin).affects(project_key()),
    );

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
    assert_eq!(h.backend.sends(), 4);

    let failed = h.dispatcher.queue().failed_mutations();
    assert_eq!(failed[0].attempts, 4);
    let state: ReadState<Value> = h.cache.peek(&project_key());
    assert_eq!(state.value, Some(json!({"id": 1, "margin": 10})));

    // A manual retry gets a fresh set of attempts.
    h.backend.set_reachable(true);
    h.backend.seed("projects", vec![json!({"id": 1, "margin": 10})]);
    h.dispatcher.retry(failed[0].mutation.id).unwrap();
    let report = h.dispatcher.flush().await;
    assert_eq!(report.committed, 1);
    assert_eq!(h.backend.rows("projects")[0]["margin"], 30);
  }

  #[tokio::test(start_paused = true)]
  async fn test_backing_off_entities_do_not_starve_healthy_ones() {
    let backend = MemoryTransport::new();
    for _ in 0..4 {
      backend.fail_next(ErrorKind::Network);
    }
    let h = harness(
      false,
      backend,
      DispatchSettings {
        backoff: Backoff {
          base: Duration::from_secs(10),
          cap: Duration::from_secs(10),
          jitter: false,
        },
        ..settings()
      },
    );

    let mut handles = Vec::new();
    for id in 1..=5 {
      handles.push(h.dispatcher.mutate(
        "projects",
        Operation::Insert,
        json!({"id": id, "name": format!("Phase {}", id)}),
        MutateOptions::new(),
      ));
      tokio::time::sleep(Duration::from_millis(1)).await;
    }

    set_online(&h.monitor, true).await;
    let cycle = h.dispatcher.flush();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The four failing inserts wait out their backoff in the queue, not in a send slot.
    let applied: Vec<_> = h.backend.applied().into_iter().map(|a| a.id).collect();
    assert_eq!(applied, vec![handles[4].id()]);
    let statuses: Vec<_> = h
      .dispatcher
      .queue()
      .snapshot()
      .into_iter()
      .map(|e| (e.status, e.attempts))
      .collect();
    assert_eq!(statuses, vec![(QueueStatus::Pending, 1); 4]);

    let report = cycle.await;
    assert_eq!(report.committed, 5);
    assert_eq!(h.backend.rows("projects").len(), 5);
    assert_eq!(h.dispatcher.flush_cycles(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_result_replaces_optimistic_value() {
    let backend = MemoryTransport::new();
    backend.seed(
      "projects",
      vec![json!({"id": 1, "margin": 10, "updated_by": "server"})],
    );
    let h = harness(true, backend, settings());
    h.cache.set_data(&project_key(), json!({"id": 1, "margin": 10}));

    let handle = h.dispatcher.mutate(
      "projects",
      Operation::Update,
      json!({"id": 1, "margin": 30}),
      MutateOptions::new()
        .optimistic(set_margin)
        .affects(project_key())
        .use_server_result(),
    );
    let optimistic: ReadState<Value> = h.cache.peek(&project_key());
    assert_eq!(optimistic.value, Some(json!({"id": 1, "margin": 30})));
    assert!(optimistic.is_optimistic);

    let server = handle.wait().await.unwrap();
    assert_eq!(server, json!({"id": 1, "margin": 30, "updated_by": "server"}));
    let state: ReadState<Value> = h.cache.peek(&project_key());
    assert_eq!(state.value, Some(server));
    assert!(!state.is_optimistic);
  }

  #[tokio::test(start_paused = true)]
  async fn test_going_offline_during_backoff_defers() {
    let backend = MemoryTransport::new();
    backend.fail_next(ErrorKind::Timeout);
    let h = harness(
      true,
      backend,
      DispatchSettings {
        backoff: Backoff {
          base: Duration::from_secs(10),
          cap: Duration::from_secs(10),
          jitter: false,
        },
        ..settings()
      },
    );

    let mut handle = h.dispatcher.mutate(
      "projects",
      Operation::Insert,
      json!({"name": "Roof"}),
      MutateOptions::new(),
    );
    let cycle = h.dispatcher.flush();
    set_online(&h.monitor, false).await;

    let report = cycle.await;
    assert_eq!(report.deferred, 1);
    assert!(!handle.poll());
    let queued = h.dispatcher.queue().snapshot();
    assert_eq!(queued[0].status, QueueStatus::Pending);
    assert_eq!(queued[0].attempts, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_online_only_mutation_fails_fast_offline() {
    let h = harness(false, MemoryTransport::new(), settings());
    h.cache.set_data(&project_key(), json!({"id": 1, "margin": 10}));

    let handle = h.dispatcher.mutate(
      "profiles",
      Operation::RemoteCall,
      json!({"user_id": "u1", "role": "admin"}),
      MutateOptions::new().online_only(),
    );
    assert!(matches!(handle.wait().await, Err(SyncError::Offline(_))));

    let handle = h.dispatcher.mutate(
      "projects",
      Operation::Update,
      json!({"id": 1, "margin": 99}),
      MutateOptions::new()
        .optimistic(set_margin)
        .affects(project_key())
        .online_only(),
    );
    assert!(matches!(handle.wait().await, Err(SyncError::Offline(_))));
    let state: ReadState<Value> = h.cache.peek(&project_key());
    assert_eq!(state.value, Some(json!({"id": 1, "margin": 10})));
    assert_eq!(h.dispatcher.queue().pending_count(), 0);
    assert_eq!(h.backend.sends(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_online_only_send_and_server_result() {
    let backend = MemoryTransport::new()
      .with_function("set_user_role", |args| Ok(json!({"role": args["role"].clone()})));
    let h = harness(true, backend, settings());
    let key = QueryKey::new("set_user_role").with("u1");

    let successes = Arc::new(AtomicUsize::new(0));
    let counter = successes.clone();
    let handle = h.dispatcher.mutate(
      "set_user_role",
      Operation::RemoteCall,
      json!({"user_id": "u1", "role": "admin"}),
      MutateOptions::new()
        .online_only()
        .optimistic(|_, m| json!({"role": m.variables["role"].clone(), "pending": true}))
        .affects(key.clone())
        .use_server_result()
        .on_success(move |_| {
          counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert_eq!(handle.wait().await.unwrap(), json!({"role": "admin"}));
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    let state: ReadState<Value> = h.cache.peek(&key);
    assert_eq!(state.value, Some(json!({"role": "admin"})));
    // Committed, then invalidated so dependent reads refresh.
    assert!(state.is_stale);
    assert!(h.dispatcher.queue().snapshot().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_not_found_invalidates_affected_keys() {
    let h = harness(true, MemoryTransport::new(), settings());
    let _: ReadState<Value> = h
      .cache
      .fetch(&project_key(), || async { Ok(json!({"id": 1})) }, ReadOptions::default())
      .await;

    let handle = h.dispatcher.mutate(
      "projects",
      Operation::Delete,
      json!({"id": 1}),
      MutateOptions::new().affects(project_key()),
    );
    assert!(matches!(handle.wait().await, Err(SyncError::NotFound(_))));
    assert!(h.cache.entry(&project_key()).unwrap().is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_flushes_are_coalesced() {
    let backend = MemoryTransport::new().with_latency(Duration::from_millis(100));
    let h = harness(false, backend, settings());
    h.dispatcher.mutate(
      "projects",
      Operation::Insert,
      json!({"name": "Roof"}),
      MutateOptions::new(),
    );
    set_online(&h.monitor, true).await;

    let (a, b, c) = tokio::join!(
      h.dispatcher.flush(),
      h.dispatcher.flush(),
      h.dispatcher.flush()
    );
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(a.committed, 1);
    assert_eq!(h.dispatcher.flush_cycles(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_discard_pending_mutation() {
    let h = harness(false, MemoryTransport::new(), settings());
    h.cache.set_data(&project_key(), json!({"id": 1, "margin": 10}));

    let handle = h.dispatcher.mutate(
      "projects",
      Operation::Update,
      json!({"id": 1, "margin": 50}),
      MutateOptions::new().optimistic(set_margin).affects(project_key()),
    );
    h.dispatcher.discard(handle.id()).unwrap();

    assert!(matches!(handle.wait().await, Err(SyncError::Cancelled(_))));
    let state: ReadState<Value> = h.cache.peek(&project_key());
    assert_eq!(state.value, Some(json!({"id": 1, "margin": 10})));
    assert_eq!(h.dispatcher.queue().pending_count(), 0);
  }
}
