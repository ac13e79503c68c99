//! The session-scoped entry point that owns the cache, the queue and background tasks.

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{QueryCache, QueryKey, QueryObserver, ReadOptions, ReadState};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::dispatch::{DispatchSettings, Dispatcher, FlushReport, MutateOptions, MutationHandle};
use crate::error::SyncError;
use crate::mutation::{MutationId, Operation};
use crate::queue::{OfflineQueue, QueuedMutation};
use crate::storage::{EntityStore, NoopStore, QueueStore};
use crate::transport::Transport;

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder {
  config: SyncConfig,
  transport: Arc<dyn Transport>,
  queue_store: Arc<dyn QueueStore>,
  entity_store: Arc<dyn EntityStore>,
  clock: Arc<dyn Clock>,
  initially_online: bool,
}

impl SyncContextBuilder {
  pub fn config(mut self, config: SyncConfig) -> Self {
    self.config = config;
    self
  }

  pub fn queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
    self.queue_store = store;
    self
  }

  pub fn entity_store(mut self, store: Arc<dyn EntityStore>) -> Self {
    self.entity_store = store;
    self
  }

  /// Use one store for both the queue and the entity cache.
  pub fn store<S>(self, store: Arc<S>) -> Self
  where
    S: QueueStore + EntityStore + 'static,
  {
    self
      .queue_store(store.clone() as Arc<dyn QueueStore>)
      .entity_store(store as Arc<dyn EntityStore>)
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Connectivity assumed until the first settled signal.
  pub fn online(mut self, online: bool) -> Self {
    self.initially_online = online;
    self
  }

  /// Load the queue and start background tasks. Must be called from within a tokio
  /// runtime. A queue that cannot be decoded is reset and reported through
  /// [`SyncContext::queue_recovered_from`]; a store that cannot be read fails the build.
  pub fn build(self) -> Result<SyncContext, SyncError> {
    let config = self.config;
    let mask = Arc::new(config.mask.clone());
    let connectivity = ConnectivityMonitor::new(self.initially_online, config.debounce());

    let entity_store: Arc<dyn EntityStore> = if config.persist_cache {
      self.entity_store
    } else {
      Arc::new(NoopStore)
    };
    let cache = QueryCache::new(
      Arc::clone(&mask),
      connectivity.clone(),
      entity_store,
      Arc::clone(&self.clock),
      config.stale_time(),
    );

    let queue = Arc::new(OfflineQueue::open(self.queue_store, Arc::clone(&mask))?);
    let dispatcher = Dispatcher::new(
      cache.clone(),
      queue,
      Arc::clone(&self.transport),
      connectivity.clone(),
      self.clock,
      mask,
      DispatchSettings::from(&config),
    );

    let mut tasks = vec![
      connectivity.start(),
      spawn_reconnect_listener(&connectivity, &dispatcher, &cache),
      spawn_periodic_flush(&connectivity, &dispatcher, &config),
    ];
    if let Some(interval) = config.probe_interval() {
      tasks.push(connectivity.spawn_probe(Arc::clone(&self.transport), interval));
    }

    if connectivity.is_online() && dispatcher.queue().has_eligible() {
      info!(
        pending = dispatcher.queue().pending_count(),
        "Replaying restored mutations"
      );
      dispatcher.request_flush();
    }

    Ok(SyncContext {
      config,
      cache,
      dispatcher,
      connectivity,
      tasks: Mutex::new(tasks),
    })
  }
}

fn spawn_reconnect_listener(
  connectivity: &ConnectivityMonitor,
  dispatcher: &Dispatcher,
  cache: &QueryCache,
) -> JoinHandle<()> {
  let mut transitions = connectivity.subscribe();
  let dispatcher = dispatcher.clone();
  let cache = cache.clone();

  tokio::spawn(async move {
    while transitions.changed().await.is_ok() {
      let state = *transitions.borrow_and_update();
      if !state.is_online() {
        continue;
      }
      info!(
        pending = dispatcher.queue().pending_count(),
        "Back online, flushing mutation queue"
      );
      drop(dispatcher.flush());
      let refreshed = cache.refresh_stale_observed();
      debug!(refreshed, "Refreshing stale observed reads");
    }
  })
}

fn spawn_periodic_flush(
  connectivity: &ConnectivityMonitor,
  dispatcher: &Dispatcher,
  config: &SyncConfig,
) -> JoinHandle<()> {
  let connectivity = connectivity.clone();
  let dispatcher = dispatcher.clone();
  let period = config.flush_interval();

  tokio::spawn(async move {
    if period.is_zero() {
      return;
    }
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      if connectivity.is_online() && dispatcher.queue().has_eligible() {
        debug!("Periodic flush");
        dispatcher.flush().await;
      }
    }
  })
}

/// Owned sync layer for one application session.
///
/// Construct one per session with [`SyncContext::builder`] and pass it to every read and
/// write call site. Dropping it stops the background tasks; queued mutations remain in
/// the queue store for the next session.
pub struct SyncContext {
  config: SyncConfig,
  cache: QueryCache,
  dispatcher: Dispatcher,
  connectivity: ConnectivityMonitor,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncContext {
  /// Start building a context. Defaults: [`SyncConfig::default`], no persistence, the
  /// system clock, initially online.
  pub fn builder(transport: Arc<dyn Transport>) -> SyncContextBuilder {
    SyncContextBuilder {
      config: SyncConfig::default(),
      transport,
      queue_store: Arc::new(NoopStore),
      entity_store: Arc::new(NoopStore),
      clock: Arc::new(SystemClock),
      initially_online: true,
    }
  }

  pub fn config(&self) -> &SyncConfig {
    &self.config
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn dispatcher(&self) -> &Dispatcher {
    &self.dispatcher
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }

  // Reads

  pub fn read<T, F, Fut>(&self, key: &QueryKey, fetch: F, options: ReadOptions) -> ReadState<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    self.cache.read(key, fetch, options)
  }

  pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, fetch: F, options: ReadOptions) -> ReadState<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    self.cache.fetch(key, fetch, options).await
  }

  pub fn observe(&self, key: &QueryKey) -> QueryObserver {
    self.cache.observe(key)
  }

  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    self.cache.invalidate(prefix)
  }

  pub fn set_data(&self, key: &QueryKey, value: Value) {
    self.cache.set_data(key, value)
  }

  /// Forget every cached read, persisted entries included.
  pub fn clear_cache(&self) {
    self.cache.clear()
  }

  // Writes

  pub fn mutate(
    &self,
    collection: impl Into<String>,
    operation: Operation,
    variables: Value,
    options: MutateOptions,
  ) -> MutationHandle {
    self.dispatcher.mutate(collection, operation, variables, options)
  }

  pub async fn flush(&self) -> FlushReport {
    self.dispatcher.flush().await
  }

  /// Pending and in-flight mutations.
  pub fn pending_count(&self) -> usize {
    self.dispatcher.queue().pending_count()
  }

  pub fn failed_mutations(&self) -> Vec<QueuedMutation> {
    self.dispatcher.queue().failed_mutations()
  }

  pub fn discard(&self, id: MutationId) -> Result<(), SyncError> {
    self.dispatcher.discard(id)
  }

  pub fn retry_failed(&self, id: MutationId) -> Result<(), SyncError> {
    self.dispatcher.retry(id)
  }

  /// Set when the persisted queue was unreadable at startup and had to be reset.
  pub fn queue_recovered_from(&self) -> Option<&SyncError> {
    self.dispatcher.queue().recovered_from()
  }

  // Connectivity

  /// Feed a raw connectivity observation. Published after the debounce period.
  pub fn set_online(&self, online: bool) {
    self.connectivity.report(online)
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Drive connectivity from a platform signal.
  pub fn follow_connectivity<S>(&self, signal: S)
  where
    S: Stream<Item = bool> + Send + 'static,
  {
    let handle = self.connectivity.follow(signal);
    self
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(handle);
  }

  /// End the session: stop background work and resolve outstanding handles with
  /// [`SyncError::Cancelled`]. Queued mutations stay in the queue store.
  pub fn shutdown(self) {
    self.stop_tasks();
    self.dispatcher.cancel_outstanding();
    let pending = self.pending_count();
    if pending > 0 {
      warn!(pending, "Session ended with unsent mutations");
    }
  }

  fn stop_tasks(&self) {
    let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    for task in tasks.drain(..) {
      task.abort();
    }
  }
}

impl Drop for SyncContext {
  fn drop(&mut self) {
    self.stop_tasks();
  }
}
