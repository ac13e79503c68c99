//! Debounced online/offline state.
//!
//! Raw signals arrive through [`ConnectivityMonitor::report`], a followed stream or the
//! reachability probe. A change is published only after the raw signal has been quiet for
//! the configured period, and only when the settled state differs from the last one
//! published, so flapping links collapse into at most one transition.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

impl Connectivity {
  pub fn from_online(online: bool) -> Self {
    if online {
      Connectivity::Online
    } else {
      Connectivity::Offline
    }
  }

  pub fn is_online(self) -> bool {
    self == Connectivity::Online
  }
}

struct Inner {
  raw: watch::Sender<bool>,
  settled: watch::Sender<Connectivity>,
  quiet_period: Duration,
}

/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool, quiet_period: Duration) -> Self {
    let (raw, _) = watch::channel(initially_online);
    let (settled, _) = watch::channel(Connectivity::from_online(initially_online));
    Self {
      inner: Arc::new(Inner {
        raw,
        settled,
        quiet_period,
      }),
    }
  }

  /// Start the debouncer. Raw reports are not published until this runs.
  pub fn start(&self) -> JoinHandle<()> {
    let inner = Arc::clone(&self.inner);
    let raw = inner.raw.subscribe();
    tokio::spawn(debounce(inner, raw))
  }

  /// Feed a raw online/offline observation.
  pub fn report(&self, online: bool) {
    self.inner.raw.send_if_modified(|current| {
      let changed = *current != online;
      *current = online;
      changed
    });
  }

  /// Forward every value of `signal` to [`report`](Self::report).
  pub fn follow<S>(&self, signal: S) -> JoinHandle<()>
  where
    S: Stream<Item = bool> + Send + 'static,
  {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut signal = Box::pin(signal);
      while let Some(online) = signal.next().await {
        monitor.report(online);
      }
    })
  }

  /// Ping the backend every `interval` and report whether it answered.
  pub fn spawn_probe(&self, transport: Arc<dyn Transport>, interval: Duration) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let reachable = transport.ping().await;
        if let Err(e) = &reachable {
          debug!(error = %e, "Connectivity probe failed");
        }
        monitor.report(reachable.is_ok());
      }
    })
  }

  /// Settled state.
  pub fn current(&self) -> Connectivity {
    *self.inner.settled.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current().is_online()
  }

  /// Receiver of settled transitions.
  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.inner.settled.subscribe()
  }
}

async fn debounce(inner: Arc<Inner>, mut raw: watch::Receiver<bool>) {
  loop {
    if raw.changed().await.is_err() {
      return;
    }

    // Restart the quiet period on every further change.
    loop {
      match tokio::time::timeout(inner.quiet_period, raw.changed()).await {
        Ok(Ok(())) => continue,
        Ok(Err(_)) => return,
        Err(_) => break,
      }
    }

    let state = Connectivity::from_online(*raw.borrow_and_update());
    let published = inner.settled.send_if_modified(|current| {
      let changed = *current != state;
      *current = state;
      changed
    });
    if published {
      info!(?state, "Connectivity changed");
    }
  }
}
