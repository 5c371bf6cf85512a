//! Periodic driver that drains the write queue while online.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::executor::Executor;
use crate::sync::{lock, DrainReport, OfflineStore};

struct Running {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

/// Retry scheduler bound to one [`OfflineStore`].
///
/// Holds nothing but the timer task handle. Starting twice is a no-op;
/// stopping lets an in-flight drain pass finish.
pub struct RetryScheduler {
  store: Arc<OfflineStore>,
  period: Duration,
  probe_each_tick: bool,
  running: Mutex<Option<Running>>,
}

impl RetryScheduler {
  pub fn new(store: Arc<OfflineStore>, period: Duration) -> Self {
    Self {
      store,
      period,
      probe_each_tick: false,
      running: Mutex::new(None),
    }
  }

  /// Refresh the link signal from the reachability probe before every tick.
  ///
  /// For hosts with no platform online/offline events to feed the store.
  pub fn with_reachability_probe(mut self, enabled: bool) -> Self {
    self.probe_each_tick = enabled;
    self
  }

  /// Start the timer. Returns false if it was already running.
  ///
  /// The first tick fires one period after start.
  pub fn start(&self, executor: Arc<dyn Executor>) -> bool {
    let mut running = lock(&self.running);
    if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
      debug!("Retry scheduler already running");
      return false;
    }

    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let store = Arc::clone(&self.store);
    let period = self.period;
    let probe_each_tick = self.probe_each_tick;

    let task = tokio::spawn(async move {
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if probe_each_tick {
              store.refresh_connectivity().await;
            }
            drain_if_due(&store, executor.as_ref()).await;
          }
          _ = shutdown_rx.changed() => break,
        }
      }

      debug!("Retry scheduler loop exited");
    });

    info!(period_ms = period.as_millis() as u64, "Retry scheduler started");
    *running = Some(Running { shutdown, task });
    true
  }

  /// Stop the timer, waiting for an in-flight drain pass to finish.
  pub async fn stop(&self) {
    let running = lock(&self.running).take();
    let Some(Running { shutdown, task }) = running else {
      return;
    };

    let _ = shutdown.send(true);
    if let Err(e) = task.await {
      error!("Retry scheduler task failed: {}", e);
    }
    info!("Retry scheduler stopped");
  }

  pub fn is_running(&self) -> bool {
    lock(&self.running)
      .as_ref()
      .is_some_and(|r| !r.task.is_finished())
  }

  /// Run one tick now, outside the timer: drain if believed online and
  /// there is work.
  pub async fn tick(&self, executor: &dyn Executor) -> Option<DrainReport> {
    drain_if_due(&self.store, executor).await
  }
}

async fn drain_if_due(store: &OfflineStore, executor: &dyn Executor) -> Option<DrainReport> {
  if !store.is_online() || store.pending_writes() == 0 {
    return None;
  }
  Some(store.process_queue(executor).await)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::ConnectivityMonitor;
  use crate::executor::fakes::RecordingExecutor;
  use crate::status::SyncStatus;
  use crate::store::MemoryStore;
  use crate::sync::StoreSettings;
  use color_eyre::Result;
  use futures::future::BoxFuture;
  use serde_json::{json, Value};
  use url::Url;

  const PERIOD: Duration = Duration::from_millis(30_000);

  fn new_store(online: bool) -> Arc<OfflineStore> {
    let monitor = ConnectivityMonitor::with_client(
      reqwest::Client::new(),
      Url::parse("http://127.0.0.1:9/").unwrap(),
      Duration::from_secs(1),
      online,
    );
    Arc::new(OfflineStore::new(
      Arc::new(MemoryStore::new()),
      monitor,
      StoreSettings::default(),
    ))
  }

  async fn wait_until(store: &OfflineStore, done: impl Fn(&OfflineStore) -> bool) {
    let mut rx = store.subscribe();
    while !done(store) {
      rx.changed().await.unwrap();
    }
  }

  #[tokio::test]
  async fn test_tick_requires_link_and_work() {
    let store = new_store(false);
    let scheduler = RetryScheduler::new(store.clone(), PERIOD);
    let executor = RecordingExecutor::default();
    assert!(scheduler.tick(&executor).await.is_none());

    store.set_online(true);
    assert!(scheduler.tick(&executor).await.is_none());

    store.enqueue_write("saveChain", vec![]);
    let report = scheduler.tick(&executor).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(!scheduler.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_start_is_idempotent() {
    let scheduler = RetryScheduler::new(new_store(true), PERIOD);
    let executor = Arc::new(RecordingExecutor::default());

    assert!(scheduler.start(executor.clone()));
    assert!(!scheduler.start(executor.clone()));
    assert!(scheduler.is_running());

    scheduler.stop().await;
    assert!(!scheduler.is_running());
    assert!(scheduler.start(executor));
    scheduler.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_drains_backlog_on_next_tick() {
    let store = new_store(false);
    for action in ["first", "second", "third"] {
      store.enqueue_write(action, vec![json!(action)]);
    }
    assert_eq!(store.snapshot().status, SyncStatus::Offline);
    assert_eq!(store.snapshot().pending_writes, 3);

    let executor = Arc::new(RecordingExecutor::default());
    let scheduler = RetryScheduler::new(store.clone(), PERIOD);
    scheduler.start(executor.clone());

    // Offline ticks do nothing
    tokio::time::sleep(PERIOD * 2 + Duration::from_millis(1)).await;
    assert!(executor.calls().is_empty());

    store.set_online(true);
    wait_until(&store, |s| s.pending_writes() == 0).await;

    assert_eq!(executor.calls(), vec!["first", "second", "third"]);
    assert_eq!(store.snapshot().status, SyncStatus::Synced);
    scheduler.stop().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_persistent_failure_is_dropped_after_five_ticks() {
    let store = new_store(true);
    for action in ["first", "second", "third"] {
      store.enqueue_write(action, vec![]);
    }

    let executor = Arc::new(RecordingExecutor::failing(&["second"]));
    let scheduler = RetryScheduler::new(store.clone(), PERIOD);
    let started = Instant::now();
    scheduler.start(executor.clone());

    wait_until(&store, |s| s.pending_writes() == 0).await;

    let calls = executor.calls();
    assert_eq!(&calls[..3], &["first", "second", "third"]);
    assert_eq!(calls.iter().filter(|c| *c == "second").count(), 5);
    assert_eq!(calls.len(), 7);
    assert!(started.elapsed() >= PERIOD * 5);

    let snapshot = store.snapshot();
    assert_eq!(snapshot.status, SyncStatus::Synced);
    assert!(snapshot.last_error.is_some());
    scheduler.stop().await;
  }

  struct SlowExecutor {
    delay: Duration,
    inner: RecordingExecutor,
  }

  impl Executor for SlowExecutor {
    fn execute<'a>(&'a self, action: &'a str, args: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
      Box::pin(async move {
        tokio::time::sleep(self.delay).await;
        self.inner.execute(action, args).await
      })
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_lets_in_flight_pass_finish() {
    let store = new_store(true);
    store.enqueue_write("publish", vec![]);

    let executor = Arc::new(SlowExecutor {
      delay: Duration::from_secs(5),
      inner: RecordingExecutor::default(),
    });
    let scheduler = RetryScheduler::new(store.clone(), PERIOD);
    scheduler.start(executor.clone());

    // First tick at 30s; the executor is still working at 31s
    tokio::time::sleep(PERIOD + Duration::from_secs(1)).await;
    assert!(executor.inner.calls().is_empty());

    scheduler.stop().await;
    assert_eq!(executor.inner.calls(), vec!["publish"]);
    assert_eq!(store.pending_writes(), 0);
    assert!(!scheduler.is_running());
  }
}
