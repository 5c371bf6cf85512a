//! The offline store: chain cache, write queue and connectivity behind one
//! context object.
//!
//! Construct one per process and share it (usually behind an `Arc`). Every
//! public operation is infallible from the caller's point of view: storage
//! failures are logged and the in-memory state stays authoritative, executor
//! failures end up in the queue's retry bookkeeping and in `last_error`.

use color_eyre::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, ChainCache, MAX_CACHE_ENTRIES};
use crate::config::{Config, ITEM_TIMEOUT_MS};
use crate::connectivity::ConnectivityMonitor;
use crate::executor::Executor;
use crate::queue::{DrainOutcome, QueuedWrite, WriteQueue, MAX_RETRIES};
use crate::status::StatusSnapshot;
use crate::store::{DurableStore, SqliteStore};

/// Tunables for an [`OfflineStore`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
  pub max_cache_entries: usize,
  pub max_retries: u32,
  /// Upper bound on one executor call during a drain
  pub item_timeout: Duration,
}

impl Default for StoreSettings {
  fn default() -> Self {
    Self {
      max_cache_entries: MAX_CACHE_ENTRIES,
      max_retries: MAX_RETRIES,
      item_timeout: Duration::from_millis(ITEM_TIMEOUT_MS),
    }
  }
}

impl StoreSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      max_cache_entries: config.cache.max_entries,
      max_retries: config.queue.max_retries,
      item_timeout: config.queue.item_timeout(),
    }
  }
}

/// Why a drain pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  Offline,
  EmptyQueue,
  /// Another pass was already running
  InFlight,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub retried: usize,
  pub dropped: usize,
  pub skipped: Option<SkipReason>,
}

impl DrainReport {
  fn skipped(reason: SkipReason) -> Self {
    Self {
      skipped: Some(reason),
      ..Self::default()
    }
  }
}

/// Clears the in-flight flag when a drain pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Offline-first cache and durable write queue.
pub struct OfflineStore {
  cache: Mutex<ChainCache>,
  queue: Mutex<WriteQueue>,
  connectivity: ConnectivityMonitor,
  last_error: Mutex<Option<String>>,
  /// Set while a drain pass runs. Compare-and-swap, so two tasks on
  /// different threads can never both pass the guard.
  draining: AtomicBool,
  status: watch::Sender<StatusSnapshot>,
  settings: StoreSettings,
}

impl OfflineStore {
  /// Load cache and queue from `store` and start tracking status.
  pub fn new(
    store: Arc<dyn DurableStore>,
    connectivity: ConnectivityMonitor,
    settings: StoreSettings,
  ) -> Self {
    let cache = ChainCache::load(store.clone(), settings.max_cache_entries);
    let queue = WriteQueue::load(store);
    info!(
      cached = cache.len(),
      pending = queue.len(),
      "Loaded offline store"
    );

    let initial = StatusSnapshot::new(connectivity.is_online(), queue.len(), None);
    let (status, _) = watch::channel(initial);

    Self {
      cache: Mutex::new(cache),
      queue: Mutex::new(queue),
      connectivity,
      last_error: Mutex::new(None),
      draining: AtomicBool::new(false),
      status,
      settings,
    }
  }

  /// Open the SQLite-backed store described by `config`.
  ///
  /// The link starts out believed online; call [`Self::refresh_connectivity`]
  /// to replace that guess with a probe result.
  pub fn open(config: &Config) -> Result<Self> {
    let store = SqliteStore::open(&config.store_path()?)?;
    let connectivity = ConnectivityMonitor::new(&config.connectivity, true)?;
    Ok(Self::new(
      Arc::new(store),
      connectivity,
      StoreSettings::from_config(config),
    ))
  }

  // ==========================================================================
  // Chain cache
  // ==========================================================================

  /// Insert or replace the cached copy of a chain.
  pub fn cache_chain(&self, key: &str, payload: Value) {
    let evicted = lock(&self.cache).upsert(key, payload);
    if !evicted.is_empty() {
      debug!(count = evicted.len(), "Cache over capacity, evicted oldest entries");
    }
    self.recompute_status();
  }

  pub fn get_cached_chain(&self, key: &str) -> Option<CacheEntry> {
    lock(&self.cache).get(key).cloned()
  }

  /// All cached entries. Order is unspecified.
  pub fn get_all_cached_chains(&self) -> Vec<CacheEntry> {
    lock(&self.cache).entries()
  }

  pub fn remove_cached_chain(&self, key: &str) {
    if lock(&self.cache).remove(key) {
      self.recompute_status();
    }
  }

  pub fn clear_cache(&self) {
    lock(&self.cache).clear();
    self.recompute_status();
  }

  // ==========================================================================
  // Write queue
  // ==========================================================================

  /// Queue a mutation for the next drain. Returns the write's id.
  pub fn enqueue_write(&self, action: &str, args: Vec<Value>) -> String {
    let write = lock(&self.queue).push(action, args);
    debug!(id = %write.id, action, "Queued write");
    self.recompute_status();
    write.id
  }

  /// Cancel a pending write. Returns whether it was still queued.
  pub fn remove_from_queue(&self, id: &str) -> bool {
    let removed = lock(&self.queue).remove(id);
    if removed {
      debug!(id, "Removed queued write");
    }
    self.recompute_status();
    removed
  }

  pub fn clear_queue(&self) {
    lock(&self.queue).clear();
    self.recompute_status();
  }

  /// Pending writes in FIFO order.
  pub fn queued_writes(&self) -> Vec<QueuedWrite> {
    lock(&self.queue).items().to_vec()
  }

  pub fn pending_writes(&self) -> usize {
    lock(&self.queue).len()
  }

  /// Run one drain pass: execute every queued write in FIFO order.
  ///
  /// A no-op when offline, when the queue is empty, or when another pass is
  /// in flight. Writes that fail are carried into the next generation with
  /// their retry count bumped; a write that reaches the retry limit is
  /// dropped and reported through `last_error`.
  ///
  /// Let a started pass run to completion: dropping the future mid-pass
  /// forgets the outcomes of items already executed, so the next pass
  /// applies them again.
  pub async fn process_queue(&self, executor: &dyn Executor) -> DrainReport {
    if !self.connectivity.is_online() {
      return DrainReport::skipped(SkipReason::Offline);
    }
    let empty = lock(&self.queue).is_empty();
    if empty {
      return DrainReport::skipped(SkipReason::EmptyQueue);
    }
    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("Drain already in flight, skipping");
      return DrainReport::skipped(SkipReason::InFlight);
    }

    let report = {
      let _guard = DrainGuard(&self.draining);
      self.drain_pass(executor).await
    };

    info!(
      attempted = report.attempted,
      succeeded = report.succeeded,
      retried = report.retried,
      dropped = report.dropped,
      "Drain pass finished"
    );
    self.recompute_status();
    report
  }

  async fn drain_pass(&self, executor: &dyn Executor) -> DrainReport {
    let batch = lock(&self.queue).items().to_vec();
    let mut outcomes = HashMap::with_capacity(batch.len());
    let mut report = DrainReport::default();

    for mut item in batch {
      report.attempted += 1;

      let call = executor.execute_write(&item);
      let result = match tokio::time::timeout(self.settings.item_timeout, call).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!(
          "timed out after {}ms",
          self.settings.item_timeout.as_millis()
        )),
      };

      let outcome = match result {
        Ok(_) => {
          debug!(id = %item.id, action = %item.action, "Applied queued write");
          report.succeeded += 1;
          DrainOutcome::Applied
        }
        Err(message) => {
          item.retries += 1;
          if item.retries >= self.settings.max_retries {
            error!(
              id = %item.id,
              action = %item.action,
              retries = item.retries,
              "Dropping queued write: {}",
              message
            );
            *lock(&self.last_error) = Some(format!(
              "Dropped {} after {} attempts: {}",
              item.action, item.retries, message
            ));
            report.dropped += 1;
            DrainOutcome::Dropped
          } else {
            warn!(
              id = %item.id,
              action = %item.action,
              "Queued write retry {}/{}: {}",
              item.retries,
              self.settings.max_retries,
              message
            );
            item.last_error = Some(message);
            report.retried += 1;
            DrainOutcome::Retry(item.clone())
          }
        }
      };
      outcomes.insert(item.id, outcome);
    }

    lock(&self.queue).apply_drain(outcomes);
    report
  }

  // ==========================================================================
  // Connectivity and status
  // ==========================================================================

  /// Current link signal.
  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Feed a link transition (online/offline event).
  pub fn set_online(&self, online: bool) {
    if self.connectivity.set_link(online) {
      self.recompute_status();
    }
  }

  /// Probe the reachability endpoint. Always false while the link is down.
  pub async fn check_connectivity(&self) -> bool {
    self.connectivity.check_connectivity().await
  }

  /// Probe the endpoint and take the result as the new link signal.
  pub async fn refresh_connectivity(&self) -> bool {
    let reachable = self.connectivity.probe().await;
    self.set_online(reachable);
    reachable
  }

  /// Message of the most recent dropped write, if any.
  pub fn last_error(&self) -> Option<String> {
    lock(&self.last_error).clone()
  }

  /// Dismiss the last error.
  pub fn clear_error(&self) {
    *lock(&self.last_error) = None;
    self.recompute_status();
  }

  pub fn snapshot(&self) -> StatusSnapshot {
    self.status.borrow().clone()
  }

  /// Subscribe to status changes.
  pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
    self.status.subscribe()
  }

  fn recompute_status(&self) {
    // One lock at a time
    let online = self.connectivity.is_online();
    let pending = lock(&self.queue).len();
    let last_error = lock(&self.last_error).clone();
    let snapshot = StatusSnapshot::new(online, pending, last_error);
    self.status.send_if_modified(|current| {
      if *current == snapshot {
        return false;
      }
      *current = snapshot;
      true
    });
  }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section here leaves the data consistent before any call
/// that could panic, so poisoning carries no information.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
