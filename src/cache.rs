//! Bounded cache of chain payloads with oldest-write-first eviction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{self, DurableStore, Namespace};

/// Default upper bound on cached entries.
pub const MAX_CACHE_ENTRIES: usize = 100;

/// Per-entry sync hint.
///
/// Entries written through [`ChainCache::upsert`] are always `Synced`; the
/// other variants exist so persisted data from richer writers still decodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySyncStatus {
  #[default]
  Synced,
  Pending,
  Conflict,
  Offline,
  Error,
}

/// A locally held copy of a remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub key: String,
  /// Opaque payload, never inspected
  pub payload: Value,
  /// Write time, used only for eviction ordering
  pub cached_at: DateTime<Utc>,
  #[serde(default)]
  pub sync_status: EntrySyncStatus,
}

/// Key to entry map persisted to the `cache` namespace.
///
/// Recency is by write time only: reads never refresh an entry.
pub struct ChainCache {
  store: Arc<dyn DurableStore>,
  entries: HashMap<String, CacheEntry>,
  max_entries: usize,
}

impl ChainCache {
  /// Load the cache from the store.
  ///
  /// Entries that fail to decode are skipped; an unreadable blob starts an
  /// empty cache.
  pub fn load(store: Arc<dyn DurableStore>, max_entries: usize) -> Self {
    let raw: HashMap<String, Value> = store::load_json(store.as_ref(), Namespace::Cache);
    let entries = raw
      .into_iter()
      .filter_map(|(key, value)| match serde_json::from_value::<CacheEntry>(value) {
        Ok(entry) => Some((key, entry)),
        Err(e) => {
          warn!(%key, "Skipping undecodable cache entry: {}", e);
          None
        }
      })
      .collect();
    let mut cache = Self {
      store,
      entries,
      max_entries,
    };

    // The bound may have shrunk since the cache was written
    if !cache.evict_overflow(None).is_empty() {
      cache.persist();
    }

    cache
  }

  /// Insert or replace the entry for `key`, evict if over the bound, persist.
  ///
  /// Returns the keys that were evicted.
  pub fn upsert(&mut self, key: &str, payload: Value) -> Vec<String> {
    let entry = CacheEntry {
      key: key.to_string(),
      payload,
      cached_at: Utc::now(),
      sync_status: EntrySyncStatus::Synced,
    };
    self.entries.insert(key.to_string(), entry);

    let evicted = self.evict_overflow(Some(key));
    self.persist();
    evicted
  }

  pub fn get(&self, key: &str) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  /// Snapshot of all entries, in no particular order.
  pub fn entries(&self) -> Vec<CacheEntry> {
    self.entries.values().cloned().collect()
  }

  /// Remove the entry for `key`. Returns whether anything was removed.
  pub fn remove(&mut self, key: &str) -> bool {
    if self.entries.remove(key).is_none() {
      return false;
    }
    self.persist();
    true
  }

  /// Drop every entry and the persisted namespace.
  pub fn clear(&mut self) {
    self.entries.clear();
    store::clear_namespace(self.store.as_ref(), Namespace::Cache);
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Evict oldest-`cached_at`-first until the bound holds.
  ///
  /// `newest` wins timestamp ties so a fresh write is never its own victim.
  fn evict_overflow(&mut self, newest: Option<&str>) -> Vec<String> {
    if self.entries.len() <= self.max_entries {
      return Vec::new();
    }

    let mut by_age: Vec<(DateTime<Utc>, bool, String)> = self
      .entries
      .values()
      .map(|e| (e.cached_at, Some(e.key.as_str()) == newest, e.key.clone()))
      .collect();
    by_age.sort();

    let excess = self.entries.len() - self.max_entries;
    let evicted: Vec<String> = by_age
      .into_iter()
      .take(excess)
      .map(|(_, _, key)| key)
      .collect();

    for key in &evicted {
      self.entries.remove(key);
      debug!(key = %key, "Evicted cache entry");
    }

    evicted
  }

  fn persist(&self) {
    store::save_json(self.store.as_ref(), Namespace::Cache, &self.entries);
  }
}
