//! In-memory store, used for ephemeral sessions and tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::traits::{DurableStore, Namespace};

/// Store implementation that keeps namespaces in process memory.
///
/// Nothing survives a restart. Loads and saves can be made to fail on demand,
/// which is how quota or disk errors are simulated.
#[derive(Default)]
pub struct MemoryStore {
  data: Mutex<HashMap<Namespace, Vec<u8>>>,
  fail_saves: AtomicBool,
  fail_loads: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent `save` and `clear` fail (or succeed again).
  pub fn set_fail_saves(&self, fail: bool) {
    self.fail_saves.store(fail, Ordering::SeqCst);
  }

  /// Make every subsequent `load` fail (or succeed again).
  pub fn set_fail_loads(&self, fail: bool) {
    self.fail_loads.store(fail, Ordering::SeqCst);
  }

  fn check_writable(&self, namespace: Namespace) -> Result<()> {
    if self.fail_saves.load(Ordering::SeqCst) {
      return Err(eyre!("Simulated write failure for namespace {}", namespace));
    }
    Ok(())
  }
}

impl DurableStore for MemoryStore {
  fn load(&self, namespace: Namespace) -> Result<Option<Vec<u8>>> {
    if self.fail_loads.load(Ordering::SeqCst) {
      return Err(eyre!("Simulated read failure for namespace {}", namespace));
    }
    let data = self
      .data
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(data.get(&namespace).cloned())
  }

  fn save(&self, namespace: Namespace, bytes: &[u8]) -> Result<()> {
    self.check_writable(namespace)?;
    let mut data = self
      .data
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    data.insert(namespace, bytes.to_vec());
    Ok(())
  }

  fn clear(&self, namespace: Namespace) -> Result<()> {
    self.check_writable(namespace)?;
    let mut data = self
      .data
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    data.remove(&namespace);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_namespaces_are_independent() {
    let store = MemoryStore::new();
    store.save(Namespace::Cache, b"cache").unwrap();
    store.save(Namespace::Queue, b"queue").unwrap();

    store.clear(Namespace::Cache).unwrap();
    assert_eq!(store.load(Namespace::Cache).unwrap(), None);
    assert_eq!(store.load(Namespace::Queue).unwrap(), Some(b"queue".to_vec()));
  }

  #[test]
  fn test_failing_saves_keep_previous_contents() {
    let store = MemoryStore::new();
    store.save(Namespace::Queue, b"v1").unwrap();

    store.set_fail_saves(true);
    assert!(store.save(Namespace::Queue, b"v2").is_err());
    assert!(store.clear(Namespace::Queue).is_err());
    assert_eq!(store.load(Namespace::Queue).unwrap(), Some(b"v1".to_vec()));
  }

  #[test]
  fn test_failing_loads() {
    let store = MemoryStore::new();
    store.save(Namespace::Queue, b"v1").unwrap();
    store.set_fail_loads(true);
    assert!(store.load(Namespace::Queue).is_err());
    store.set_fail_loads(false);
    assert_eq!(store.load(Namespace::Queue).unwrap(), Some(b"v1".to_vec()));
  }
}
