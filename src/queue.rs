//! Ordered backlog of writes that have not been confirmed remotely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::store::{self, DurableStore, Namespace};

/// Default number of failed attempts after which a write is dropped.
pub const MAX_RETRIES: u32 = 5;

/// A durable record of a mutation awaiting remote application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedWrite {
  /// Time-ordered unique id (UUIDv7). Used for removal and as the
  /// idempotency key, never for ordering.
  pub id: String,
  /// Name of the remote operation
  pub action: String,
  /// Positional arguments for the operation
  pub args: Vec<Value>,
  pub queued_at: DateTime<Utc>,
  /// Failed drain attempts so far
  #[serde(default)]
  pub retries: u32,
  /// Most recent failure description
  #[serde(default)]
  pub last_error: Option<String>,
}

impl QueuedWrite {
  pub fn new(action: impl Into<String>, args: Vec<Value>) -> Self {
    Self {
      id: Uuid::now_v7().to_string(),
      action: action.into(),
      args,
      queued_at: Utc::now(),
      retries: 0,
      last_error: None,
    }
  }
}

/// What a drain pass decided for one visited item.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
  /// Executed successfully, leaves the queue
  Applied,
  /// Failed but has retries left; carried forward in its updated form
  Retry(QueuedWrite),
  /// Failed for the last time, leaves the queue
  Dropped,
}

/// FIFO queue persisted to the `queue` namespace.
pub struct WriteQueue {
  store: Arc<dyn DurableStore>,
  items: Vec<QueuedWrite>,
  /// False while the persisted backlog is unread or its rejects could not be
  /// set aside; saving then would overwrite the only copy.
  writable: bool,
}

impl WriteQueue {
  /// Load the queue from the store.
  ///
  /// Records are decoded one by one: valid writes are kept and anything that
  /// fails to decode is moved to the `queue_rejects` namespace. If the store
  /// cannot be read at all, the queue starts empty and refuses to persist
  /// until it is cleared, so the stored backlog is never clobbered.
  pub fn load(store: Arc<dyn DurableStore>) -> Self {
    let (items, writable) = match store.load(Namespace::Queue) {
      Ok(Some(bytes)) => decode_records(store.as_ref(), &bytes),
      Ok(None) => (Vec::new(), true),
      Err(e) => {
        error!("Failed to load write queue, leaving stored backlog untouched: {}", e);
        (Vec::new(), false)
      }
    };
    Self {
      store,
      items,
      writable,
    }
  }

  /// Append a new write to the back of the queue and persist.
  pub fn push(&mut self, action: &str, args: Vec<Value>) -> QueuedWrite {
    let write = QueuedWrite::new(action, args);
    self.items.push(write.clone());
    self.persist();
    write
  }

  /// Remove a write by id. Returns whether anything was removed.
  pub fn remove(&mut self, id: &str) -> bool {
    let before = self.items.len();
    self.items.retain(|item| item.id != id);
    if self.items.len() == before {
      return false;
    }
    self.persist();
    true
  }

  /// Drop every write and the persisted namespace.
  pub fn clear(&mut self) {
    self.items.clear();
    if store::clear_namespace(self.store.as_ref(), Namespace::Queue) {
      self.writable = true;
    }
  }

  /// Current items in FIFO order.
  pub fn items(&self) -> &[QueuedWrite] {
    &self.items
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Replace the queue with the next generation after a drain pass.
  ///
  /// Items the pass visited are removed or updated according to their
  /// outcome. Items it never saw (enqueued while it ran) keep their place
  /// behind the carried-forward ones, and items removed while it ran stay
  /// removed.
  pub fn apply_drain(&mut self, mut outcomes: HashMap<String, DrainOutcome>) {
    let current = std::mem::take(&mut self.items);
    self.items = current
      .into_iter()
      .filter_map(|item| match outcomes.remove(&item.id) {
        None => Some(item),
        Some(DrainOutcome::Retry(updated)) => Some(updated),
        Some(DrainOutcome::Applied) | Some(DrainOutcome::Dropped) => None,
      })
      .collect();
    self.persist();
  }

  fn persist(&self) {
    if !self.writable {
      error!(
        pending = self.items.len(),
        "Write queue not persisted: stored backlog was never read"
      );
      return;
    }
    store::save_json(self.store.as_ref(), Namespace::Queue, &self.items);
  }
}

/// Decode a persisted queue blob record by record. The flag is false when
/// rejected data could not be set aside.
fn decode_records(store: &dyn DurableStore, bytes: &[u8]) -> (Vec<QueuedWrite>, bool) {
  let records: Vec<Value> = match serde_json::from_slice(bytes) {
    Ok(records) => records,
    Err(e) => {
      error!("Persisted write queue is not a record list: {}", e);
      let raw = Value::String(String::from_utf8_lossy(bytes).into_owned());
      return (Vec::new(), set_aside(store, vec![raw]));
    }
  };

  let mut items = Vec::with_capacity(records.len());
  let mut rejects = Vec::new();
  for (index, record) in records.into_iter().enumerate() {
    match serde_json::from_value::<QueuedWrite>(record.clone()) {
      Ok(write) => items.push(write),
      Err(e) => {
        error!(index, "Skipping undecodable queued write: {}", e);
        rejects.push(record);
      }
    }
  }

  if rejects.is_empty() {
    return (items, true);
  }
  (items, set_aside(store, rejects))
}

/// Append rejected records to the `queue_rejects` namespace.
fn set_aside(store: &dyn DurableStore, mut rejects: Vec<Value>) -> bool {
  let mut kept: Vec<Value> = store::load_json(store, Namespace::QueueRejects);
  kept.append(&mut rejects);
  store::save_json(store, Namespace::QueueRejects, &kept)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use serde_json::json;

  fn new_queue() -> (Arc<MemoryStore>, WriteQueue) {
    let store = Arc::new(MemoryStore::new());
    let queue = WriteQueue::load(store.clone());
    (store, queue)
  }

  #[test]
  fn test_push_preserves_insertion_order() {
    let (_, mut queue) = new_queue();
    for action in ["create", "update", "delete"] {
      queue.push(action, vec![json!("chain-1")]);
    }

    let actions: Vec<&str> = queue.items().iter().map(|w| w.action.as_str()).collect();
    assert_eq!(actions, vec!["create", "update", "delete"]);
    assert!(queue.items().iter().all(|w| w.retries == 0));
  }

  #[test]
  fn test_ids_are_unique() {
    let (_, mut queue) = new_queue();
    let a = queue.push("x", vec![]);
    let b = queue.push("x", vec![]);
    assert_ne!(a.id, b.id);
  }

  #[test]
  fn test_remove_by_id() {
    let (_, mut queue) = new_queue();
    let a = queue.push("a", vec![]);
    queue.push("b", vec![]);

    assert!(queue.remove(&a.id));
    assert!(!queue.remove(&a.id));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.items()[0].action, "b");
  }

  #[test]
  fn test_queue_survives_reload() {
    let (store, mut queue) = new_queue();
    queue.push("save", vec![json!({"slug": "warm-vox"}), json!(3)]);

    let reloaded = WriteQueue::load(store);
    assert_eq!(reloaded.items(), queue.items());
  }

  #[test]
  fn test_apply_drain_reconciles_concurrent_changes() {
    let (store, mut queue) = new_queue();
    let applied = queue.push("a", vec![]);
    let retried = queue.push("b", vec![]);
    let dropped = queue.push("c", vec![]);
    let removed = queue.push("d", vec![]);

    // While the pass runs, "d" is cancelled and "e" is enqueued
    queue.remove(&removed.id);
    let late = queue.push("e", vec![]);

    let mut updated = retried.clone();
    updated.retries = 1;
    updated.last_error = Some("boom".to_string());

    let mut outcomes = HashMap::new();
    outcomes.insert(applied.id.clone(), DrainOutcome::Applied);
    outcomes.insert(retried.id.clone(), DrainOutcome::Retry(updated.clone()));
    outcomes.insert(dropped.id.clone(), DrainOutcome::Dropped);
    outcomes.insert(removed.id.clone(), DrainOutcome::Retry(removed.clone()));
    queue.apply_drain(outcomes);

    assert_eq!(queue.items(), &[updated, late][..]);
    assert_eq!(WriteQueue::load(store).items(), queue.items());
  }

  #[test]
  fn test_clear_removes_namespace() {
    let (store, mut queue) = new_queue();
    queue.push("a", vec![]);
    queue.clear();
    assert!(queue.is_empty());
    assert_eq!(store.load(Namespace::Queue).unwrap(), None);
  }

  fn persisted_actions(store: &MemoryStore) -> Vec<String> {
    let bytes = store.load(Namespace::Queue).unwrap().unwrap();
    let items: Vec<QueuedWrite> = serde_json::from_slice(&bytes).unwrap();
    items.into_iter().map(|w| w.action).collect()
  }

  #[test]
  fn test_undecodable_record_does_not_discard_backlog() {
    let store = Arc::new(MemoryStore::new());
    let a = serde_json::to_value(QueuedWrite::new("a", vec![json!(1)])).unwrap();
    let b = serde_json::to_value(QueuedWrite::new("b", vec![])).unwrap();
    let broken = json!({"id": "x", "action": "c", "args": []});
    let blob = serde_json::to_vec(&json!([a, broken.clone(), b])).unwrap();
    store.save(Namespace::Queue, &blob).unwrap();

    let mut queue = WriteQueue::load(store.clone());
    let actions: Vec<&str> = queue.items().iter().map(|w| w.action.as_str()).collect();
    assert_eq!(actions, vec!["a", "b"]);

    queue.push("d", vec![]);
    assert_eq!(persisted_actions(&store), vec!["a", "b", "d"]);

    let rejects = store.load(Namespace::QueueRejects).unwrap().unwrap();
    let rejects: Vec<Value> = serde_json::from_slice(&rejects).unwrap();
    assert_eq!(rejects, vec![broken]);
  }

  #[test]
  fn test_garbage_blob_is_set_aside() {
    let store = Arc::new(MemoryStore::new());
    store.save(Namespace::Queue, b"{not json").unwrap();

    let mut queue = WriteQueue::load(store.clone());
    assert!(queue.is_empty());
    queue.push("a", vec![]);
    assert_eq!(persisted_actions(&store), vec!["a"]);

    let rejects = store.load(Namespace::QueueRejects).unwrap().unwrap();
    let rejects: Vec<Value> = serde_json::from_slice(&rejects).unwrap();
    assert_eq!(rejects, vec![json!("{not json")]);
  }

  #[test]
  fn test_read_failure_never_overwrites_backlog() {
    let store = Arc::new(MemoryStore::new());
    let original = serde_json::to_vec(&vec![QueuedWrite::new("a", vec![])]).unwrap();
    store.save(Namespace::Queue, &original).unwrap();

    store.set_fail_loads(true);
    let mut queue = WriteQueue::load(store.clone());
    store.set_fail_loads(false);
    assert!(queue.is_empty());

    queue.push("b", vec![]);
    assert_eq!(store.load(Namespace::Queue).unwrap(), Some(original));

    // An explicit clear is the way out
    queue.clear();
    queue.push("c", vec![]);
    assert_eq!(persisted_actions(&store), vec!["c"]);
  }

  #[test]
  fn test_unwritable_rejects_keep_backlog_intact() {
    let store = Arc::new(MemoryStore::new());
    let blob = br#"[{"id": "x"}]"#.to_vec();
    store.save(Namespace::Queue, &blob).unwrap();

    store.set_fail_saves(true);
    let mut queue = WriteQueue::load(store.clone());
    store.set_fail_saves(false);

    queue.push("a", vec![]);
    assert_eq!(store.load(Namespace::Queue).unwrap(), Some(blob));
  }
}
