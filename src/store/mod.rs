//! Durable persistence for the offline cache and the write queue.
//!
//! The store knows nothing about its contents: independent namespaces, each holding a
//! single opaque blob that is read whole at startup and overwritten whole on
//! every mutation. Encoding is the caller's business.

use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, warn};

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{DurableStore, Namespace};

/// Read a namespace and decode it as JSON.
///
/// Missing, unreadable or corrupted data all yield `T::default()`; the latter
/// two are logged since they mean earlier writes were lost.
pub(crate) fn load_json<T: DeserializeOwned + Default>(
  store: &dyn DurableStore,
  namespace: Namespace,
) -> T {
  match store.load(namespace) {
    Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
      Ok(value) => value,
      Err(e) => {
        warn!(%namespace, "Discarding corrupted persisted data: {}", e);
        T::default()
      }
    },
    Ok(None) => T::default(),
    Err(e) => {
      warn!(%namespace, "Failed to load persisted data: {}", e);
      T::default()
    }
  }
}

/// Encode a value as JSON and overwrite the namespace with it.
///
/// Failures are logged and swallowed: the in-memory copy stays authoritative
/// for the rest of the session, but a restart will see the previous contents.
pub(crate) fn save_json<T: Serialize + ?Sized>(
  store: &dyn DurableStore,
  namespace: Namespace,
  value: &T,
) -> bool {
  let result = serde_json::to_vec(value)
    .map_err(|e| color_eyre::eyre::eyre!("Failed to serialize {}: {}", namespace, e))
    .and_then(|bytes| store.save(namespace, &bytes));

  match result {
    Ok(()) => true,
    Err(e) => {
      error!(%namespace, "Failed to persist, in-memory state is ahead of disk: {}", e);
      false
    }
  }
}

/// Remove a namespace, logging instead of failing.
pub(crate) fn clear_namespace(store: &dyn DurableStore, namespace: Namespace) -> bool {
  match store.clear(namespace) {
    Ok(()) => true,
    Err(e) => {
      error!(%namespace, "Failed to clear persisted data: {}", e);
      false
    }
  }
}
