//! Durable store trait and namespace definitions.

use color_eyre::Result;
use std::fmt;

/// The independent key spaces persisted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
  /// Cached chain entries
  Cache,
  /// Pending queued writes
  Queue,
  /// Queue records that could not be decoded, kept for inspection
  QueueRejects,
}

impl Namespace {
  /// Stable storage name for this namespace.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Cache => "cache",
      Self::Queue => "queue",
      Self::QueueRejects => "queue_rejects",
    }
  }
}

impl fmt::Display for Namespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Trait for durable store backends.
///
/// Implementations must tolerate being called from async code; every call is
/// expected to be short (a single row read or write).
pub trait DurableStore: Send + Sync {
  /// Read the full contents of a namespace, or `None` if it was never saved.
  fn load(&self, namespace: Namespace) -> Result<Option<Vec<u8>>>;

  /// Overwrite the full contents of a namespace.
  fn save(&self, namespace: Namespace, data: &[u8]) -> Result<()>;

  /// Remove a namespace entirely. Clearing an absent namespace is not an error.
  fn clear(&self, namespace: Namespace) -> Result<()>;
}
