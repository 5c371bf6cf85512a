//! Process-wide sync status, derived from connectivity and queue depth.

use serde::Serialize;
use std::fmt;

/// The single observable sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  /// Online and nothing waiting
  Synced,
  /// Online with queued writes
  Pending,
  /// No link, regardless of queue depth
  Offline,
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Synced => "synced",
      Self::Pending => "pending",
      Self::Offline => "offline",
    };
    f.write_str(s)
  }
}

/// Derive the status from the two facts it depends on.
pub fn derive_status(online: bool, pending_writes: usize) -> SyncStatus {
  if !online {
    SyncStatus::Offline
  } else if pending_writes > 0 {
    SyncStatus::Pending
  } else {
    SyncStatus::Synced
  }
}

/// Everything a UI needs to render sync state.
///
/// `last_error` is a side channel shown alongside the status, not instead of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
  pub status: SyncStatus,
  pub online: bool,
  pub pending_writes: usize,
  pub last_error: Option<String>,
}

impl StatusSnapshot {
  pub fn new(online: bool, pending_writes: usize, last_error: Option<String>) -> Self {
    Self {
      status: derive_status(online, pending_writes),
      online,
      pending_writes,
      last_error,
    }
  }
}
