//! SQLite-backed durable store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{DurableStore, Namespace};

/// SQLite-based durable store implementation.
///
/// Each namespace is one row; a save replaces the row in a single statement,
/// so a crash mid-save leaves either the old or the new blob, never a mix.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn)
  }

  /// Get the default store path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("chainsync").join("store.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Run database migrations for the namespace table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the store table.
const STORE_SCHEMA: &str = r#"
-- One serialized blob per namespace
CREATE TABLE IF NOT EXISTS namespaces (
    namespace TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStore for SqliteStore {
  fn load(&self, namespace: Namespace) -> Result<Option<Vec<u8>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM namespaces WHERE namespace = ?",
        params![namespace.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load namespace {}: {}", namespace, e))
  }

  fn save(&self, namespace: Namespace, data: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO namespaces (namespace, data, saved_at)
         VALUES (?, ?, datetime('now'))",
        params![namespace.as_str(), data],
      )
      .map_err(|e| eyre!("Failed to save namespace {}: {}", namespace, e))?;

    Ok(())
  }

  fn clear(&self, namespace: Namespace) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM namespaces WHERE namespace = ?",
        params![namespace.as_str()],
      )
      .map_err(|e| eyre!("Failed to clear namespace {}: {}", namespace, e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_missing_namespace_loads_none() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.load(Namespace::Cache).unwrap(), None);
  }

  #[test]
  fn test_save_overwrites_whole_namespace() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.save(Namespace::Queue, b"first").unwrap();
    store.save(Namespace::Queue, b"second").unwrap();
    assert_eq!(store.load(Namespace::Queue).unwrap(), Some(b"second".to_vec()));
    assert_eq!(store.load(Namespace::Cache).unwrap(), None);
  }

  #[test]
  fn test_clear_is_idempotent() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.save(Namespace::Cache, b"x").unwrap();
    store.clear(Namespace::Cache).unwrap();
    store.clear(Namespace::Cache).unwrap();
    assert_eq!(store.load(Namespace::Cache).unwrap(), None);
  }

  #[test]
  fn test_contents_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.save(Namespace::Cache, b"persisted").unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.load(Namespace::Cache).unwrap(), Some(b"persisted".to_vec()));
  }
}
