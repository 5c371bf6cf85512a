use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::MAX_CACHE_ENTRIES;
use crate::queue::MAX_RETRIES;

/// Default retry scheduler period.
pub const RETRY_INTERVAL_MS: u64 = 30_000;
/// Default reachability probe timeout.
pub const PROBE_TIMEOUT_MS: u64 = 5_000;
/// Default per-item executor timeout during a drain.
pub const ITEM_TIMEOUT_MS: u64 = 30_000;
/// Default reachability endpoint. Answers HEAD with an empty 204.
pub const DEFAULT_PROBE_URL: &str = "https://www.gstatic.com/generate_204";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub store: StoreConfig,
  pub cache: CacheConfig,
  pub queue: QueueConfig,
  pub connectivity: ConnectivityConfig,
  pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/chainsync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_entries: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_entries: MAX_CACHE_ENTRIES,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Failed attempts after which a write is dropped
  pub max_retries: u32,
  /// Retry scheduler period
  pub retry_interval_ms: u64,
  /// Upper bound on a single executor call during a drain
  pub item_timeout_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: MAX_RETRIES,
      retry_interval_ms: RETRY_INTERVAL_MS,
      item_timeout_ms: ITEM_TIMEOUT_MS,
    }
  }
}

impl QueueConfig {
  pub fn retry_interval(&self) -> Duration {
    Duration::from_millis(self.retry_interval_ms)
  }

  pub fn item_timeout(&self) -> Duration {
    Duration::from_millis(self.item_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Endpoint hit by the reachability probe
  pub probe_url: String,
  pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: DEFAULT_PROBE_URL.to_string(),
      probe_timeout_ms: PROBE_TIMEOUT_MS,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_url(&self) -> Result<Url> {
    Url::parse(&self.probe_url).map_err(|e| eyre!("Invalid probe_url '{}': {}", self.probe_url, e))
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.probe_timeout_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  /// Base URL of the remote mutation API; actions are POSTed to `{endpoint}/{action}`
  pub endpoint: Option<String>,
}

impl ExecutorConfig {
  pub fn endpoint(&self) -> Result<Url> {
    let raw = self
      .endpoint
      .as_deref()
      .ok_or_else(|| eyre!("No executor endpoint configured. Set executor.endpoint in the config file."))?;
    Url::parse(raw).map_err(|e| eyre!("Invalid executor endpoint '{}': {}", raw, e))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./chainsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/chainsync/config.yaml
  ///
  /// With no file found, every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("chainsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("chainsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.connectivity.probe_url()?;
    if self.executor.endpoint.is_some() {
      self.executor.endpoint()?;
    }
    if self.cache.max_entries == 0 {
      return Err(eyre!("cache.max_entries must be at least 1"));
    }
    if self.queue.retry_interval_ms == 0 {
      return Err(eyre!("queue.retry_interval_ms must be greater than zero"));
    }
    if self.queue.item_timeout_ms == 0 {
      return Err(eyre!("queue.item_timeout_ms must be greater than zero"));
    }
    if self.queue.max_retries == 0 {
      return Err(eyre!("queue.max_retries must be at least 1"));
    }
    if self.connectivity.probe_timeout_ms == 0 {
      return Err(eyre!("connectivity.probe_timeout_ms must be greater than zero"));
    }
    Ok(())
  }

  /// Store path from config, or the platform default.
  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.store.path {
      Some(p) => Ok(p.clone()),
      None => crate::store::SqliteStore::default_path(),
    }
  }

  /// Get the executor bearer token from the environment, if any.
  ///
  /// Checks CHAINSYNC_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CHAINSYNC_TOKEN").ok().filter(|t| !t.is_empty())
  }
}
