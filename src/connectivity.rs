//! Network reachability tracking.
//!
//! Two signals are combined:
//! - the link signal, a cheap synchronous hint fed by whoever owns the
//!   platform's online/offline events (true on a LAN with no uplink, too)
//! - the reachability probe, an actual HEAD request with a hard timeout

use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ConnectivityConfig;

/// Tracks whether the process believes it has network access.
pub struct ConnectivityMonitor {
  link: watch::Sender<bool>,
  client: reqwest::Client,
  probe_url: Url,
  probe_timeout: Duration,
}

impl ConnectivityMonitor {
  /// Create a monitor from configuration. The link starts in `initially_online`.
  pub fn new(config: &ConnectivityConfig, initially_online: bool) -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self::with_client(
      client,
      config.probe_url()?,
      config.probe_timeout(),
      initially_online,
    ))
  }

  /// Create a monitor that probes with the given client.
  pub fn with_client(
    client: reqwest::Client,
    probe_url: Url,
    probe_timeout: Duration,
    initially_online: bool,
  ) -> Self {
    let (link, _) = watch::channel(initially_online);
    Self {
      link,
      client,
      probe_url,
      probe_timeout,
    }
  }

  /// Current link signal. Cheap, suitable for hot paths.
  pub fn is_online(&self) -> bool {
    *self.link.borrow()
  }

  /// Record a link transition. Returns true if the state changed.
  pub fn set_link(&self, online: bool) -> bool {
    let changed = self.link.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });

    if changed {
      if online {
        info!("Network link up");
      } else {
        warn!("Network link down");
      }
    }

    changed
  }

  /// Subscribe to link transitions.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.link.subscribe()
  }

  /// Actively check that the probe endpoint answers.
  ///
  /// Resolves false without touching the network when the link is down, and
  /// false on timeout or transport error. Any HTTP response counts as reachable.
  pub async fn check_connectivity(&self) -> bool {
    if !self.is_online() {
      return false;
    }
    self.probe().await
  }

  /// Hit the probe endpoint regardless of the link signal.
  ///
  /// For hosts without a platform link signal, this is how it gets fed.
  pub async fn probe(&self) -> bool {
    let request = self.client.head(self.probe_url.clone()).send();
    match tokio::time::timeout(self.probe_timeout, request).await {
      Ok(Ok(response)) => {
        debug!(status = %response.status(), "Reachability probe answered");
        true
      }
      Ok(Err(e)) => {
        debug!("Reachability probe failed: {}", e);
        false
      }
      Err(_) => {
        debug!(
          timeout_ms = self.probe_timeout.as_millis() as u64,
          "Reachability probe timed out"
        );
        false
      }
    }
  }
}
