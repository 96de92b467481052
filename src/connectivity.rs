//! Online/offline flag and the liveness probe that can restore it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::transport::{OutboundRequest, Transport};

/// Process-wide connectivity flag.
///
/// Starts online on every launch and is never persisted. Subscribers are
/// notified of every change through a `watch` channel.
pub struct ConnectivityState {
  tx: watch::Sender<bool>,
}

impl ConnectivityState {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Set the flag, notifying subscribers only if it changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if changed {
      info!(online, "connectivity changed");
    }
    online
  }

  pub fn toggle(&self) -> bool {
    let mut online = false;
    self.tx.send_modify(|current| {
      *current = !*current;
      online = *current;
    });
    info!(online, "connectivity toggled");
    online
  }

  /// Receiver that observes every change of the flag.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for ConnectivityState {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Running liveness probe. Dropping it stops the probe.
pub struct LivenessProbe {
  handle: JoinHandle<()>,
}

impl Drop for LivenessProbe {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

impl LivenessProbe {
  /// Poll `url` every `interval`. Any response marks the process online;
  /// a failed probe leaves the flag as it is.
  pub fn start<T: Transport>(
    state: Arc<ConnectivityState>,
    transport: Arc<T>,
    url: Url,
    interval: Duration,
  ) -> Self {
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        probe_once(&state, transport.as_ref(), &url).await;
      }
    });

    Self { handle }
  }
}

/// One probe round. Returns whether the origin answered.
pub async fn probe_once<T: Transport>(state: &ConnectivityState, transport: &T, url: &Url) -> bool {
  match transport.send(OutboundRequest::get(url.clone())).await {
    Ok(_) => {
      if !state.is_online() {
        info!(url = %url, "liveness probe succeeded, going back online");
        state.set_online(true);
      }
      true
    }
    Err(e) => {
      debug!(error = %e, "liveness probe failed, leaving connectivity unchanged");
      false
    }
  }
}
