//! Replay of queued submissions once the origin is reachable again.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{OfflineStore, QueuedMutation};
use crate::error::{ReplayError, StorageError};
use crate::transport::{OutboundRequest, RedirectMode, Transport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  pub replayed: usize,
  pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
  Completed(SweepReport),
  /// Another sweep held the latch; the queue was not read.
  AlreadyRunning,
}

/// Drains the mutation queue. At most one sweep runs at a time.
pub struct ReplaySweeper<S: OfflineStore, T: Transport> {
  store: Arc<S>,
  transport: Arc<T>,
  latch: Mutex<()>,
}

impl<S: OfflineStore, T: Transport> ReplaySweeper<S, T> {
  pub fn new(store: Arc<S>, transport: Arc<T>) -> Self {
    Self {
      store,
      transport,
      latch: Mutex::new(()),
    }
  }

  /// Replay every queued submission once, oldest first.
  ///
  /// Entries are independent: a failed replay is logged, stays queued and
  /// does not stop the rest.
  pub async fn sweep(&self) -> Result<SweepOutcome, StorageError> {
    let Ok(_running) = self.latch.try_lock() else {
      debug!("sweep already in progress");
      return Ok(SweepOutcome::AlreadyRunning);
    };

    let queued = self.store.queued()?;
    let mut report = SweepReport::default();
    if queued.is_empty() {
      return Ok(SweepOutcome::Completed(report));
    }

    info!(count = queued.len(), "replaying queued submissions");
    for mutation in &queued {
      match self.replay_one(mutation).await {
        Ok(()) => {
          debug!(id = mutation.id, url = %mutation.url, "replayed");
          report.replayed += 1;
        }
        Err(e) => {
          warn!(id = mutation.id, url = %mutation.url, error = %e, "replay failed, keeping it queued");
          report.failed += 1;
        }
      }
    }

    info!(replayed = report.replayed, failed = report.failed, "sweep finished");
    Ok(SweepOutcome::Completed(report))
  }

  async fn replay_one(&self, mutation: &QueuedMutation) -> Result<(), ReplayError> {
    let request = OutboundRequest::post_form(mutation.url.clone(), mutation.form.clone())
      .with_credentials(&mutation.credentials)
      .with_redirect(RedirectMode::Manual);

    let response = self.transport.send(request).await?;
    if !response.is_opaque_redirect() {
      return Err(ReplayError::Rejected(response.status));
    }

    self.store.dequeue(mutation.id)?;
    Ok(())
  }

  /// Start a sweep every time `connectivity` flips to online.
  ///
  /// The task ends when the connectivity state is dropped.
  pub fn spawn_on_reconnect(self: Arc<Self>, mut connectivity: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
      connectivity.borrow_and_update();

      // the flag only notifies on change, so seeing `true` means we were offline
      while connectivity.changed().await.is_ok() {
        if !*connectivity.borrow_and_update() {
          continue;
        }

        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
          if let Err(e) = sweeper.sweep().await {
            error!(error = %e, "could not read the replay queue");
          }
        });
      }
    })
  }
}
