//! Background task that drains the sync queue when connectivity returns.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::queue::SyncQueue;
use crate::http::Fetcher;

/// Why a sync pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// The host came back online
  Online,
  /// A scheduled background sync fired
  BackgroundSync,
}

/// Run one `process_queue` pass per trigger until the sender side closes.
///
/// Triggers that pile up while a pass is running collapse into a single
/// follow-up pass.
pub fn spawn_sync_worker(
  queue: SyncQueue,
  fetcher: Arc<dyn Fetcher>,
  mut triggers: mpsc::Receiver<SyncTrigger>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    while let Some(trigger) = triggers.recv().await {
      let mut coalesced = 0;
      while triggers.try_recv().is_ok() {
        coalesced += 1;
      }
      debug!(?trigger, coalesced, "Sync triggered");

      match queue.process_queue(fetcher.as_ref()).await {
        Ok(report) => debug!(?report, "Sync pass complete"),
        Err(e) => error!(error = %e, "Sync pass failed"),
      }
    }
    info!("Sync worker stopped");
  })
}
