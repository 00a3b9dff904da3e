//! Background sync of requests made while offline.

mod queue;
mod worker;

pub use queue::{ProcessReport, SyncEvent, SyncQueue, SyncQueueItem};
pub use worker::{spawn_sync_worker, SyncTrigger};
