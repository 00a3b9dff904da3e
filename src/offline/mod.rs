//! Offline-first content cache with versioned buckets.

mod buckets;
mod worker;

pub use buckets::BucketStorage;
pub use worker::{ActivateReport, InstallReport, OfflineCache, WorkerState};
