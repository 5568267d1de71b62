//! Durable job queue backed by the `queue_entries` table.

pub mod durable;
pub mod payload;

pub use durable::{
    Delivery, DurableQueue, EnqueueOutcome, FailOutcome, MAX_STALLED_COUNT, PruneReport,
    QueueCounts, QueueError, QueueSnapshot, ReclaimReport, STALLED_REASON,
};
pub use payload::SyncJobPayload;
