//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! job record store, the provider/repository catalog and failover events.

pub mod catalog;
pub mod failover_event;
pub mod provider;
pub mod sync_job;

pub use catalog::CatalogRepository;
pub use failover_event::{FailoverEventRepository, NewFailoverEvent};
pub use provider::ProviderRepository;
pub use sync_job::{
    JobFilter, JobOrder, JobOutcome, JobStore, NewSyncJob, QueueSync, StatusCounts,
    SyncJobRepository,
};
