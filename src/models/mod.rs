//! # Data Models
//!
//! SeaORM entities for the job record store, the durable queue and the
//! provider/repository catalog they reference.

pub mod failover_event;
pub mod provider;
pub mod queue_entry;
pub mod repository;
pub mod repository_provider;
pub mod sync_job;

pub use failover_event::Entity as FailoverEvent;
pub use provider::Entity as Provider;
pub use queue_entry::Entity as QueueEntry;
pub use repository::Entity as Repository;
pub use repository_provider::Entity as RepositoryProvider;
pub use sync_job::Entity as SyncJob;
