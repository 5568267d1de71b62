//! Database migrations for the mirror-sync job subsystem.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_000100_create_providers;
mod m2026_01_05_000200_create_repositories;
mod m2026_01_05_000300_create_sync_jobs;
mod m2026_01_05_000400_create_queue_entries;
mod m2026_01_05_000500_create_failover_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_000100_create_providers::Migration),
            Box::new(m2026_01_05_000200_create_repositories::Migration),
            Box::new(m2026_01_05_000300_create_sync_jobs::Migration),
            Box::new(m2026_01_05_000400_create_queue_entries::Migration),
            Box::new(m2026_01_05_000500_create_failover_events::Migration),
        ]
    }
}
