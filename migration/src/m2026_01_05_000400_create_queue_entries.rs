//! Creates the queue_entries table backing the durable job queue.
//!
//! `seq` provides insertion order for FIFO tie-breaking among equal
//! priorities; `job_id` is unique so a job can only be queued once.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QueueEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QueueEntries::Seq)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(QueueEntries::QueueName).text().not_null())
                    .col(ColumnDef::new(QueueEntries::JobId).uuid().not_null())
                    .col(ColumnDef::new(QueueEntries::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(QueueEntries::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(QueueEntries::State)
                            .text()
                            .not_null()
                            .default("waiting"),
                    )
                    .col(
                        ColumnDef::new(QueueEntries::AttemptsMade)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(QueueEntries::MaxAttempts).integer().not_null())
                    .col(
                        ColumnDef::new(QueueEntries::Progress)
                            .small_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(QueueEntries::FailedReason).text().null())
                    .col(ColumnDef::new(QueueEntries::ReturnValue).json_binary().null())
                    .col(
                        ColumnDef::new(QueueEntries::AvailableAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(QueueEntries::LeaseOwner).text().null())
                    .col(
                        ColumnDef::new(QueueEntries::LeaseExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(QueueEntries::StalledCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(QueueEntries::EnqueuedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QueueEntries::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(QueueEntries::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_queue_entries_job_id")
                    .table(QueueEntries::Table)
                    .col(QueueEntries::JobId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Claim path: ready entries by priority, then insertion order.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_queue_entries_claim ON queue_entries (queue_name, state, available_at, priority DESC, seq)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_queue_entries_lease")
                    .table(QueueEntries::Table)
                    .col(QueueEntries::State)
                    .col(QueueEntries::LeaseExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_queue_entries_job_id").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_queue_entries_claim").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_queue_entries_lease").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(QueueEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QueueEntries {
    Table,
    Seq,
    QueueName,
    JobId,
    Payload,
    Priority,
    State,
    AttemptsMade,
    MaxAttempts,
    Progress,
    FailedReason,
    ReturnValue,
    AvailableAt,
    LeaseOwner,
    LeaseExpiresAt,
    StalledCount,
    EnqueuedAt,
    ProcessedAt,
    FinishedAt,
}
