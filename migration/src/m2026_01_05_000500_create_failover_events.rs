//! Creates the failover_events audit table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FailoverEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FailoverEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FailoverEvents::EventType).text().not_null())
                    .col(ColumnDef::new(FailoverEvents::ProviderId).uuid().not_null())
                    .col(
                        ColumnDef::new(FailoverEvents::FallbackProviderId)
                            .uuid()
                            .null(),
                    )
                    .col(ColumnDef::new(FailoverEvents::Reason).text().not_null())
                    .col(
                        ColumnDef::new(FailoverEvents::AffectedRepos)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(FailoverEvents::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(ColumnDef::new(FailoverEvents::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(FailoverEvents::DurationSeconds)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FailoverEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(FailoverEvents::ResolvedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_failover_events_provider_id")
                            .from(FailoverEvents::Table, FailoverEvents::ProviderId)
                            .to(Providers::Table, Providers::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_failover_events_fallback_provider_id")
                            .from(FailoverEvents::Table, FailoverEvents::FallbackProviderId)
                            .to(Providers::Table, Providers::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_failover_events_provider_status")
                    .table(FailoverEvents::Table)
                    .col(FailoverEvents::ProviderId)
                    .col(FailoverEvents::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_failover_events_provider_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(FailoverEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FailoverEvents {
    Table,
    Id,
    EventType,
    ProviderId,
    FallbackProviderId,
    Reason,
    AffectedRepos,
    Status,
    Metadata,
    DurationSeconds,
    CreatedAt,
    ResolvedAt,
}

#[derive(DeriveIden)]
enum Providers {
    Table,
    Id,
}
