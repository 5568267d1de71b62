//! Creates the providers table: configured Git hosting backends with
//! credentials, endpoint and the last observed health.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Providers::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Providers::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Providers::Name).text().not_null())
                    .col(ColumnDef::new(Providers::ProviderType).text().not_null())
                    .col(ColumnDef::new(Providers::Endpoint).text().not_null())
                    .col(
                        ColumnDef::new(Providers::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(Providers::Health)
                            .small_integer()
                            .not_null()
                            .default(100),
                    )
                    .col(ColumnDef::new(Providers::Credentials).json_binary().not_null())
                    .col(
                        ColumnDef::new(Providers::LastHealthCheck)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Providers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Providers::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_providers_name")
                    .table(Providers::Table)
                    .col(Providers::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_providers_name").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Providers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Providers {
    Table,
    Id,
    Name,
    ProviderType,
    Endpoint,
    Status,
    Health,
    Credentials,
    LastHealthCheck,
    CreatedAt,
    UpdatedAt,
}
