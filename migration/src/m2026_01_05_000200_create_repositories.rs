//! Creates the repositories table and the repository_providers join table that
//! binds a repository to each provider mirroring it.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Repositories::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Repositories::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Repositories::Name).text().not_null())
                    .col(ColumnDef::new(Repositories::FullName).text().not_null())
                    .col(
                        ColumnDef::new(Repositories::DefaultBranch)
                            .text()
                            .not_null()
                            .default("main"),
                    )
                    .col(
                        ColumnDef::new(Repositories::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Repositories::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RepositoryProviders::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepositoryProviders::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RepositoryProviders::RepositoryId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryProviders::ProviderId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryProviders::RemoteUrl)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryProviders::IsPrimary)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(RepositoryProviders::SyncEnabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(RepositoryProviders::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryProviders::LastSyncedCommit)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryProviders::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repository_providers_repository_id")
                            .from(RepositoryProviders::Table, RepositoryProviders::RepositoryId)
                            .to(Repositories::Table, Repositories::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repository_providers_provider_id")
                            .from(RepositoryProviders::Table, RepositoryProviders::ProviderId)
                            .to(Providers::Table, Providers::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repository_providers_pair")
                    .table(RepositoryProviders::Table)
                    .col(RepositoryProviders::RepositoryId)
                    .col(RepositoryProviders::ProviderId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_repository_providers_pair")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RepositoryProviders::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Repositories::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repositories {
    Table,
    Id,
    Name,
    FullName,
    DefaultBranch,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum RepositoryProviders {
    Table,
    Id,
    RepositoryId,
    ProviderId,
    RemoteUrl,
    IsPrimary,
    SyncEnabled,
    LastSyncedAt,
    LastSyncedCommit,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Providers {
    Table,
    Id,
}
