//! Read-mostly lookups over repositories and their provider bindings.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{StoreError, map_db_err};
use crate::models::repository::{self, Entity as Repository};
use crate::models::repository_provider::{self, Entity as RepositoryProvider};

#[derive(Debug, Clone)]
pub struct CatalogRepository {
    db: Arc<DatabaseConnection>,
}

impl CatalogRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_repository(&self, id: Uuid) -> Result<Option<repository::Model>, StoreError> {
        Repository::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("catalog.find_repository", err)))
    }

    /// Every provider binding of a repository, primary binding first.
    pub async fn bindings_for_repository(
        &self,
        repository_id: Uuid,
    ) -> Result<Vec<repository_provider::Model>, StoreError> {
        RepositoryProvider::find()
            .filter(repository_provider::Column::RepositoryId.eq(repository_id))
            .order_by_desc(repository_provider::Column::IsPrimary)
            .order_by_asc(repository_provider::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("catalog.bindings_for_repository", err)))
    }

    pub async fn find_binding(
        &self,
        repository_id: Uuid,
        provider_id: Uuid,
    ) -> Result<Option<repository_provider::Model>, StoreError> {
        RepositoryProvider::find()
            .filter(repository_provider::Column::RepositoryId.eq(repository_id))
            .filter(repository_provider::Column::ProviderId.eq(provider_id))
            .one(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("catalog.find_binding", err)))
    }

    /// Number of repositories bound to a provider.
    pub async fn count_repositories_for_provider(&self, provider_id: Uuid) -> Result<u64, StoreError> {
        RepositoryProvider::find()
            .filter(repository_provider::Column::ProviderId.eq(provider_id))
            .count(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("catalog.count_repositories", err)))
    }

    /// Stamps a binding after a successful sync.
    pub async fn record_sync(
        &self,
        binding: repository_provider::Model,
        commit: Option<String>,
    ) -> Result<repository_provider::Model, StoreError> {
        let mut active: repository_provider::ActiveModel = binding.into();
        active.last_synced_at = Set(Some(Utc::now().fixed_offset()));
        if commit.is_some() {
            active.last_synced_commit = Set(commit);
        }

        active
            .update(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("catalog.record_sync", err)))
    }
}
