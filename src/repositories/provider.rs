//! Provider repository for database operations
//!
//! Read access to configured providers plus the health bookkeeping written
//! by the failover monitor.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{StoreError, map_db_err};
use crate::models::provider::{self, Entity as Provider, ProviderStatus};

/// Repository for provider database operations
#[derive(Debug, Clone)]
pub struct ProviderRepository {
    db: Arc<DatabaseConnection>,
}

impl ProviderRepository {
    /// Creates a new ProviderRepository instance
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds a provider by id
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<provider::Model>, StoreError> {
        Provider::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("provider.find_by_id", err)))
    }

    /// Lists every provider ordered by name
    pub async fn list_all(&self) -> Result<Vec<provider::Model>, StoreError> {
        Provider::find()
            .order_by_asc(provider::Column::Name)
            .all(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("provider.list_all", err)))
    }

    /// Lists active providers, healthiest first
    ///
    /// # Returns
    ///
    /// Providers whose status is `active`, ordered by health descending and
    /// then by name so the choice of a fallback is deterministic.
    pub async fn list_active(&self) -> Result<Vec<provider::Model>, StoreError> {
        Provider::find()
            .filter(provider::Column::Status.eq(ProviderStatus::Active))
            .order_by_desc(provider::Column::Health)
            .order_by_asc(provider::Column::Name)
            .all(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("provider.list_active", err)))
    }

    /// Records the outcome of a health check
    ///
    /// # Arguments
    ///
    /// * `id` - Provider id
    /// * `status` - Derived operational status
    /// * `health` - Score in 0..=100
    pub async fn record_health(
        &self,
        id: Uuid,
        status: ProviderStatus,
        health: i16,
    ) -> Result<provider::Model, StoreError> {
        let existing = self.find_by_id(id).await?.ok_or(StoreError::NotFound {
            entity: "Provider",
            id,
        })?;

        let now = Utc::now().fixed_offset();
        let mut active: provider::ActiveModel = existing.into();
        active.status = Set(status);
        active.health = Set(health.clamp(0, 100));
        active.last_health_check = Set(Some(now));
        active.updated_at = Set(now);

        active
            .update(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("provider.record_health", err)))
    }
}
