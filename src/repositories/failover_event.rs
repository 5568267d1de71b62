//! # FailoverEvent Repository
//!
//! Persistence for failover and recovery audit records. Events are
//! immutable once resolved apart from their status and duration.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{StoreError, map_db_err};
use crate::models::failover_event::{
    ActiveModel, Column, Entity, FailoverKind, FailoverStatus, Model,
};

/// Fields for a new failover or recovery record.
#[derive(Debug, Clone)]
pub struct NewFailoverEvent {
    pub kind: FailoverKind,
    pub provider_id: Uuid,
    pub fallback_provider_id: Option<Uuid>,
    pub reason: String,
    pub affected_repos: i32,
    pub status: FailoverStatus,
    pub metadata: Option<JsonValue>,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct FailoverEventRepository {
    db: Arc<DatabaseConnection>,
}

impl FailoverEventRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create(&self, event: NewFailoverEvent) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();
        let resolved_at = match event.status {
            FailoverStatus::Active => None,
            _ => Some(now),
        };

        let model = ActiveModel {
            id: Set(Uuid::new_v4()),
            event_type: Set(event.kind),
            provider_id: Set(event.provider_id),
            fallback_provider_id: Set(event.fallback_provider_id),
            reason: Set(event.reason),
            affected_repos: Set(event.affected_repos.max(0)),
            status: Set(event.status),
            metadata: Set(event.metadata),
            duration_seconds: Set(event.duration_seconds),
            created_at: Set(now),
            resolved_at: Set(resolved_at),
        }
        .insert(&*self.db)
        .await
        .map_err(|err| map_db_err("failover_event.create", err))?;

        tracing::info!(
            event_id = %model.id,
            provider_id = %model.provider_id,
            kind = %model.event_type,
            status = %model.status,
            "Failover event recorded"
        );

        Ok(model)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, StoreError> {
        Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("failover_event.find_by_id", err)))
    }

    /// The open failover for a provider, if any.
    pub async fn find_active_for_provider(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<Model>, StoreError> {
        Entity::find()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::EventType.eq(FailoverKind::Failover))
            .filter(Column::Status.eq(FailoverStatus::Active))
            .order_by_desc(Column::CreatedAt)
            .one(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("failover_event.find_active", err)))
    }

    /// Marks an active event resolved and records how long it stayed open.
    pub async fn resolve(&self, id: Uuid) -> Result<Model, StoreError> {
        let event = self.find_by_id(id).await?.ok_or(StoreError::NotFound {
            entity: "Failover event",
            id,
        })?;

        if event.status != FailoverStatus::Active {
            return Err(StoreError::Validation(format!(
                "failover event {id} is already {}",
                event.status
            )));
        }

        let now = Utc::now().fixed_offset();
        let duration = (now - event.created_at).num_seconds().max(0);

        let mut active: ActiveModel = event.into();
        active.status = Set(FailoverStatus::Resolved);
        active.duration_seconds = Set(Some(duration));
        active.resolved_at = Set(Some(now));

        active
            .update(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("failover_event.resolve", err)))
    }

    /// Most recent events, optionally for one provider.
    pub async fn list_recent(
        &self,
        provider_id: Option<Uuid>,
        limit: u64,
    ) -> Result<Vec<Model>, StoreError> {
        let mut query = Entity::find().order_by_desc(Column::CreatedAt);
        if let Some(provider_id) = provider_id {
            query = query.filter(Column::ProviderId.eq(provider_id));
        }

        query
            .limit(limit)
            .all(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("failover_event.list_recent", err)))
    }
}
