//! # SyncJob Repository
//!
//! The job record store. [`JobStore`] is the narrow interface the processor
//! and orchestrator depend on; [`SyncJobRepository`] implements it over
//! SeaORM. Every status change is a conditional update keyed by id and the
//! set of statuses the target status may be entered from, so two writers
//! racing on the same record cannot drive it through an illegal transition.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait, sea_query::Expr,
};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::{StoreError, map_db_err};
use crate::models::sync_job::{ActiveModel, Column, Entity, JobStatus, Model, SyncAction};

/// Rows fetched per round trip when filtering by provider in memory.
const PROVIDER_SCAN_PAGE: u64 = 50;

/// Fields required to create a job record.
#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub provider_ids: Vec<Uuid>,
    pub action: SyncAction,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub metadata: JsonValue,
    pub priority: i32,
}

/// How an execution ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed { result: JsonValue },
    Failed {
        error: String,
        result: Option<JsonValue>,
    },
}

impl JobOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        JobOutcome::Failed {
            error: error.into(),
            result: None,
        }
    }
}

/// A queue snapshot already mapped onto record fields.
#[derive(Debug, Clone)]
pub struct QueueSync {
    pub status: JobStatus,
    pub progress: i16,
    pub error: Option<String>,
    pub attempts: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    #[default]
    NewestCreated,
    RecentlyUpdated,
}

/// Filter for listing jobs. Empty fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub ids: Option<Vec<Uuid>>,
    pub statuses: Vec<JobStatus>,
    pub repository_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub branch: Option<String>,
    pub created_after: Option<DateTime<FixedOffset>>,
    pub created_before: Option<DateTime<FixedOffset>>,
    /// Only jobs whose attempt counter is strictly below this value
    pub attempts_below: Option<i32>,
    pub order: JobOrder,
    pub limit: Option<u64>,
    pub offset: u64,
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: NewSyncJob) -> Result<Model, StoreError>;

    async fn find(&self, id: Uuid) -> Result<Option<Model>, StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Model>, StoreError>;

    /// Moves the job to `processing` for a new delivery, resetting progress.
    /// The stored attempt count only ever grows.
    async fn mark_processing(&self, id: Uuid, attempts: i32) -> Result<Model, StoreError>;

    /// Raises progress while processing; lower or equal values are ignored.
    async fn record_progress(&self, id: Uuid, progress: i16) -> Result<bool, StoreError>;

    /// Deep-merges `patch` (a JSON object) into the job's metadata.
    async fn merge_metadata(&self, id: Uuid, patch: JsonValue) -> Result<Model, StoreError>;

    async fn finish(&self, id: Uuid, outcome: JobOutcome) -> Result<Model, StoreError>;

    /// Puts a failed job back to `queued` with error and progress cleared.
    async fn reset_for_retry(&self, id: Uuid) -> Result<Model, StoreError>;

    async fn apply_queue_snapshot(&self, id: Uuid, update: QueueSync) -> Result<Model, StoreError>;

    async fn cancel(&self, id: Uuid) -> Result<Model, StoreError>;

    async fn set_priority(&self, id: Uuid, priority: i32) -> Result<Model, StoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;
}

/// SeaORM-backed job record store.
#[derive(Debug, Clone)]
pub struct SyncJobRepository {
    db: Arc<DatabaseConnection>,
}

impl SyncJobRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Applies `changes` only if the record's current status may move to `to`.
    async fn transition(
        &self,
        id: Uuid,
        to: JobStatus,
        mut changes: ActiveModel,
    ) -> Result<Model, StoreError> {
        changes.status = Set(to);
        changes.updated_at = Set(Utc::now().fixed_offset());

        let result = Entity::update_many()
            .set(changes)
            .filter(Column::Id.eq(id))
            .filter(Column::Status.is_in(to.allowed_predecessors().iter().copied()))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("sync_job.transition", err))?;

        let current = self
            .find(id)
            .await?
            .ok_or_else(|| StoreError::job_not_found(id))?;

        if result.rows_affected == 0 {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }

        Ok(current)
    }
}

#[async_trait]
impl JobStore for SyncJobRepository {
    async fn create(&self, job: NewSyncJob) -> Result<Model, StoreError> {
        if job.provider_ids.is_empty() {
            return Err(StoreError::Validation(
                "a sync job needs at least one target provider".to_string(),
            ));
        }

        let now = Utc::now().fixed_offset();
        let provider_ids = serde_json::to_value(&job.provider_ids)?;
        let metadata = if job.metadata.is_object() {
            job.metadata
        } else {
            JsonValue::Object(Map::new())
        };

        let model = ActiveModel {
            id: Set(job.id),
            repository_id: Set(job.repository_id),
            provider_ids: Set(provider_ids),
            action: Set(job.action),
            branch: Set(job.branch),
            commit_hash: Set(job.commit_hash),
            metadata: Set(metadata),
            status: Set(JobStatus::Queued),
            progress: Set(0),
            attempts: Set(0),
            error: Set(None),
            priority: Set(job.priority),
            result: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .map_err(|err| map_db_err("sync_job.create", err))?;

        tracing::info!(
            job_id = %model.id,
            repository_id = %model.repository_id,
            action = %model.action,
            priority = model.priority,
            "Sync job created"
        );

        Ok(model)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Model>, StoreError> {
        Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("sync_job.find", err)))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Model>, StoreError> {
        let mut query = Entity::find();

        if let Some(ids) = &filter.ids {
            query = query.filter(Column::Id.is_in(ids.iter().copied()));
        }
        if !filter.statuses.is_empty() {
            query = query.filter(Column::Status.is_in(filter.statuses.iter().copied()));
        }
        if let Some(repository_id) = filter.repository_id {
            query = query.filter(Column::RepositoryId.eq(repository_id));
        }
        if let Some(branch) = &filter.branch {
            query = query.filter(Column::Branch.eq(branch.as_str()));
        }
        if let Some(after) = filter.created_after {
            query = query.filter(Column::CreatedAt.gte(after));
        }
        if let Some(before) = filter.created_before {
            query = query.filter(Column::CreatedAt.lte(before));
        }
        if let Some(cap) = filter.attempts_below {
            query = query.filter(Column::Attempts.lt(cap));
        }

        query = match filter.order {
            JobOrder::NewestCreated => query.order_by_desc(Column::CreatedAt),
            JobOrder::RecentlyUpdated => query.order_by_desc(Column::UpdatedAt),
        }
        .order_by_desc(Column::Id);

        // Provider ids live in a JSON column, so that filter runs in memory
        // over pages of rows, stopping once the requested window is filled.
        let Some(provider_id) = filter.provider_id else {
            if let Some(limit) = filter.limit {
                query = query.limit(limit);
            }
            if filter.offset > 0 {
                query = query.offset(filter.offset);
            }
            return query
                .all(&*self.db)
                .await
                .map_err(|err| StoreError::from(map_db_err("sync_job.list", err)));
        };

        let mut matching = Vec::new();
        if filter.limit == Some(0) {
            return Ok(matching);
        }

        let mut skipped = 0;
        let mut pages = query.paginate(&*self.db, PROVIDER_SCAN_PAGE);
        while let Some(rows) = pages
            .fetch_and_next()
            .await
            .map_err(|err| map_db_err("sync_job.list", err))?
        {
            for job in rows.into_iter().filter(|job| job.targets_provider(provider_id)) {
                if skipped < filter.offset {
                    skipped += 1;
                    continue;
                }
                matching.push(job);
                if filter.limit == Some(matching.len() as u64) {
                    return Ok(matching);
                }
            }
        }

        Ok(matching)
    }

    async fn mark_processing(&self, id: Uuid, attempts: i32) -> Result<Model, StoreError> {
        let current = self
            .find(id)
            .await?
            .ok_or_else(|| StoreError::job_not_found(id))?;
        let attempts = attempts.max(current.attempts).max(0);

        let now = Utc::now().fixed_offset();
        let changes = ActiveModel {
            progress: Set(0),
            attempts: Set(attempts),
            error: Set(None),
            started_at: Set(Some(now)),
            completed_at: Set(None),
            ..Default::default()
        };

        let job = self.transition(id, JobStatus::Processing, changes).await?;
        tracing::debug!(job_id = %id, attempts, "Sync job processing");
        Ok(job)
    }

    async fn record_progress(&self, id: Uuid, progress: i16) -> Result<bool, StoreError> {
        let progress = progress.clamp(0, 100);

        let result = Entity::update_many()
            .col_expr(Column::Progress, Expr::value(progress))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(JobStatus::Processing))
            .filter(Column::Progress.lt(progress))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("sync_job.record_progress", err))?;

        Ok(result.rows_affected > 0)
    }

    async fn merge_metadata(&self, id: Uuid, patch: JsonValue) -> Result<Model, StoreError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("sync_job.merge_metadata.begin", err))?;

        let job = Entity::find_by_id(id)
            .one(&txn)
            .await
            .map_err(|err| map_db_err("sync_job.merge_metadata.find", err))?
            .ok_or_else(|| StoreError::job_not_found(id))?;

        let mut metadata = job.metadata.clone();
        merge_json(&mut metadata, patch);

        let mut active: ActiveModel = job.into();
        active.metadata = Set(metadata);
        active.updated_at = Set(Utc::now().fixed_offset());
        let updated = active
            .update(&txn)
            .await
            .map_err(|err| map_db_err("sync_job.merge_metadata.update", err))?;

        txn.commit()
            .await
            .map_err(|err| map_db_err("sync_job.merge_metadata.commit", err))?;

        Ok(updated)
    }

    async fn finish(&self, id: Uuid, outcome: JobOutcome) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();

        let (status, changes) = match outcome {
            JobOutcome::Completed { result } => (
                JobStatus::Completed,
                ActiveModel {
                    progress: Set(100),
                    error: Set(None),
                    result: Set(Some(result)),
                    completed_at: Set(Some(now)),
                    ..Default::default()
                },
            ),
            JobOutcome::Failed { error, result } => {
                let mut changes = ActiveModel {
                    error: Set(Some(error)),
                    completed_at: Set(Some(now)),
                    ..Default::default()
                };
                if let Some(result) = result {
                    changes.result = Set(Some(result));
                }
                (JobStatus::Failed, changes)
            }
        };

        let job = self.transition(id, status, changes).await?;
        tracing::info!(job_id = %id, status = %job.status, "Sync job finished");
        Ok(job)
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<Model, StoreError> {
        let changes = ActiveModel {
            error: Set(None),
            progress: Set(0),
            started_at: Set(None),
            completed_at: Set(None),
            ..Default::default()
        };
        self.transition(id, JobStatus::Queued, changes).await
    }

    async fn apply_queue_snapshot(&self, id: Uuid, update: QueueSync) -> Result<Model, StoreError> {
        let job = self
            .find(id)
            .await?
            .ok_or_else(|| StoreError::job_not_found(id))?;

        // A cancelled record wins over whatever the queue still remembers.
        if job.status == JobStatus::Cancelled {
            return Ok(job);
        }

        let attempts = update.attempts.max(job.attempts);
        let mut active: ActiveModel = job.into();
        active.status = Set(update.status);
        active.progress = Set(update.progress.clamp(0, 100));
        active.error = Set(update.error);
        active.attempts = Set(attempts);
        active.updated_at = Set(Utc::now().fixed_offset());

        active
            .update(&*self.db)
            .await
            .map_err(|err| StoreError::from(map_db_err("sync_job.apply_queue_snapshot", err)))
    }

    async fn cancel(&self, id: Uuid) -> Result<Model, StoreError> {
        let changes = ActiveModel {
            completed_at: Set(Some(Utc::now().fixed_offset())),
            ..Default::default()
        };
        let job = self.transition(id, JobStatus::Cancelled, changes).await?;
        tracing::info!(job_id = %id, "Sync job cancelled");
        Ok(job)
    }

    async fn set_priority(&self, id: Uuid, priority: i32) -> Result<Model, StoreError> {
        let result = Entity::update_many()
            .col_expr(Column::Priority, Expr::value(priority))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(JobStatus::Queued))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("sync_job.set_priority", err))?;

        let job = self
            .find(id)
            .await?
            .ok_or_else(|| StoreError::job_not_found(id))?;

        if result.rows_affected == 0 {
            return Err(StoreError::PriorityLocked {
                id,
                status: job.status,
            });
        }

        Ok(job)
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(JobStatus, i64)> = Entity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Column::Id.count(), "count")
            .group_by(Column::Status)
            .into_tuple()
            .all(&*self.db)
            .await
            .map_err(|err| map_db_err("sync_job.status_counts", err))?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            counts.total += count;
            match status {
                JobStatus::Queued => counts.queued = count,
                JobStatus::Processing => counts.processing = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
                JobStatus::Cancelled => counts.cancelled = count,
            }
        }

        Ok(counts)
    }
}

/// Recursively merges objects; any other value in `patch` replaces the target.
fn merge_json(target: &mut JsonValue, patch: JsonValue) {
    match (target, patch) {
        (JsonValue::Object(target), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_keeps_sibling_provider_results() {
        let mut metadata = json!({
            "source_ref": "main",
            "push_results": {"a": {"success": true}}
        });
        merge_json(
            &mut metadata,
            json!({"push_results": {"b": {"success": false}}}),
        );

        assert_eq!(metadata["source_ref"], "main");
        assert_eq!(metadata["push_results"]["a"]["success"], true);
        assert_eq!(metadata["push_results"]["b"]["success"], false);
    }

    #[test]
    fn merge_replaces_scalars_and_arrays() {
        let mut metadata = json!({"files": [1, 2], "message": "old"});
        merge_json(&mut metadata, json!({"files": [3], "message": "new"}));
        assert_eq!(metadata, json!({"files": [3], "message": "new"}));
    }
}
