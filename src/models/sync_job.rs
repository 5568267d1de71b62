//! SyncJob entity model
//!
//! The persisted unit of work: one synchronization action against one or
//! more providers bound to a repository.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Lifecycle status of a sync job.
///
/// `completed` and `cancelled` are terminal. `failed` can re-enter the queue
/// through a manual retry or be picked up again by the queue's own retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Statuses a record may be in for a move to `self` to be legal.
    pub fn allowed_predecessors(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Queued => &[JobStatus::Failed],
            // Processing -> Processing covers redelivery after a stalled lease.
            JobStatus::Processing => &[JobStatus::Queued, JobStatus::Failed, JobStatus::Processing],
            JobStatus::Completed => &[JobStatus::Processing],
            // Queued -> Failed compensates a retry whose re-enqueue did not go through.
            JobStatus::Failed => &[JobStatus::Processing, JobStatus::Queued],
            JobStatus::Cancelled => &[JobStatus::Queued, JobStatus::Processing, JobStatus::Failed],
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        next.allowed_predecessors().contains(&self)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a job does against its target providers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    #[sea_orm(string_value = "push")]
    Push,
    #[sea_orm(string_value = "pull")]
    Pull,
    /// Full sync: pull every remote branch.
    #[sea_orm(string_value = "sync")]
    Sync,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncAction::Push => write!(f, "push"),
            SyncAction::Pull => write!(f, "pull"),
            SyncAction::Sync => write!(f, "sync"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Job identifier, also the durable queue's dedup key
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub repository_id: Uuid,

    /// Ordered, non-empty list of target provider ids (JSON array of UUIDs)
    #[sea_orm(column_type = "JsonBinary")]
    pub provider_ids: JsonValue,

    pub action: SyncAction,

    /// Source branch, `main` unless the request named one
    pub branch: String,

    pub commit_hash: Option<String>,

    /// Free-form metadata: refs, files, author, per-provider results
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,

    pub status: JobStatus,

    /// 0..=100, non-decreasing while processing
    pub progress: i16,

    /// Deliveries made by the queue; capped by the queue's max attempts
    pub attempts: i32,

    pub error: Option<String>,

    /// Higher is served first
    pub priority: i32,

    /// Structured result of the last execution
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub result: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    /// Decodes `provider_ids`, skipping entries that are not valid UUIDs.
    pub fn target_providers(&self) -> Vec<Uuid> {
        self.provider_ids
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str())
                    .filter_map(|id| Uuid::parse_str(id).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn targets_provider(&self, provider_id: Uuid) -> bool {
        self.target_providers().contains(&provider_id)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(JsonValue::as_str)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::repository::Entity",
        from = "Column::RepositoryId",
        to = "super::repository::Column::Id"
    )]
    Repository,
}

impl Related<super::repository::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Repository.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_successors() {
        use sea_orm::Iterable;

        for next in JobStatus::iter() {
            assert!(!JobStatus::Completed.can_transition_to(next));
            if next != JobStatus::Cancelled {
                assert!(!JobStatus::Cancelled.can_transition_to(next));
            }
        }
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn manual_retry_only_from_failed() {
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn queued_job_can_be_cancelled_or_started() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn display_outputs_stored_strings() {
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert_eq!(SyncAction::Sync.to_string(), "sync");
    }

    #[test]
    fn decodes_provider_ids() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let now = chrono::Utc::now().fixed_offset();
        let model = Model {
            id: Uuid::new_v4(),
            repository_id: Uuid::new_v4(),
            provider_ids: serde_json::json!([a.to_string(), "not-a-uuid", b.to_string()]),
            action: SyncAction::Push,
            branch: "main".to_string(),
            commit_hash: None,
            metadata: serde_json::json!({"message": ""}),
            status: JobStatus::Queued,
            progress: 0,
            attempts: 0,
            error: None,
            priority: 0,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        assert_eq!(model.target_providers(), vec![a, b]);
        assert!(model.targets_provider(b));
        assert_eq!(model.metadata_str("message"), None);
    }
}
