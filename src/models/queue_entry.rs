//! QueueEntry entity model
//!
//! One row per job id in the durable queue. Rows move through
//! `waiting -> active -> completed | failed`, with `delayed` between
//! attempts while a retry backoff elapses.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    #[sea_orm(string_value = "waiting")]
    Waiting,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "delayed")]
    Delayed,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl QueueState {
    /// States in which the entry has not started executing yet.
    pub const PENDING: [QueueState; 2] = [QueueState::Waiting, QueueState::Delayed];

    pub fn is_pending(self) -> bool {
        Self::PENDING.contains(&self)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, QueueState::Completed | QueueState::Failed)
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueState::Waiting => write!(f, "waiting"),
            QueueState::Active => write!(f, "active"),
            QueueState::Delayed => write!(f, "delayed"),
            QueueState::Completed => write!(f, "completed"),
            QueueState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "queue_entries")]
pub struct Model {
    /// Insertion order, used to break priority ties
    #[sea_orm(primary_key)]
    pub seq: i32,
    pub queue_name: String,
    #[sea_orm(unique)]
    pub job_id: Uuid,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,
    pub priority: i32,
    pub state: QueueState,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub progress: i16,
    pub failed_reason: Option<String>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub return_value: Option<JsonValue>,
    /// Earliest time the entry may be leased
    pub available_at: DateTimeWithTimeZone,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTimeWithTimeZone>,
    pub stalled_count: i32,
    pub enqueued_at: DateTimeWithTimeZone,
    pub processed_at: Option<DateTimeWithTimeZone>,
    pub finished_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_states() {
        assert!(QueueState::Waiting.is_pending());
        assert!(QueueState::Delayed.is_pending());
        assert!(!QueueState::Active.is_pending());
        assert!(QueueState::Failed.is_finished());
        assert!(!QueueState::Delayed.is_finished());
    }
}
