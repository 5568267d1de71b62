//! FailoverEvent entity model: audit record of a provider degradation and
//! its optional redirect to a fallback provider.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum FailoverKind {
    #[sea_orm(string_value = "failover")]
    Failover,
    #[sea_orm(string_value = "recovery")]
    Recovery,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "resolved")]
    Resolved,
    #[sea_orm(string_value = "completed")]
    Completed,
}

impl std::fmt::Display for FailoverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverKind::Failover => write!(f, "failover"),
            FailoverKind::Recovery => write!(f, "recovery"),
        }
    }
}

impl std::fmt::Display for FailoverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverStatus::Active => write!(f, "active"),
            FailoverStatus::Resolved => write!(f, "resolved"),
            FailoverStatus::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "failover_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub event_type: FailoverKind,
    pub provider_id: Uuid,
    pub fallback_provider_id: Option<Uuid>,
    pub reason: String,
    pub affected_repos: i32,
    pub status: FailoverStatus,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub metadata: Option<JsonValue>,
    /// Seconds between creation and resolution
    pub duration_seconds: Option<i64>,
    pub created_at: DateTimeWithTimeZone,
    pub resolved_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::provider::Entity",
        from = "Column::ProviderId",
        to = "super::provider::Column::Id"
    )]
    Provider,
}

impl Related<super::provider::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Provider.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
