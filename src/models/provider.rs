//! Provider entity model
//!
//! A configured Git hosting backend. `provider_type` stays a free-form
//! string so that rows naming an unregistered adapter only fail when a job
//! tries to resolve them.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Operational status derived from health checks.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    #[sea_orm(string_value = "active")]
    #[default]
    Active,
    #[sea_orm(string_value = "degraded")]
    Degraded,
    #[sea_orm(string_value = "inactive")]
    Inactive,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderStatus::Active => write!(f, "active"),
            ProviderStatus::Degraded => write!(f, "degraded"),
            ProviderStatus::Inactive => write!(f, "inactive"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Unique human-readable name
    pub name: String,

    /// Adapter type key, e.g. `github`, `gitlab`, `forgejo`, `custom`
    pub provider_type: String,

    /// API base URL (or Git HTTP root for generic servers)
    pub endpoint: String,

    pub status: ProviderStatus,

    /// Health score in 0..=100
    pub health: i16,

    /// Credential bag: `token`, `username`/`password`, `api_key`, ...
    #[sea_orm(column_type = "JsonBinary")]
    pub credentials: JsonValue,

    pub last_health_check: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::repository_provider::Entity")]
    RepositoryProvider,
}

impl Related<super::repository_provider::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RepositoryProvider.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
