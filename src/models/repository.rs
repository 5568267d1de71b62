//! Repository entity model: the source-of-truth repository being mirrored.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repositories")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub full_name: String,
    pub default_branch: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::repository_provider::Entity")]
    RepositoryProvider,
    #[sea_orm(has_many = "super::sync_job::Entity")]
    SyncJob,
}

impl Related<super::repository_provider::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RepositoryProvider.def()
    }
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
