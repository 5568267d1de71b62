//! Test utilities for database testing.
//!
//! In-memory SQLite with every migration applied, plus fixture helpers for
//! providers, repositories and their bindings.

#![allow(dead_code)]

use anyhow::Result;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use mirror_sync::config::{QueueConfig, SyncAuthorConfig, WorkerConfig};
use mirror_sync::models::provider::{self, ProviderStatus};
use mirror_sync::models::{repository, repository_provider};
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Same as [`setup_test_db`], wrapped for the repositories.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(db))
}

/// Queue settings with millisecond backoff so retries are observable.
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        name: "sync-jobs-test".to_string(),
        max_attempts: 3,
        backoff_base_ms: 10,
        completed_retention_seconds: 3600,
        completed_retention_count: 100,
        failed_retention_seconds: 86400,
        failed_retention_count: 500,
    }
}

pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        poll_interval_ms: 20,
        lease_seconds: 30,
        maintenance_interval_seconds: 60,
        job_timeout_seconds: 30,
    }
}

pub fn test_author() -> SyncAuthorConfig {
    SyncAuthorConfig {
        name: "Mirror Bot".to_string(),
        email: "bot@mirror.test".to_string(),
    }
}

/// Inserts an active provider row.
pub async fn insert_provider(
    db: &DatabaseConnection,
    name: &str,
    kind: &str,
    endpoint: &str,
    credentials: JsonValue,
) -> Result<provider::Model> {
    let now = Utc::now().fixed_offset();
    let model = provider::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        provider_type: Set(kind.to_string()),
        endpoint: Set(endpoint.to_string()),
        status: Set(ProviderStatus::Active),
        health: Set(100),
        credentials: Set(credentials),
        last_health_check: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// GitHub-type provider pointed at a mock server.
pub async fn insert_github_provider(
    db: &DatabaseConnection,
    name: &str,
    endpoint: &str,
) -> Result<provider::Model> {
    insert_provider(db, name, "github", endpoint, json!({ "token": "ghp_test" })).await
}

pub async fn insert_repository(db: &DatabaseConnection, name: &str) -> Result<repository::Model> {
    let now = Utc::now().fixed_offset();
    let model = repository::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        full_name: Set(format!("octo/{name}")),
        default_branch: Set("main".to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;
    Ok(model)
}

pub async fn bind_provider(
    db: &DatabaseConnection,
    repository_id: Uuid,
    provider_id: Uuid,
    remote_url: &str,
    is_primary: bool,
) -> Result<repository_provider::Model> {
    let model = repository_provider::ActiveModel {
        id: Set(Uuid::new_v4()),
        repository_id: Set(repository_id),
        provider_id: Set(provider_id),
        remote_url: Set(remote_url.to_string()),
        is_primary: Set(is_primary),
        sync_enabled: Set(true),
        last_synced_at: Set(None),
        last_synced_commit: Set(None),
        created_at: Set(Utc::now().fixed_offset()),
    }
    .insert(db)
    .await?;
    Ok(model)
}
