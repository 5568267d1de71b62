//! Failover monitor integration tests against mocked provider health endpoints.

use std::sync::Arc;

use anyhow::Result;
use mirror_sync::adapters::ProviderRegistry;
use mirror_sync::config::{FailoverConfig, ProviderClientConfig};
use mirror_sync::failover::{FailoverError, FailoverMonitor};
use mirror_sync::models::failover_event::{FailoverKind, FailoverStatus};
use mirror_sync::models::provider::{self, ProviderStatus};
use mirror_sync::models::sync_job::SyncAction;
use mirror_sync::repositories::{
    CatalogRepository, FailoverEventRepository, JobOutcome, JobStore, NewSyncJob,
    ProviderRepository, SyncJobRepository,
};
use sea_orm::DatabaseConnection;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{bind_provider, insert_github_provider, insert_repository, setup_test_db_arc};

struct Fixture {
    db: Arc<DatabaseConnection>,
    jobs: Arc<SyncJobRepository>,
    events: FailoverEventRepository,
    monitor: FailoverMonitor,
}

fn fixture(db: Arc<DatabaseConnection>) -> Fixture {
    let jobs = Arc::new(SyncJobRepository::new(db.clone()));
    let events = FailoverEventRepository::new(db.clone());
    let monitor = FailoverMonitor::new(
        ProviderRepository::new(db.clone()),
        events.clone(),
        CatalogRepository::new(db.clone()),
        jobs.clone(),
        Arc::new(ProviderRegistry::with_defaults(ProviderClientConfig::default())),
        FailoverConfig {
            failure_threshold: 2,
            health_interval_seconds: 60,
            degraded_health: 50,
        },
    );
    Fixture {
        db,
        jobs,
        events,
        monitor,
    }
}

async fn mount_health(server: &MockServer, status: u16) {
    let template = if status == 200 {
        ResponseTemplate::new(200).set_body_json(json!({
            "rate": {"limit": 5000, "remaining": 4990, "reset": 1_700_000_000}
        }))
    } else {
        ResponseTemplate::new(status)
    };
    Mock::given(method("GET"))
        .and(path("/rate_limit"))
        .respond_with(template)
        .mount(server)
        .await;
}

async fn reload(db: &DatabaseConnection, id: Uuid) -> Result<provider::Model> {
    use sea_orm::EntityTrait;
    Ok(provider::Entity::find_by_id(id)
        .one(db)
        .await?
        .expect("provider exists"))
}

#[tokio::test]
async fn unreachable_provider_opens_and_recovers_a_failover() -> Result<()> {
    let healthy = MockServer::start().await;
    let flaky = MockServer::start().await;
    mount_health(&healthy, 200).await;
    mount_health(&flaky, 500).await;

    let db = setup_test_db_arc().await?;
    let fallback = insert_github_provider(&db, "github-backup", &healthy.uri()).await?;
    let primary = insert_github_provider(&db, "github-primary", &flaky.uri()).await?;
    let repo = insert_repository(&db, "hello").await?;
    bind_provider(&db, repo.id, primary.id, "https://github.com/octo/hello", true).await?;
    let fx = fixture(db);

    let report = fx.monitor.tick().await?;
    assert_eq!(report.checked, 2);
    assert_eq!(report.opened.len(), 1);
    assert!(report.recovered.is_empty());

    let stored = reload(&fx.db, primary.id).await?;
    assert_eq!(stored.status, ProviderStatus::Inactive);
    assert_eq!(stored.health, 0);
    assert!(stored.last_health_check.is_some());

    let event = fx
        .events
        .find_active_for_provider(primary.id)
        .await?
        .expect("failover opened");
    assert_eq!(event.id, report.opened[0]);
    assert_eq!(event.fallback_provider_id, Some(fallback.id));
    assert_eq!(event.affected_repos, 1);
    assert!(event.reason.starts_with("Provider github-primary is unreachable"));

    // A second sweep while still down keeps the single open event.
    let report = fx.monitor.tick().await?;
    assert!(report.opened.is_empty());

    flaky.reset().await;
    mount_health(&flaky, 200).await;

    let report = fx.monitor.tick().await?;
    assert_eq!(report.recovered.len(), 1);
    assert_eq!(reload(&fx.db, primary.id).await?.status, ProviderStatus::Active);

    let resolved = fx.events.find_by_id(event.id).await?.expect("event");
    assert_eq!(resolved.status, FailoverStatus::Resolved);
    let recovery = fx
        .events
        .find_by_id(report.recovered[0])
        .await?
        .expect("recovery event");
    assert_eq!(recovery.event_type, FailoverKind::Recovery);
    assert_eq!(recovery.status, FailoverStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn consecutive_job_failures_open_a_failover() -> Result<()> {
    let server = MockServer::start().await;
    mount_health(&server, 200).await;

    let db = setup_test_db_arc().await?;
    let provider = insert_github_provider(&db, "github-main", &server.uri()).await?;
    let repo = insert_repository(&db, "hello").await?;
    let fx = fixture(db);

    for _ in 0..2 {
        let job = fx
            .jobs
            .create(NewSyncJob {
                id: Uuid::new_v4(),
                repository_id: repo.id,
                provider_ids: vec![provider.id],
                action: SyncAction::Sync,
                branch: "main".to_string(),
                commit_hash: None,
                metadata: json!({}),
                priority: 0,
            })
            .await?;
        fx.jobs.mark_processing(job.id, 1).await?;
        fx.jobs
            .finish(job.id, JobOutcome::failed("Failed to list branches"))
            .await?;
    }
    assert_eq!(fx.monitor.consecutive_failures(provider.id).await?, 2);

    let report = fx.monitor.tick().await?;
    assert_eq!(report.opened.len(), 1);
    let event = fx
        .events
        .find_by_id(report.opened[0])
        .await?
        .expect("event");
    assert_eq!(event.reason, "2 consecutive sync jobs failed on provider github-main");
    assert_eq!(event.fallback_provider_id, None);
    Ok(())
}

#[tokio::test]
async fn operators_resolve_only_active_events() -> Result<()> {
    let server = MockServer::start().await;
    mount_health(&server, 503).await;

    let db = setup_test_db_arc().await?;
    insert_github_provider(&db, "github-main", &server.uri()).await?;
    let fx = fixture(db);

    let report = fx.monitor.tick().await?;
    let event_id = report.opened[0];

    let resolved = fx.monitor.resolve_failover(event_id).await?;
    assert_eq!(resolved.status, FailoverStatus::Resolved);

    assert!(matches!(
        fx.monitor.resolve_failover(event_id).await,
        Err(FailoverError::NotActive {
            status: FailoverStatus::Resolved,
            ..
        })
    ));
    assert!(matches!(
        fx.monitor.resolve_failover(Uuid::new_v4()).await,
        Err(FailoverError::EventNotFound(_))
    ));
    Ok(())
}
