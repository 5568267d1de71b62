//! Integration tests for the job store, provider, catalog and failover repositories.

use anyhow::Result;
use mirror_sync::error::StoreError;
use mirror_sync::models::failover_event::{FailoverKind, FailoverStatus};
use mirror_sync::models::provider::ProviderStatus;
use mirror_sync::models::sync_job::{JobStatus, SyncAction};
use mirror_sync::repositories::{
    CatalogRepository, FailoverEventRepository, JobFilter, JobOutcome, JobStore, NewFailoverEvent,
    NewSyncJob, ProviderRepository, QueueSync, SyncJobRepository,
};
use serde_json::json;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{bind_provider, insert_github_provider, insert_repository, setup_test_db_arc};

fn new_job(repository_id: Uuid, providers: Vec<Uuid>) -> NewSyncJob {
    NewSyncJob {
        id: Uuid::new_v4(),
        repository_id,
        provider_ids: providers,
        action: SyncAction::Push,
        branch: "main".to_string(),
        commit_hash: None,
        metadata: json!({"source_ref": "main"}),
        priority: 0,
    }
}

#[tokio::test]
async fn job_lifecycle_follows_allowed_transitions() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = SyncJobRepository::new(db.clone());
    let repo = insert_repository(&db, "hello").await?;
    let job = jobs.create(new_job(repo.id, vec![Uuid::new_v4()])).await?;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, 0);

    let err = jobs
        .finish(job.id, JobOutcome::Completed { result: json!({}) })
        .await
        .expect_err("queued jobs cannot complete");
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            from: JobStatus::Queued,
            to: JobStatus::Completed,
            ..
        }
    ));

    let running = jobs.mark_processing(job.id, 1).await?;
    assert_eq!(running.status, JobStatus::Processing);
    assert_eq!(running.attempts, 1);
    assert!(running.started_at.is_some());

    assert!(jobs.record_progress(job.id, 30).await?);
    assert!(!jobs.record_progress(job.id, 20).await?);
    assert_eq!(jobs.find(job.id).await?.expect("job").progress, 30);

    let done = jobs
        .finish(job.id, JobOutcome::Completed { result: json!({"ok": true}) })
        .await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.result, Some(json!({"ok": true})));
    assert!(done.completed_at.is_some());

    assert!(matches!(
        jobs.cancel(job.id).await,
        Err(StoreError::InvalidTransition {
            from: JobStatus::Completed,
            ..
        })
    ));
    Ok(())
}

#[tokio::test]
async fn failed_jobs_reset_cleanly_for_retry() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = SyncJobRepository::new(db.clone());
    let repo = insert_repository(&db, "hello").await?;
    let job = jobs.create(new_job(repo.id, vec![Uuid::new_v4()])).await?;

    jobs.mark_processing(job.id, 1).await?;
    jobs.record_progress(job.id, 60).await?;
    jobs.finish(job.id, JobOutcome::failed("remote hung up")).await?;

    let reset = jobs.reset_for_retry(job.id).await?;
    assert_eq!(reset.status, JobStatus::Queued);
    assert_eq!(reset.error, None);
    assert_eq!(reset.progress, 0);
    assert_eq!(reset.attempts, 1);
    assert!(reset.completed_at.is_none());

    assert!(matches!(
        jobs.reset_for_retry(job.id).await,
        Err(StoreError::InvalidTransition { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn attempt_count_never_decreases() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = SyncJobRepository::new(db.clone());
    let repo = insert_repository(&db, "hello").await?;
    let job = jobs.create(new_job(repo.id, vec![Uuid::new_v4()])).await?;

    jobs.mark_processing(job.id, 3).await?;
    jobs.finish(job.id, JobOutcome::failed("exhausted")).await?;

    // A delivery numbered from a fresh queue entry does not lower it.
    let running = jobs.mark_processing(job.id, 1).await?;
    assert_eq!(running.attempts, 3);

    let synced = jobs
        .apply_queue_snapshot(
            job.id,
            QueueSync {
                status: JobStatus::Processing,
                progress: 10,
                error: None,
                attempts: 0,
            },
        )
        .await?;
    assert_eq!(synced.attempts, 3);
    Ok(())
}

#[tokio::test]
async fn jobs_need_a_target_provider() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = SyncJobRepository::new(db.clone());

    let err = jobs
        .create(new_job(insert_repository(&db, "hello").await?.id, Vec::new()))
        .await
        .expect_err("empty provider list is rejected");
    assert!(matches!(err, StoreError::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn list_filters_by_provider_and_status() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = SyncJobRepository::new(db.clone());
    let repository_id = insert_repository(&db, "hello").await?.id;
    let github = Uuid::new_v4();
    let gitlab = Uuid::new_v4();

    let both = jobs.create(new_job(repository_id, vec![github, gitlab])).await?;
    let only_gitlab = jobs.create(new_job(repository_id, vec![gitlab])).await?;
    let only_github = jobs.create(new_job(repository_id, vec![github])).await?;
    jobs.cancel(only_github.id).await?;

    let for_gitlab = jobs
        .list(&JobFilter {
            provider_id: Some(gitlab),
            ..Default::default()
        })
        .await?;
    let mut ids: Vec<Uuid> = for_gitlab.iter().map(|job| job.id).collect();
    ids.sort();
    let mut expected = vec![both.id, only_gitlab.id];
    expected.sort();
    assert_eq!(ids, expected);

    let cancelled_github = jobs
        .list(&JobFilter {
            provider_id: Some(github),
            statuses: vec![JobStatus::Cancelled],
            ..Default::default()
        })
        .await?;
    assert_eq!(cancelled_github.len(), 1);
    assert_eq!(cancelled_github[0].id, only_github.id);

    let counts = jobs.status_counts().await?;
    assert_eq!(counts.total, 3);
    assert_eq!(counts.queued, 2);
    assert_eq!(counts.cancelled, 1);
    Ok(())
}

#[tokio::test]
async fn provider_filter_pages_through_history_and_stops_when_filled() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = SyncJobRepository::new(db.clone());
    let repository_id = insert_repository(&db, "hello").await?.id;
    let github = Uuid::new_v4();
    let gitlab = Uuid::new_v4();

    let oldest = jobs.create(new_job(repository_id, vec![gitlab])).await?;
    for _ in 0..120 {
        jobs.create(new_job(repository_id, vec![github])).await?;
    }

    let found = jobs
        .list(&JobFilter {
            provider_id: Some(gitlab),
            limit: Some(1),
            ..Default::default()
        })
        .await?;
    assert_eq!(found.iter().map(|job| job.id).collect::<Vec<_>>(), vec![oldest.id]);

    let window = jobs
        .list(&JobFilter {
            provider_id: Some(github),
            limit: Some(5),
            offset: 48,
            ..Default::default()
        })
        .await?;
    assert_eq!(window.len(), 5);
    assert!(window.iter().all(|job| job.targets_provider(github)));

    let all = jobs
        .list(&JobFilter {
            provider_id: Some(github),
            ..Default::default()
        })
        .await?;
    assert_eq!(all.len(), 120);
    assert_eq!(all[48..53], window[..]);
    Ok(())
}

#[tokio::test]
async fn metadata_merges_per_provider_results() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = SyncJobRepository::new(db.clone());
    let repo = insert_repository(&db, "hello").await?;
    let job = jobs.create(new_job(repo.id, vec![Uuid::new_v4()])).await?;

    jobs.merge_metadata(job.id, json!({"push_results": {"a": {"success": true}}}))
        .await?;
    let merged = jobs
        .merge_metadata(job.id, json!({"push_results": {"b": {"success": false}}}))
        .await?;

    assert_eq!(merged.metadata["source_ref"], "main");
    assert_eq!(merged.metadata["push_results"]["a"]["success"], true);
    assert_eq!(merged.metadata["push_results"]["b"]["success"], false);
    Ok(())
}

#[tokio::test]
async fn active_providers_are_ordered_by_health() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let providers = ProviderRepository::new(db.clone());
    let a = insert_github_provider(&db, "alpha", "http://alpha.invalid").await?;
    let b = insert_github_provider(&db, "bravo", "http://bravo.invalid").await?;
    let c = insert_github_provider(&db, "charlie", "http://charlie.invalid").await?;

    providers.record_health(a.id, ProviderStatus::Active, 40).await?;
    let clamped = providers.record_health(b.id, ProviderStatus::Active, 250).await?;
    assert_eq!(clamped.health, 100);
    assert!(clamped.last_health_check.is_some());
    providers.record_health(c.id, ProviderStatus::Inactive, 0).await?;

    let active: Vec<String> = providers
        .list_active()
        .await?
        .into_iter()
        .map(|provider| provider.name)
        .collect();
    assert_eq!(active, vec!["bravo".to_string(), "alpha".to_string()]);
    assert_eq!(providers.list_all().await?.len(), 3);

    assert!(matches!(
        providers
            .record_health(Uuid::new_v4(), ProviderStatus::Active, 90)
            .await,
        Err(StoreError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn catalog_lists_primary_binding_first() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let catalog = CatalogRepository::new(db.clone());
    let mirror = insert_github_provider(&db, "mirror", "http://mirror.invalid").await?;
    let origin = insert_github_provider(&db, "origin", "http://origin.invalid").await?;
    let repo = insert_repository(&db, "hello").await?;
    let other = insert_repository(&db, "world").await?;

    bind_provider(&db, repo.id, mirror.id, "https://mirror.invalid/octo/hello", false).await?;
    bind_provider(&db, repo.id, origin.id, "https://origin.invalid/octo/hello", true).await?;
    bind_provider(&db, other.id, mirror.id, "https://mirror.invalid/octo/world", true).await?;

    let bindings = catalog.bindings_for_repository(repo.id).await?;
    assert_eq!(bindings.len(), 2);
    assert_eq!(bindings[0].provider_id, origin.id);
    assert_eq!(catalog.count_repositories_for_provider(mirror.id).await?, 2);

    let binding = catalog
        .find_binding(repo.id, mirror.id)
        .await?
        .expect("binding");
    let stamped = catalog.record_sync(binding, Some("abc123".to_string())).await?;
    assert!(stamped.last_synced_at.is_some());
    assert_eq!(stamped.last_synced_commit.as_deref(), Some("abc123"));

    let restamped = catalog.record_sync(stamped, None).await?;
    assert_eq!(restamped.last_synced_commit.as_deref(), Some("abc123"));
    Ok(())
}

#[tokio::test]
async fn failover_events_resolve_once() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let events = FailoverEventRepository::new(db.clone());
    let provider = insert_github_provider(&db, "flaky", "http://flaky.invalid").await?;

    let event = events
        .create(NewFailoverEvent {
            kind: FailoverKind::Failover,
            provider_id: provider.id,
            fallback_provider_id: None,
            reason: "unreachable".to_string(),
            affected_repos: -3,
            status: FailoverStatus::Active,
            metadata: None,
            duration_seconds: None,
        })
        .await?;
    assert_eq!(event.affected_repos, 0);
    assert!(event.resolved_at.is_none());

    let open = events
        .find_active_for_provider(provider.id)
        .await?
        .expect("open event");
    assert_eq!(open.id, event.id);

    let resolved = events.resolve(event.id).await?;
    assert_eq!(resolved.status, FailoverStatus::Resolved);
    assert!(resolved.duration_seconds.is_some());
    assert!(resolved.resolved_at.is_some());
    assert!(events.find_active_for_provider(provider.id).await?.is_none());

    assert!(matches!(
        events.resolve(event.id).await,
        Err(StoreError::Validation(_))
    ));
    assert_eq!(events.list_recent(Some(provider.id), 10).await?.len(), 1);
    Ok(())
}
