//! Integration tests for the SQL-backed durable queue.

use std::time::Duration;

use anyhow::Result;
use mirror_sync::models::queue_entry::QueueState;
use mirror_sync::models::sync_job::SyncAction;
use mirror_sync::queue::{
    DurableQueue, EnqueueOutcome, FailOutcome, QueueError, STALLED_REASON, SyncJobPayload,
};
use serde_json::json;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{fast_queue_config, setup_test_db_arc};

const LEASE: Duration = Duration::from_secs(30);

fn payload(job_id: Uuid) -> SyncJobPayload {
    SyncJobPayload {
        sync_job_id: job_id,
        repository_id: Uuid::new_v4(),
        provider_ids: vec![Uuid::new_v4()],
        action: SyncAction::Sync,
        source_ref: None,
        target_ref: None,
        commit_hash: None,
        metadata: json!({}),
    }
}

async fn queue() -> Result<DurableQueue> {
    let db = setup_test_db_arc().await?;
    Ok(DurableQueue::connect(db, fast_queue_config()).await?)
}

#[tokio::test]
async fn enqueue_is_idempotent_by_job_id() -> Result<()> {
    let queue = queue().await?;
    let job_id = Uuid::new_v4();

    assert_eq!(queue.enqueue(job_id, &payload(job_id), 0).await?, EnqueueOutcome::Added);
    assert_eq!(
        queue.enqueue(job_id, &payload(job_id), 5).await?,
        EnqueueOutcome::Duplicate
    );

    let counts = queue.counts().await?;
    assert_eq!(counts.waiting, 1);
    let snapshot = queue.snapshot(job_id).await?.expect("entry exists");
    assert_eq!(snapshot.priority, 0);
    Ok(())
}

#[tokio::test]
async fn leases_by_priority_then_fifo() -> Result<()> {
    let queue = queue().await?;
    let first_low = Uuid::new_v4();
    let second_low = Uuid::new_v4();
    let high = Uuid::new_v4();

    queue.enqueue(first_low, &payload(first_low), 1).await?;
    queue.enqueue(second_low, &payload(second_low), 1).await?;
    queue.enqueue(high, &payload(high), 9).await?;

    let order: Vec<Uuid> = [
        queue.lease_next("w1", LEASE).await?,
        queue.lease_next("w1", LEASE).await?,
        queue.lease_next("w1", LEASE).await?,
    ]
    .into_iter()
    .flatten()
    .map(|delivery| delivery.job_id)
    .collect();

    assert_eq!(order, vec![high, first_low, second_low]);
    assert!(queue.lease_next("w1", LEASE).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn a_leased_entry_is_not_delivered_twice() -> Result<()> {
    let queue = queue().await?;
    let job_id = Uuid::new_v4();
    queue.enqueue(job_id, &payload(job_id), 0).await?;

    let delivery = queue.lease_next("w1", LEASE).await?.expect("delivery");
    assert_eq!(delivery.attempt, 1);
    assert_eq!(delivery.payload.sync_job_id, job_id);
    assert!(queue.lease_next("w2", LEASE).await?.is_none());

    assert_eq!(queue.status(job_id).await?, Some(QueueState::Active));
    assert!(queue.heartbeat(job_id, "w1", LEASE).await?);
    assert!(!queue.heartbeat(job_id, "w2", LEASE).await?);
    Ok(())
}

#[tokio::test]
async fn retryable_failures_back_off_until_attempts_run_out() -> Result<()> {
    let queue = queue().await?;
    let job_id = Uuid::new_v4();
    queue.enqueue(job_id, &payload(job_id), 0).await?;

    for attempt in 1..=2 {
        let delivery = queue.lease_next("w1", LEASE).await?.expect("delivery");
        assert_eq!(delivery.attempt, attempt);
        let outcome = queue.fail(job_id, "w1", "boom", true).await?;
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt,
                delay: queue.backoff_delay(attempt),
            }
        );
        assert_eq!(queue.status(job_id).await?, Some(QueueState::Delayed));
        tokio::time::sleep(queue.backoff_delay(attempt) + Duration::from_millis(20)).await;
    }

    let last = queue.lease_next("w1", LEASE).await?.expect("final delivery");
    assert!(last.is_final_attempt());
    assert_eq!(
        queue.fail(job_id, "w1", "boom", true).await?,
        FailOutcome::Failed { attempts: 3 }
    );

    let snapshot = queue.snapshot(job_id).await?.expect("entry");
    assert_eq!(snapshot.state, QueueState::Failed);
    assert_eq!(snapshot.failed_reason.as_deref(), Some("boom"));
    assert!(matches!(
        queue.retry(job_id).await,
        Err(QueueError::AttemptsExhausted { attempts: 3, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn permanent_failures_skip_remaining_attempts() -> Result<()> {
    let queue = queue().await?;
    let job_id = Uuid::new_v4();
    queue.enqueue(job_id, &payload(job_id), 0).await?;
    queue.lease_next("w1", LEASE).await?.expect("delivery");

    assert_eq!(
        queue.fail(job_id, "w1", "unauthorized", false).await?,
        FailOutcome::Failed { attempts: 1 }
    );

    queue.retry(job_id).await?;
    let again = queue.lease_next("w1", LEASE).await?.expect("redelivery");
    assert_eq!(again.attempt, 2);
    Ok(())
}

#[tokio::test]
async fn completion_requires_the_lease() -> Result<()> {
    let queue = queue().await?;
    let job_id = Uuid::new_v4();
    queue.enqueue(job_id, &payload(job_id), 0).await?;
    queue.lease_next("w1", LEASE).await?.expect("delivery");

    assert!(queue.update_progress(job_id, 40).await?);
    assert!(!queue.complete(job_id, "w2", json!({})).await?);
    assert_eq!(queue.fail(job_id, "w2", "x", true).await?, FailOutcome::LeaseLost);
    assert!(queue.complete(job_id, "w1", json!({"success": true})).await?);

    let snapshot = queue.snapshot(job_id).await?.expect("entry");
    assert_eq!(snapshot.state, QueueState::Completed);
    assert_eq!(snapshot.progress, 100);
    assert_eq!(snapshot.return_value, Some(json!({"success": true})));
    Ok(())
}

#[tokio::test]
async fn finished_entries_are_readmitted_keeping_spent_attempts() -> Result<()> {
    let queue = queue().await?;
    let job_id = Uuid::new_v4();
    queue.enqueue(job_id, &payload(job_id), 0).await?;
    queue.lease_next("w1", LEASE).await?.expect("delivery");
    queue.fail(job_id, "w1", "fatal", false).await?;

    assert_eq!(
        queue.enqueue(job_id, &payload(job_id), 3).await?,
        EnqueueOutcome::Readmitted
    );
    let snapshot = queue.snapshot(job_id).await?.expect("entry");
    assert_eq!(snapshot.state, QueueState::Waiting);
    assert_eq!(snapshot.attempts_made, 1);
    assert_eq!(snapshot.priority, 3);
    assert_eq!(snapshot.failed_reason, None);
    Ok(())
}

#[tokio::test]
async fn readmission_is_refused_once_attempts_run_out() -> Result<()> {
    let queue = queue().await?;
    let pruned = Uuid::new_v4();

    assert!(matches!(
        queue.readmit(pruned, &payload(pruned), 0, 3).await,
        Err(QueueError::AttemptsExhausted { attempts: 3, .. })
    ));
    assert_eq!(queue.status(pruned).await?, None);

    assert_eq!(
        queue.readmit(pruned, &payload(pruned), 0, 2).await?,
        EnqueueOutcome::Added
    );
    let delivery = queue.lease_next("w1", LEASE).await?.expect("delivery");
    assert_eq!(delivery.attempt, 3);
    assert!(delivery.is_final_attempt());
    Ok(())
}

#[tokio::test]
async fn expired_leases_are_requeued_once_then_failed() -> Result<()> {
    let queue = queue().await?;
    let job_id = Uuid::new_v4();
    queue.enqueue(job_id, &payload(job_id), 0).await?;

    queue.lease_next("w1", Duration::ZERO).await?.expect("delivery");
    tokio::time::sleep(Duration::from_millis(10)).await;
    let report = queue.reclaim_stalled().await?;
    assert_eq!(report.requeued, vec![job_id]);
    assert_eq!(queue.status(job_id).await?, Some(QueueState::Waiting));

    let second = queue.lease_next("w2", Duration::ZERO).await?.expect("redelivery");
    assert_eq!(second.attempt, 2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let report = queue.reclaim_stalled().await?;
    assert_eq!(report.failed, vec![job_id]);

    let snapshot = queue.snapshot(job_id).await?.expect("entry");
    assert_eq!(snapshot.state, QueueState::Failed);
    assert_eq!(snapshot.failed_reason.as_deref(), Some(STALLED_REASON));
    Ok(())
}

#[tokio::test]
async fn pending_entries_can_be_removed_and_reprioritized() -> Result<()> {
    let queue = queue().await?;
    let waiting = Uuid::new_v4();
    let running = Uuid::new_v4();
    queue.enqueue(running, &payload(running), 5).await?;
    queue.enqueue(waiting, &payload(waiting), 0).await?;
    queue.lease_next("w1", LEASE).await?.expect("delivery");

    assert!(queue.reprioritize(waiting, 7).await?);
    assert!(!queue.reprioritize(running, 7).await?);
    assert_eq!(queue.snapshot(waiting).await?.expect("entry").priority, 7);

    assert!(!queue.remove_pending(running).await?);
    assert!(queue.remove_pending(waiting).await?);
    assert_eq!(queue.status(waiting).await?, None);

    queue.remove(running).await?;
    assert!(matches!(
        queue.remove(running).await,
        Err(QueueError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn prune_keeps_the_newest_finished_entries() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let mut config = fast_queue_config();
    config.completed_retention_count = 1;
    let queue = DurableQueue::new(db, config);

    let mut finished = Vec::new();
    for _ in 0..3 {
        let job_id = Uuid::new_v4();
        queue.enqueue(job_id, &payload(job_id), 0).await?;
        queue.lease_next("w1", LEASE).await?.expect("delivery");
        queue.complete(job_id, "w1", json!({})).await?;
        finished.push(job_id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = queue.prune().await?;
    assert_eq!(report.completed, 2);
    assert_eq!(queue.counts().await?.completed, 1);
    assert!(queue.status(finished[2]).await?.is_some());
    Ok(())
}
