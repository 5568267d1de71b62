//! SQL-backed durable queue
//!
//! Entries are leased with a conditional update so two workers can never
//! hold the same job. A lease that is not renewed by heartbeats before it
//! expires is reclaimed by [`DurableQueue::reclaim_stalled`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use metrics::{counter, gauge};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::payload::SyncJobPayload;
use crate::config::QueueConfig;
use crate::error::{is_unique_violation, map_db_err};
use crate::models::queue_entry::{ActiveModel, Column, Entity, Model, QueueState};

/// Stalls tolerated before an entry is failed instead of redelivered.
pub const MAX_STALLED_COUNT: i32 = 1;
pub const STALLED_REASON: &str = "job stalled more than allowable limit";
const LEASE_RACE_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job {job_id} not found in queue")]
    NotFound { job_id: Uuid },
    #[error("Job {job_id} is {state}; only failed jobs can be retried")]
    NotFailed { job_id: Uuid, state: QueueState },
    #[error("Job {job_id} has used all {attempts} attempts")]
    AttemptsExhausted { job_id: Uuid, attempts: i32 },
    #[error("queue database error: {0}")]
    Database(#[from] DbErr),
    #[error("invalid queue payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was created.
    Added,
    /// An unfinished entry for the same job already exists; nothing changed.
    Duplicate,
    /// A finished entry was replaced by a waiting one that keeps its
    /// attempt count.
    Readmitted,
}

impl EnqueueOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            EnqueueOutcome::Added => "added",
            EnqueueOutcome::Duplicate => "duplicate",
            EnqueueOutcome::Readmitted => "readmitted",
        }
    }
}

/// A leased entry handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job_id: Uuid,
    pub payload: SyncJobPayload,
    /// 1-based attempt number of this delivery
    pub attempt: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub lease_owner: String,
}

impl Delivery {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another attempt after `delay`.
    Retrying { attempt: i32, delay: Duration },
    /// No attempts left, or the failure was not retryable.
    Failed { attempts: i32 },
    /// The caller no longer holds the lease; the entry was left alone.
    LeaseLost,
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub job_id: Uuid,
    pub state: QueueState,
    pub progress: i16,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub failed_reason: Option<String>,
    pub return_value: Option<JsonValue>,
    pub enqueued_at: DateTime<FixedOffset>,
    pub processed_at: Option<DateTime<FixedOffset>>,
    pub finished_at: Option<DateTime<FixedOffset>>,
}

impl From<Model> for QueueSnapshot {
    fn from(entry: Model) -> Self {
        Self {
            job_id: entry.job_id,
            state: entry.state,
            progress: entry.progress,
            attempts_made: entry.attempts_made,
            max_attempts: entry.max_attempts,
            priority: entry.priority,
            failed_reason: entry.failed_reason,
            return_value: entry.return_value,
            enqueued_at: entry.enqueued_at,
            processed_at: entry.processed_at,
            finished_at: entry.finished_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Entries put back in the ready set
    pub requeued: Vec<Uuid>,
    /// Entries failed after stalling too often
    pub failed: Vec<Uuid>,
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Priority-ordered, at-least-once job queue persisted in `queue_entries`.
#[derive(Debug, Clone)]
pub struct DurableQueue {
    db: Arc<DatabaseConnection>,
    config: QueueConfig,
}

impl DurableQueue {
    pub fn new(db: Arc<DatabaseConnection>, config: QueueConfig) -> Self {
        Self { db, config }
    }

    /// Builds the queue after checking the backing database answers.
    pub async fn connect(
        db: Arc<DatabaseConnection>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        db.ping()
            .await
            .map_err(|err| map_db_err("queue.connect", err))?;
        info!(queue = %config.name, "Queue connected");
        Ok(Self::new(db, config))
    }

    /// Releases the queue's handle on the pool. The pool itself is closed
    /// only when this was the last handle.
    pub async fn close(self) -> Result<(), QueueError> {
        let name = self.config.name;
        if let Ok(db) = Arc::try_unwrap(self.db) {
            db.close()
                .await
                .map_err(|err| map_db_err("queue.close", err))?;
        }
        info!(queue = %name, "Queue closed");
        Ok(())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Delay before the retry that follows attempt `attempts_made`:
    /// base, 2 x base, 4 x base, ...
    pub fn backoff_delay(&self, attempts_made: i32) -> Duration {
        let exponent = (attempts_made - 1).clamp(0, 16) as u32;
        self.config.backoff_base().saturating_mul(2u32.pow(exponent))
    }

    /// Adds a job, idempotent by job id.
    pub async fn enqueue(
        &self,
        job_id: Uuid,
        payload: &SyncJobPayload,
        priority: i32,
    ) -> Result<EnqueueOutcome, QueueError> {
        self.insert_entry(job_id, payload, priority, 0).await
    }

    /// Enqueues a job whose earlier entry may have been pruned, counting
    /// `attempts_made` deliveries as already spent.
    pub async fn readmit(
        &self,
        job_id: Uuid,
        payload: &SyncJobPayload,
        priority: i32,
        attempts_made: i32,
    ) -> Result<EnqueueOutcome, QueueError> {
        self.insert_entry(job_id, payload, priority, attempts_made.max(0))
            .await
    }

    async fn insert_entry(
        &self,
        job_id: Uuid,
        payload: &SyncJobPayload,
        priority: i32,
        mut attempts_made: i32,
    ) -> Result<EnqueueOutcome, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("queue.enqueue.begin", err))?;

        let existing = Entity::find()
            .filter(Column::JobId.eq(job_id))
            .one(&txn)
            .await
            .map_err(|err| map_db_err("queue.enqueue.find", err))?;

        let outcome = match existing {
            Some(entry) if !entry.state.is_finished() => {
                txn.commit()
                    .await
                    .map_err(|err| map_db_err("queue.enqueue.commit", err))?;
                debug!(%job_id, state = %entry.state, "job already queued");
                counter!("queue_jobs_enqueued_total", "outcome" => EnqueueOutcome::Duplicate.as_str())
                    .increment(1);
                return Ok(EnqueueOutcome::Duplicate);
            }
            Some(entry) => {
                attempts_made = attempts_made.max(entry.attempts_made);
                Entity::delete_by_id(entry.seq)
                    .exec(&txn)
                    .await
                    .map_err(|err| map_db_err("queue.enqueue.replace", err))?;
                EnqueueOutcome::Readmitted
            }
            None => EnqueueOutcome::Added,
        };

        if attempts_made >= self.config.max_attempts {
            txn.rollback()
                .await
                .map_err(|err| map_db_err("queue.enqueue.rollback", err))?;
            return Err(QueueError::AttemptsExhausted {
                job_id,
                attempts: attempts_made,
            });
        }

        let now = Utc::now().fixed_offset();
        let inserted = ActiveModel {
            queue_name: Set(self.config.name.clone()),
            job_id: Set(job_id),
            payload: Set(payload),
            priority: Set(priority),
            state: Set(QueueState::Waiting),
            attempts_made: Set(attempts_made),
            max_attempts: Set(self.config.max_attempts),
            progress: Set(0),
            failed_reason: Set(None),
            return_value: Set(None),
            available_at: Set(now),
            lease_owner: Set(None),
            lease_expires_at: Set(None),
            stalled_count: Set(0),
            enqueued_at: Set(now),
            processed_at: Set(None),
            finished_at: Set(None),
            ..Default::default()
        }
        .insert(&txn)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                // A concurrent enqueue of the same id won.
                txn.rollback()
                    .await
                    .map_err(|err| map_db_err("queue.enqueue.rollback", err))?;
                return Ok(EnqueueOutcome::Duplicate);
            }
            Err(err) => return Err(map_db_err("queue.enqueue.insert", err).into()),
        }

        txn.commit()
            .await
            .map_err(|err| map_db_err("queue.enqueue.commit", err))?;

        counter!("queue_jobs_enqueued_total", "outcome" => outcome.as_str()).increment(1);
        info!(%job_id, priority, attempts_made, outcome = outcome.as_str(), "job enqueued");
        Ok(outcome)
    }

    /// Leases the highest-priority ready entry (FIFO within a priority) and
    /// counts the delivery as an attempt.
    pub async fn lease_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        for _ in 0..LEASE_RACE_RETRIES {
            let now = Utc::now().fixed_offset();
            let Some(candidate) = Entity::find()
                .filter(Column::QueueName.eq(self.config.name.as_str()))
                .filter(Column::State.is_in(QueueState::PENDING))
                .filter(Column::AvailableAt.lte(now))
                .order_by_desc(Column::Priority)
                .order_by_asc(Column::Seq)
                .one(&*self.db)
                .await
                .map_err(|err| map_db_err("queue.lease.find", err))?
            else {
                return Ok(None);
            };

            let claimed = Entity::update_many()
                .set(ActiveModel {
                    state: Set(QueueState::Active),
                    lease_owner: Set(Some(worker_id.to_string())),
                    lease_expires_at: Set(Some(now + chrono_duration(lease))),
                    processed_at: Set(Some(now)),
                    progress: Set(0),
                    ..Default::default()
                })
                .col_expr(Column::AttemptsMade, Expr::col(Column::AttemptsMade).add(1))
                .filter(Column::Seq.eq(candidate.seq))
                .filter(Column::State.is_in(QueueState::PENDING))
                .exec(&*self.db)
                .await
                .map_err(|err| map_db_err("queue.lease.claim", err))?;

            if claimed.rows_affected == 0 {
                debug!(job_id = %candidate.job_id, "lost lease race, retrying");
                continue;
            }

            let attempt = candidate.attempts_made + 1;
            match serde_json::from_value::<SyncJobPayload>(candidate.payload.clone()) {
                Ok(payload) => {
                    counter!("queue_jobs_leased_total").increment(1);
                    debug!(job_id = %candidate.job_id, attempt, worker_id, "job leased");
                    return Ok(Some(Delivery {
                        job_id: candidate.job_id,
                        payload,
                        attempt,
                        max_attempts: candidate.max_attempts,
                        priority: candidate.priority,
                        lease_owner: worker_id.to_string(),
                    }));
                }
                Err(err) => {
                    warn!(job_id = %candidate.job_id, error = %err, "discarding entry with undecodable payload");
                    self.mark_failed(candidate.seq, &format!("Invalid payload: {err}"))
                        .await?;
                }
            }
        }

        Ok(None)
    }

    /// Extends a held lease. Returns false when the lease was lost.
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let expires = Utc::now().fixed_offset() + chrono_duration(lease);
        let result = Entity::update_many()
            .set(ActiveModel {
                lease_expires_at: Set(Some(expires)),
                ..Default::default()
            })
            .filter(Column::JobId.eq(job_id))
            .filter(Column::State.eq(QueueState::Active))
            .filter(Column::LeaseOwner.eq(worker_id))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.heartbeat", err))?;
        Ok(result.rows_affected > 0)
    }

    pub async fn update_progress(&self, job_id: Uuid, progress: i16) -> Result<bool, QueueError> {
        let result = Entity::update_many()
            .col_expr(Column::Progress, Expr::value(progress.clamp(0, 100)))
            .filter(Column::JobId.eq(job_id))
            .filter(Column::State.eq(QueueState::Active))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.update_progress", err))?;
        Ok(result.rows_affected > 0)
    }

    /// Acknowledges a successful execution. Returns false when the lease was
    /// lost in the meantime.
    pub async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        return_value: JsonValue,
    ) -> Result<bool, QueueError> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .set(ActiveModel {
                state: Set(QueueState::Completed),
                progress: Set(100),
                return_value: Set(Some(return_value)),
                failed_reason: Set(None),
                lease_owner: Set(None),
                lease_expires_at: Set(None),
                finished_at: Set(Some(now)),
                ..Default::default()
            })
            .filter(Column::JobId.eq(job_id))
            .filter(Column::State.eq(QueueState::Active))
            .filter(Column::LeaseOwner.eq(worker_id))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.complete", err))?;

        if result.rows_affected > 0 {
            counter!("queue_jobs_completed_total").increment(1);
        }
        Ok(result.rows_affected > 0)
    }

    /// Records a failed attempt. Retryable failures with attempts left are
    /// delayed by the exponential backoff; everything else is failed.
    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let Some(entry) = Entity::find()
            .filter(Column::JobId.eq(job_id))
            .filter(Column::State.eq(QueueState::Active))
            .filter(Column::LeaseOwner.eq(worker_id))
            .one(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.fail.find", err))?
        else {
            return Ok(FailOutcome::LeaseLost);
        };

        let now = Utc::now().fixed_offset();
        let retry = retryable && entry.attempts_made < entry.max_attempts;
        let delay = self.backoff_delay(entry.attempts_made);

        let changes = if retry {
            ActiveModel {
                state: Set(QueueState::Delayed),
                available_at: Set(now + chrono_duration(delay)),
                failed_reason: Set(Some(reason.to_string())),
                lease_owner: Set(None),
                lease_expires_at: Set(None),
                ..Default::default()
            }
        } else {
            ActiveModel {
                state: Set(QueueState::Failed),
                failed_reason: Set(Some(reason.to_string())),
                lease_owner: Set(None),
                lease_expires_at: Set(None),
                finished_at: Set(Some(now)),
                ..Default::default()
            }
        };

        let result = Entity::update_many()
            .set(changes)
            .filter(Column::Seq.eq(entry.seq))
            .filter(Column::State.eq(QueueState::Active))
            .filter(Column::LeaseOwner.eq(worker_id))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.fail.update", err))?;

        if result.rows_affected == 0 {
            return Ok(FailOutcome::LeaseLost);
        }

        if retry {
            counter!("queue_jobs_retried_total").increment(1);
            info!(
                %job_id,
                attempt = entry.attempts_made,
                max_attempts = entry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "job attempt failed, retry scheduled"
            );
            Ok(FailOutcome::Retrying {
                attempt: entry.attempts_made,
                delay,
            })
        } else {
            counter!("queue_jobs_failed_total").increment(1);
            warn!(%job_id, attempts = entry.attempts_made, reason, "job failed");
            Ok(FailOutcome::Failed {
                attempts: entry.attempts_made,
            })
        }
    }

    async fn find_entry(&self, job_id: Uuid) -> Result<Option<Model>, QueueError> {
        Entity::find()
            .filter(Column::QueueName.eq(self.config.name.as_str()))
            .filter(Column::JobId.eq(job_id))
            .one(&*self.db)
            .await
            .map_err(|err| QueueError::from(map_db_err("queue.find", err)))
    }

    /// Current state, `None` when the queue holds no entry (never enqueued
    /// or already pruned).
    pub async fn status(&self, job_id: Uuid) -> Result<Option<QueueState>, QueueError> {
        Ok(self.find_entry(job_id).await?.map(|entry| entry.state))
    }

    pub async fn snapshot(&self, job_id: Uuid) -> Result<Option<QueueSnapshot>, QueueError> {
        Ok(self.find_entry(job_id).await?.map(QueueSnapshot::from))
    }

    /// Deletes the entry whatever its state.
    pub async fn remove(&self, job_id: Uuid) -> Result<(), QueueError> {
        let result = Entity::delete_many()
            .filter(Column::QueueName.eq(self.config.name.as_str()))
            .filter(Column::JobId.eq(job_id))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.remove", err))?;

        if result.rows_affected == 0 {
            return Err(QueueError::NotFound { job_id });
        }
        debug!(%job_id, "job removed from queue");
        Ok(())
    }

    /// Deletes the entry only while it has not started executing.
    pub async fn remove_pending(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let result = Entity::delete_many()
            .filter(Column::QueueName.eq(self.config.name.as_str()))
            .filter(Column::JobId.eq(job_id))
            .filter(Column::State.is_in(QueueState::PENDING))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.remove_pending", err))?;
        Ok(result.rows_affected > 0)
    }

    /// Puts a failed entry back in the ready set. The attempt counter
    /// advances when it is next leased.
    pub async fn retry(&self, job_id: Uuid) -> Result<(), QueueError> {
        let entry = self
            .find_entry(job_id)
            .await?
            .ok_or(QueueError::NotFound { job_id })?;

        if entry.state != QueueState::Failed {
            return Err(QueueError::NotFailed {
                job_id,
                state: entry.state,
            });
        }
        if entry.attempts_made >= entry.max_attempts {
            return Err(QueueError::AttemptsExhausted {
                job_id,
                attempts: entry.attempts_made,
            });
        }

        let result = Entity::update_many()
            .set(ActiveModel {
                state: Set(QueueState::Waiting),
                available_at: Set(Utc::now().fixed_offset()),
                failed_reason: Set(None),
                finished_at: Set(None),
                ..Default::default()
            })
            .filter(Column::Seq.eq(entry.seq))
            .filter(Column::State.eq(QueueState::Failed))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.retry", err))?;

        if result.rows_affected == 0 {
            // Someone else moved it first; report what it is now.
            let state = self.status(job_id).await?.ok_or(QueueError::NotFound { job_id })?;
            return Err(QueueError::NotFailed { job_id, state });
        }
        info!(%job_id, "failed job put back in queue");
        Ok(())
    }

    /// Changes priority of a pending entry. Returns false when the entry is
    /// missing or already running.
    pub async fn reprioritize(&self, job_id: Uuid, priority: i32) -> Result<bool, QueueError> {
        let result = Entity::update_many()
            .col_expr(Column::Priority, Expr::value(priority))
            .filter(Column::QueueName.eq(self.config.name.as_str()))
            .filter(Column::JobId.eq(job_id))
            .filter(Column::State.is_in(QueueState::PENDING))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.reprioritize", err))?;
        Ok(result.rows_affected > 0)
    }

    /// Returns expired leases to the ready set, failing entries that stalled
    /// too often or have no attempts left.
    pub async fn reclaim_stalled(&self) -> Result<ReclaimReport, QueueError> {
        let now = Utc::now().fixed_offset();
        let stalled = Entity::find()
            .filter(Column::QueueName.eq(self.config.name.as_str()))
            .filter(Column::State.eq(QueueState::Active))
            .filter(Column::LeaseExpiresAt.lt(now))
            .all(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.reclaim.find", err))?;

        let mut report = ReclaimReport::default();
        for entry in stalled {
            let stalled_count = entry.stalled_count + 1;
            let give_up =
                stalled_count > MAX_STALLED_COUNT || entry.attempts_made >= entry.max_attempts;

            let changes = if give_up {
                ActiveModel {
                    state: Set(QueueState::Failed),
                    failed_reason: Set(Some(STALLED_REASON.to_string())),
                    stalled_count: Set(stalled_count),
                    lease_owner: Set(None),
                    lease_expires_at: Set(None),
                    finished_at: Set(Some(now)),
                    ..Default::default()
                }
            } else {
                ActiveModel {
                    state: Set(QueueState::Waiting),
                    available_at: Set(now),
                    stalled_count: Set(stalled_count),
                    lease_owner: Set(None),
                    lease_expires_at: Set(None),
                    ..Default::default()
                }
            };

            let result = Entity::update_many()
                .set(changes)
                .filter(Column::Seq.eq(entry.seq))
                .filter(Column::State.eq(QueueState::Active))
                .filter(Column::LeaseExpiresAt.lt(now))
                .exec(&*self.db)
                .await
                .map_err(|err| map_db_err("queue.reclaim.update", err))?;

            if result.rows_affected == 0 {
                continue;
            }

            counter!("queue_jobs_stalled_total").increment(1);
            if give_up {
                warn!(job_id = %entry.job_id, stalled_count, "stalled job failed");
                report.failed.push(entry.job_id);
            } else {
                warn!(job_id = %entry.job_id, stalled_count, "stalled job requeued");
                report.requeued.push(entry.job_id);
            }
        }

        Ok(report)
    }

    /// Drops finished entries beyond their retention age or count.
    pub async fn prune(&self) -> Result<PruneReport, QueueError> {
        let completed = self
            .prune_state(
                QueueState::Completed,
                self.config.completed_retention_seconds,
                self.config.completed_retention_count,
            )
            .await?;
        let failed = self
            .prune_state(
                QueueState::Failed,
                self.config.failed_retention_seconds,
                self.config.failed_retention_count,
            )
            .await?;

        if completed + failed > 0 {
            debug!(completed, failed, "pruned finished queue entries");
        }
        Ok(PruneReport { completed, failed })
    }

    async fn prune_state(
        &self,
        state: QueueState,
        max_age_seconds: u64,
        keep: u64,
    ) -> Result<u64, QueueError> {
        let cutoff = Utc::now().fixed_offset()
            - chrono::Duration::seconds(i64::try_from(max_age_seconds).unwrap_or(i64::MAX / 1000));

        let aged = Entity::delete_many()
            .filter(Column::QueueName.eq(self.config.name.as_str()))
            .filter(Column::State.eq(state))
            .filter(Column::FinishedAt.lt(cutoff))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.prune.age", err))?
            .rows_affected;

        let newest_first: Vec<i32> = Entity::find()
            .select_only()
            .column(Column::Seq)
            .filter(Column::QueueName.eq(self.config.name.as_str()))
            .filter(Column::State.eq(state))
            .order_by_desc(Column::FinishedAt)
            .order_by_desc(Column::Seq)
            .into_tuple()
            .all(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.prune.scan", err))?;

        let overflow: Vec<i32> = newest_first.into_iter().skip(keep as usize).collect();
        let trimmed = if overflow.is_empty() {
            0
        } else {
            Entity::delete_many()
                .filter(Column::Seq.is_in(overflow))
                .exec(&*self.db)
                .await
                .map_err(|err| map_db_err("queue.prune.count", err))?
                .rows_affected
        };

        Ok(aged + trimmed)
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows: Vec<(QueueState, i64)> = Entity::find()
            .select_only()
            .column(Column::State)
            .column_as(Column::Seq.count(), "count")
            .filter(Column::QueueName.eq(self.config.name.as_str()))
            .group_by(Column::State)
            .into_tuple()
            .all(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.counts", err))?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let count = count.max(0) as u64;
            match state {
                QueueState::Waiting => counts.waiting = count,
                QueueState::Active => counts.active = count,
                QueueState::Delayed => counts.delayed = count,
                QueueState::Completed => counts.completed = count,
                QueueState::Failed => counts.failed = count,
            }
        }

        gauge!("queue_depth", "state" => "waiting").set(counts.waiting as f64);
        gauge!("queue_depth", "state" => "active").set(counts.active as f64);
        gauge!("queue_depth", "state" => "delayed").set(counts.delayed as f64);
        Ok(counts)
    }

    async fn mark_failed(&self, seq: i32, reason: &str) -> Result<(), QueueError> {
        Entity::update_many()
            .set(ActiveModel {
                state: Set(QueueState::Failed),
                failed_reason: Set(Some(reason.to_string())),
                lease_owner: Set(None),
                lease_expires_at: Set(None),
                finished_at: Set(Some(Utc::now().fixed_offset())),
                ..Default::default()
            })
            .filter(Column::Seq.eq(seq))
            .exec(&*self.db)
            .await
            .map_err(|err| map_db_err("queue.mark_failed", err))?;
        Ok(())
    }
}
