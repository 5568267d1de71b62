//! # Job Orchestrator
//!
//! Job-level operations used by callers outside the worker: creation,
//! status and listing, bulk retry of failed jobs, cancellation,
//! reprioritization, aggregate metrics and reconciliation of a record with
//! its queue entry. Bulk operations isolate failures per job.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use metrics::counter;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::queue_entry::QueueState;
use crate::models::sync_job::{JobStatus, Model, SyncAction};
use crate::queue::{DurableQueue, QueueCounts, QueueError, SyncJobPayload};
use crate::repositories::{
    CatalogRepository, JobFilter, JobOrder, JobOutcome, JobStore, NewSyncJob, QueueSync,
};

pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_BRANCH: &str = "main";
pub const MAX_PAGE_SIZE: u64 = 100;
pub const DEFAULT_PAGE_SIZE: u64 = 20;
const RETRYABLE_LIMIT: u64 = 100;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Repository {0} not found")]
    RepositoryNotFound(Uuid),
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
    #[error("No providers bound to repository {0}")]
    NoProviders(Uuid),
    #[error("Provider {provider_id} is not bound to repository {repository_id}")]
    ProviderNotBound {
        repository_id: Uuid,
        provider_id: Uuid,
    },
    #[error("Priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {0}")]
    InvalidPriority(i32),
    #[error("Job {id} is {status}; only failed jobs can be retried")]
    NotRetryable { id: Uuid, status: JobStatus },
    #[error("Job {id} has used all {attempts} attempts")]
    AttemptsExhausted { id: Uuid, attempts: i32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Inbound job-creation request.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub repository_id: Uuid,
    pub action: SyncAction,
    pub priority: Option<i32>,
    pub source_ref: Option<String>,
    pub target_ref: Option<String>,
    pub commit_hash: Option<String>,
    pub metadata: Option<JsonValue>,
    /// Target providers; every bound provider when `None` or empty
    pub providers: Option<Vec<Uuid>>,
}

impl CreateJobRequest {
    pub fn new(repository_id: Uuid, action: SyncAction) -> Self {
        Self {
            repository_id,
            action,
            priority: None,
            source_ref: None,
            target_ref: None,
            commit_hash: None,
            metadata: None,
            providers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: i16,
    pub error: Option<String>,
    pub attempts: i32,
}

impl From<&Model> for JobStatusView {
    fn from(job: &Model) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job.progress,
            error: job.error.clone(),
            attempts: job.attempts,
        }
    }
}

/// Listing query; `page` is 1-based.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub statuses: Vec<JobStatus>,
    pub repository_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub branch: Option<String>,
    pub created_after: Option<DateTime<FixedOffset>>,
    pub created_before: Option<DateTime<FixedOffset>>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryOutcome {
    pub job_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RetryOutcome {
    fn queued(job_id: Uuid) -> Self {
        Self {
            job_id,
            success: true,
            queue_job_id: Some(job_id),
            error: None,
        }
    }

    fn failed(job_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            job_id,
            success: false,
            queue_job_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JobMetrics {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// completed / total x 100, 0 when there are no jobs
    pub success_rate: f64,
}

impl JobMetrics {
    pub fn from_counts(counts: crate::repositories::StatusCounts) -> Self {
        let success_rate = if counts.total == 0 {
            0.0
        } else {
            counts.completed as f64 / counts.total as f64 * 100.0
        };

        Self {
            total: counts.total,
            pending: counts.queued,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            success_rate,
        }
    }
}

/// Record status for a queue state.
pub fn status_for_queue_state(state: QueueState) -> JobStatus {
    match state {
        QueueState::Waiting | QueueState::Delayed => JobStatus::Queued,
        QueueState::Active => JobStatus::Processing,
        QueueState::Completed => JobStatus::Completed,
        QueueState::Failed => JobStatus::Failed,
    }
}

pub struct JobOrchestrator {
    jobs: Arc<dyn JobStore>,
    catalog: CatalogRepository,
    queue: DurableQueue,
}

impl JobOrchestrator {
    pub fn new(jobs: Arc<dyn JobStore>, catalog: CatalogRepository, queue: DurableQueue) -> Self {
        Self {
            jobs,
            catalog,
            queue,
        }
    }

    fn max_attempts(&self) -> i32 {
        self.queue.config().max_attempts
    }

    /// Persists a job and submits it to the queue. If the submission fails
    /// the record is marked failed so it never sits queued without an entry.
    #[instrument(skip(self, request), fields(repository_id = %request.repository_id, action = %request.action))]
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<Model, OrchestratorError> {
        let priority = request.priority.unwrap_or(MIN_PRIORITY);
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(OrchestratorError::InvalidPriority(priority));
        }

        let repository = self
            .catalog
            .find_repository(request.repository_id)
            .await?
            .ok_or(OrchestratorError::RepositoryNotFound(request.repository_id))?;

        let bindings = self.catalog.bindings_for_repository(repository.id).await?;
        let mut provider_ids: Vec<Uuid> = match request.providers {
            Some(requested) if !requested.is_empty() => {
                if let Some(unbound) = requested
                    .iter()
                    .find(|id| !bindings.iter().any(|binding| binding.provider_id == **id))
                {
                    return Err(OrchestratorError::ProviderNotBound {
                        repository_id: repository.id,
                        provider_id: *unbound,
                    });
                }
                requested
            }
            _ => bindings.iter().map(|binding| binding.provider_id).collect(),
        };
        let mut seen = std::collections::HashSet::new();
        provider_ids.retain(|id| seen.insert(*id));

        if provider_ids.is_empty() {
            return Err(OrchestratorError::NoProviders(repository.id));
        }

        let source_ref = request.source_ref.filter(|value| !value.is_empty());
        let target_ref = request.target_ref.filter(|value| !value.is_empty());

        let mut metadata = match request.metadata {
            Some(JsonValue::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(source_ref) = &source_ref {
            metadata.insert("source_ref".to_string(), JsonValue::from(source_ref.as_str()));
        }
        if let Some(target_ref) = &target_ref {
            metadata.insert("target_ref".to_string(), JsonValue::from(target_ref.as_str()));
        }

        let job = self
            .jobs
            .create(NewSyncJob {
                id: Uuid::new_v4(),
                repository_id: repository.id,
                provider_ids,
                action: request.action,
                branch: source_ref.unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
                commit_hash: request.commit_hash,
                metadata: JsonValue::Object(metadata),
                priority,
            })
            .await?;

        let payload = SyncJobPayload::from_job(&job);
        if let Err(err) = self.queue.enqueue(job.id, &payload, job.priority).await {
            error!(job_id = %job.id, error = %err, "Failed to enqueue new job");
            if let Err(store_err) = self
                .jobs
                .finish(job.id, JobOutcome::failed(format!("Failed to enqueue job: {err}")))
                .await
            {
                warn!(job_id = %job.id, error = %store_err, "Could not mark unqueued job failed");
            }
            return Err(err.into());
        }

        counter!("sync_jobs_created_total", "action" => job.action.to_string()).increment(1);
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Model, OrchestratorError> {
        self.jobs
            .find(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView, OrchestratorError> {
        let job = self.get_job(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    /// Newest first, at most [`MAX_PAGE_SIZE`] per page.
    pub async fn list_jobs(&self, query: JobQuery) -> Result<Vec<Model>, OrchestratorError> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let page = query.page.unwrap_or(1).max(1);

        let filter = JobFilter {
            statuses: query.statuses,
            repository_id: query.repository_id,
            provider_id: query.provider_id,
            branch: query.branch,
            created_after: query.created_after,
            created_before: query.created_before,
            order: JobOrder::NewestCreated,
            limit: Some(limit),
            offset: (page - 1) * limit,
            ..Default::default()
        };

        Ok(self.jobs.list(&filter).await?)
    }

    /// Failed jobs with attempts left, most recent first.
    pub async fn list_retryable(&self) -> Result<Vec<Model>, OrchestratorError> {
        let filter = JobFilter {
            statuses: vec![JobStatus::Failed],
            attempts_below: Some(self.max_attempts()),
            order: JobOrder::NewestCreated,
            limit: Some(RETRYABLE_LIMIT),
            ..Default::default()
        };
        Ok(self.jobs.list(&filter).await?)
    }

    /// Retries the given failed jobs, or every failed job with attempts left
    /// when `job_ids` is `None`. One job's failure never aborts the batch.
    #[instrument(skip(self, job_ids), fields(explicit = job_ids.is_some()))]
    pub async fn bulk_retry(
        &self,
        job_ids: Option<&[Uuid]>,
    ) -> Result<Vec<RetryOutcome>, OrchestratorError> {
        let mut outcomes = Vec::new();

        let candidates = match job_ids {
            Some(ids) => {
                let mut candidates = Vec::with_capacity(ids.len());
                for &job_id in ids {
                    match self.jobs.find(job_id).await {
                        Ok(Some(job)) if job.status == JobStatus::Failed => candidates.push(job),
                        Ok(Some(job)) => outcomes.push(RetryOutcome::failed(
                            job_id,
                            OrchestratorError::NotRetryable {
                                id: job_id,
                                status: job.status,
                            }
                            .to_string(),
                        )),
                        Ok(None) => outcomes.push(RetryOutcome::failed(
                            job_id,
                            OrchestratorError::JobNotFound(job_id).to_string(),
                        )),
                        Err(err) => outcomes.push(RetryOutcome::failed(job_id, err.to_string())),
                    }
                }
                candidates
            }
            None => {
                self.jobs
                    .list(&JobFilter {
                        statuses: vec![JobStatus::Failed],
                        attempts_below: Some(self.max_attempts()),
                        order: JobOrder::NewestCreated,
                        ..Default::default()
                    })
                    .await?
            }
        };

        for job in candidates {
            let outcome = self.retry_one(&job).await;
            counter!("sync_jobs_retried_total", "success" => outcome.success.to_string())
                .increment(1);
            outcomes.push(outcome);
        }

        info!(
            retried = outcomes.iter().filter(|outcome| outcome.success).count(),
            failed = outcomes.iter().filter(|outcome| !outcome.success).count(),
            "Bulk retry finished"
        );
        Ok(outcomes)
    }

    async fn retry_one(&self, job: &Model) -> RetryOutcome {
        if job.attempts >= self.max_attempts() {
            return RetryOutcome::failed(
                job.id,
                OrchestratorError::AttemptsExhausted {
                    id: job.id,
                    attempts: job.attempts,
                }
                .to_string(),
            );
        }

        let reset = match self.jobs.reset_for_retry(job.id).await {
            Ok(reset) => reset,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "Failed to reset job for retry");
                return RetryOutcome::failed(job.id, err.to_string());
            }
        };

        match self.requeue(&reset).await {
            Ok(()) => RetryOutcome::queued(job.id),
            Err(err) => {
                // Put the record back so it is not left queued without an entry.
                let previous = job.error.clone().unwrap_or_else(|| err.to_string());
                if let Err(store_err) = self.jobs.finish(job.id, JobOutcome::failed(previous)).await {
                    error!(job_id = %job.id, error = %store_err, "Failed to restore job after retry error");
                }
                RetryOutcome::failed(job.id, err.to_string())
            }
        }
    }

    /// Returns a reset job to the queue without giving back spent attempts.
    /// A retained failed entry is retried in place; a pruned or completed
    /// one is readmitted with the record's attempt count.
    async fn requeue(&self, job: &Model) -> Result<(), QueueError> {
        match self.queue.retry(job.id).await {
            Ok(()) => Ok(()),
            Err(QueueError::NotFailed { state, .. }) if state.is_pending() => {
                info!(job_id = %job.id, "Job already pending in queue");
                Ok(())
            }
            Err(QueueError::NotFound { .. })
            | Err(QueueError::NotFailed {
                state: QueueState::Completed,
                ..
            }) => {
                let payload = SyncJobPayload::from_job(job);
                self.queue
                    .readmit(job.id, &payload, job.priority, job.attempts)
                    .await
                    .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn metrics(&self) -> Result<JobMetrics, OrchestratorError> {
        let counts = self.jobs.status_counts().await?;
        Ok(JobMetrics::from_counts(counts))
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, OrchestratorError> {
        Ok(self.queue.counts().await?)
    }

    /// Copies the queue's view of a job onto its record. `None` when the
    /// queue has no entry for it.
    pub async fn update_from_queue(&self, job_id: Uuid) -> Result<Option<Model>, OrchestratorError> {
        let Some(snapshot) = self.queue.snapshot(job_id).await? else {
            return Ok(None);
        };

        let update = QueueSync {
            status: status_for_queue_state(snapshot.state),
            progress: snapshot.progress,
            error: snapshot.failed_reason,
            attempts: snapshot.attempts_made,
        };

        match self.jobs.apply_queue_snapshot(job_id, update).await {
            Ok(job) => Ok(Some(job)),
            Err(StoreError::NotFound { .. }) => Err(OrchestratorError::JobNotFound(job_id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Marks the job cancelled and drops its queue entry if it has not
    /// started. A running job is not interrupted.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<Model, OrchestratorError> {
        let job = match self.jobs.cancel(job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound { .. }) => return Err(OrchestratorError::JobNotFound(job_id)),
            Err(err) => return Err(err.into()),
        };

        if self.queue.remove_pending(job_id).await? {
            info!(%job_id, "Removed pending queue entry");
        }

        counter!("sync_jobs_cancelled_total").increment(1);
        Ok(job)
    }

    /// Changes priority of a queued job and of its pending queue entry.
    pub async fn reprioritize(&self, job_id: Uuid, priority: i32) -> Result<Model, OrchestratorError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(OrchestratorError::InvalidPriority(priority));
        }

        let job = match self.jobs.set_priority(job_id, priority).await {
            Ok(job) => job,
            Err(StoreError::NotFound { .. }) => return Err(OrchestratorError::JobNotFound(job_id)),
            Err(err) => return Err(err.into()),
        };

        if !self.queue.reprioritize(job_id, priority).await? {
            warn!(%job_id, "Queue entry no longer pending, priority applied to record only");
        }
        Ok(job)
    }
}
