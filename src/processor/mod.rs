//! Sync processor
//!
//! Executes one delivery of a job: moves the record to `processing`,
//! resolves every target provider, dispatches the action and writes the
//! outcome back. Transient adapter failures are returned as errors so the
//! queue retries the delivery; permanent ones become a failed result.

pub mod remote_url;
pub mod result;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::{Map, Value as JsonValue, json};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::custom::sanitize_branch;
use crate::adapters::{
    AdapterError, CommitAuthor, FileChange, GitProvider, ProviderRegistry, PushRequest,
    RegistryError, RepoCoordinates,
};
use crate::config::SyncAuthorConfig;
use crate::error::StoreError;
use crate::models::sync_job::{self, JobStatus, SyncAction};
use crate::models::{provider, repository, repository_provider};
use crate::queue::{Delivery, SyncJobPayload};
use crate::repositories::{CatalogRepository, JobOutcome, JobStore, ProviderRepository};

pub use remote_url::{RemoteUrlError, parse_remote_url};
pub use result::{BranchResult, ProcessorResult, ProviderOutcome};

const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
    #[error("Repository {0} not found")]
    RepositoryNotFound(Uuid),
    #[error("Provider {0} not found")]
    ProviderNotFound(Uuid),
    #[error("Repository {repository_id} is not bound to provider {provider_id}")]
    BindingNotFound {
        repository_id: Uuid,
        provider_id: Uuid,
    },
    #[error("Job {0} has no target providers")]
    NoProviders(Uuid),
    #[error(transparent)]
    RemoteUrl(#[from] RemoteUrlError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{source}")]
    Adapter {
        provider: String,
        #[source]
        source: AdapterError,
    },
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProcessorError {
    /// Whether the queue should schedule another attempt. A missing record
    /// never reappears, everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProcessorError::JobNotFound(_))
    }
}

/// Receives progress checkpoints after they were persisted on the record.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, job_id: Uuid, progress: i16);
}

/// Discards progress reports.
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _job_id: Uuid, _progress: i16) {}
}

/// Maps a provider's local 0..=100 checkpoints onto its slice of the job.
struct StepProgress<'a> {
    jobs: &'a dyn JobStore,
    sink: &'a dyn ProgressSink,
    job_id: Uuid,
    index: usize,
    total: usize,
}

impl StepProgress<'_> {
    fn overall(&self, local: i16) -> i16 {
        let local = i64::from(local.clamp(0, 100));
        ((self.index as i64 * 100 + local) / self.total.max(1) as i64) as i16
    }

    async fn report(&self, local: i16) {
        let progress = self.overall(local);
        match self.jobs.record_progress(self.job_id, progress).await {
            Ok(true) => self.sink.report(self.job_id, progress).await,
            Ok(false) => {}
            Err(err) => warn!(job_id = %self.job_id, error = %err, "failed to record progress"),
        }
    }
}

struct SyncTarget {
    provider: provider::Model,
    binding: repository_provider::Model,
    coordinates: RepoCoordinates,
    adapter: Box<dyn GitProvider>,
}

impl SyncTarget {
    /// Transient errors escape so the delivery is retried; the rest are
    /// recorded against this provider.
    fn failure(&self, error: AdapterError) -> Result<ProviderOutcome, ProcessorError> {
        if error.is_transient() {
            return Err(ProcessorError::Adapter {
                provider: self.provider.name.clone(),
                source: error,
            });
        }
        warn!(provider = %self.provider.name, error = %error, "provider operation failed");
        Ok(ProviderOutcome::failed(
            self.provider.id,
            &self.provider.name,
            &error,
        ))
    }

    fn succeeded(&self, message: String, data: JsonValue, commit: Option<String>) -> ProviderOutcome {
        ProviderOutcome::succeeded(self.provider.id, &self.provider.name, message, data, commit)
    }
}

pub struct SyncProcessor {
    jobs: Arc<dyn JobStore>,
    catalog: CatalogRepository,
    providers: ProviderRepository,
    registry: Arc<ProviderRegistry>,
    default_author: CommitAuthor,
    job_timeout: Duration,
}

impl SyncProcessor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        catalog: CatalogRepository,
        providers: ProviderRepository,
        registry: Arc<ProviderRegistry>,
        author: &SyncAuthorConfig,
    ) -> Self {
        Self {
            jobs,
            catalog,
            providers,
            registry,
            default_author: CommitAuthor {
                name: author.name.clone(),
                email: author.email.clone(),
            },
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// Runs one delivery. On error the record is already marked failed.
    #[instrument(
        skip(self, delivery, progress),
        fields(job_id = %delivery.job_id, action = %delivery.payload.action, attempt = delivery.attempt)
    )]
    pub async fn process(
        &self,
        delivery: &Delivery,
        progress: &dyn ProgressSink,
    ) -> Result<ProcessorResult, ProcessorError> {
        let job_id = delivery.job_id;
        let action = delivery.payload.action;

        let job = self
            .jobs
            .find(job_id)
            .await?
            .ok_or(ProcessorError::JobNotFound(job_id))?;

        match job.status {
            JobStatus::Cancelled => {
                info!("Skipping job cancelled before execution");
                return Ok(ProcessorResult::skipped(action, "Job was cancelled"));
            }
            JobStatus::Completed => {
                info!("Job already completed, acknowledging redelivery");
                return Ok(ProcessorResult::skipped(action, "Job already completed"));
            }
            _ => {}
        }

        self.jobs.mark_processing(job_id, delivery.attempt).await?;
        let started = Instant::now();

        let run = match tokio::time::timeout(
            self.job_timeout,
            self.execute(&job, &delivery.payload, progress),
        )
        .await
        {
            Ok(run) => run,
            Err(_) => Err(ProcessorError::Timeout(self.job_timeout)),
        };

        histogram!("sync_job_duration_seconds", "action" => action.to_string())
            .record(started.elapsed().as_secs_f64());

        match run {
            Ok(result) => {
                let outcome = if result.success {
                    JobOutcome::Completed {
                        result: result.to_json(),
                    }
                } else {
                    JobOutcome::Failed {
                        error: result.error().unwrap_or_else(|| result.message.clone()),
                        result: Some(result.to_json()),
                    }
                };
                self.finish(job_id, outcome).await?;

                let label = if result.success { "completed" } else { "failed" };
                counter!("sync_jobs_processed_total", "action" => action.to_string(), "outcome" => label)
                    .increment(1);
                info!(success = result.success, message = %result.message, "Sync job processed");
                Ok(result)
            }
            Err(err) => {
                error!(error = %err, "Sync job errored");
                if let Err(store_err) = self.finish(job_id, JobOutcome::failed(err.to_string())).await
                {
                    warn!(error = %store_err, "could not record job failure");
                }
                counter!("sync_jobs_processed_total", "action" => action.to_string(), "outcome" => "error")
                    .increment(1);
                Err(err)
            }
        }
    }

    async fn finish(&self, job_id: Uuid, outcome: JobOutcome) -> Result<(), ProcessorError> {
        match self.jobs.finish(job_id, outcome).await {
            Ok(_) => Ok(()),
            Err(StoreError::InvalidTransition {
                from: JobStatus::Cancelled,
                ..
            }) => {
                info!(%job_id, "Job cancelled during execution, keeping cancelled status");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn execute(
        &self,
        job: &sync_job::Model,
        payload: &SyncJobPayload,
        sink: &dyn ProgressSink,
    ) -> Result<ProcessorResult, ProcessorError> {
        let repository = self
            .catalog
            .find_repository(payload.repository_id)
            .await?
            .ok_or(ProcessorError::RepositoryNotFound(payload.repository_id))?;

        let provider_ids = if payload.provider_ids.is_empty() {
            job.target_providers()
        } else {
            payload.provider_ids.clone()
        };
        if provider_ids.is_empty() {
            return Err(ProcessorError::NoProviders(job.id));
        }

        let total = provider_ids.len();
        let mut outcomes = Vec::with_capacity(total);

        for (index, provider_id) in provider_ids.into_iter().enumerate() {
            let progress = StepProgress {
                jobs: self.jobs.as_ref(),
                sink,
                job_id: job.id,
                index,
                total,
            };

            let target = self.resolve_target(&repository, provider_id).await?;
            debug!(
                %provider_id,
                provider = %target.provider.name,
                repo = %target.coordinates,
                "Dispatching sync action"
            );

            let outcome = match payload.action {
                SyncAction::Push => self.push(&target, job, payload, &progress).await?,
                SyncAction::Pull => self.pull(&target, payload, &progress).await?,
                SyncAction::Sync => self.full_sync(&target, &progress).await?,
            };
            progress.report(100).await;

            self.record_outcome(job.id, payload.action, &target, &outcome)
                .await?;
            outcomes.push(outcome);
        }

        Ok(ProcessorResult::from_outcomes(payload.action, outcomes))
    }

    async fn resolve_target(
        &self,
        repository: &repository::Model,
        provider_id: Uuid,
    ) -> Result<SyncTarget, ProcessorError> {
        let provider = self
            .providers
            .find_by_id(provider_id)
            .await?
            .ok_or(ProcessorError::ProviderNotFound(provider_id))?;

        let binding = self
            .catalog
            .find_binding(repository.id, provider_id)
            .await?
            .ok_or(ProcessorError::BindingNotFound {
                repository_id: repository.id,
                provider_id,
            })?;

        let coordinates = parse_remote_url(&binding.remote_url)?;
        let adapter = self.registry.resolve(&provider)?;

        Ok(SyncTarget {
            provider,
            binding,
            coordinates,
            adapter,
        })
    }

    /// Writes the provider's outcome under `<action>_results.<provider_id>`
    /// and stamps the binding when it succeeded.
    async fn record_outcome(
        &self,
        job_id: Uuid,
        action: SyncAction,
        target: &SyncTarget,
        outcome: &ProviderOutcome,
    ) -> Result<(), ProcessorError> {
        let mut per_provider = Map::new();
        per_provider.insert(target.provider.id.to_string(), outcome.to_json());
        let mut patch = Map::new();
        patch.insert(format!("{action}_results"), JsonValue::Object(per_provider));

        self.jobs
            .merge_metadata(job_id, JsonValue::Object(patch))
            .await?;

        if outcome.success
            && let Err(err) = self
                .catalog
                .record_sync(target.binding.clone(), outcome.commit.clone())
                .await
        {
            warn!(provider_id = %target.provider.id, error = %err, "failed to stamp binding sync time");
        }

        Ok(())
    }

    fn push_request(
        &self,
        job: &sync_job::Model,
        payload: &SyncJobPayload,
    ) -> Result<PushRequest, AdapterError> {
        let metadata = &payload.metadata;

        let files: Vec<FileChange> = match metadata.get("files") {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(files) => serde_json::from_value(files.clone()).map_err(|err| {
                AdapterError::configuration(format!("Invalid files in job metadata: {err}"))
            })?,
        };

        let message = metadata
            .get("message")
            .and_then(JsonValue::as_str)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "Sync commit {}",
                    payload.commit_hash.as_deref().unwrap_or("HEAD")
                )
            });

        let author = match metadata.get("author") {
            None | Some(JsonValue::Null) => self.default_author.clone(),
            Some(author) => serde_json::from_value(author.clone()).map_err(|err| {
                AdapterError::configuration(format!("Invalid author in job metadata: {err}"))
            })?,
        };

        let branch = payload
            .target_ref
            .as_deref()
            .or(payload.source_ref.as_deref())
            .unwrap_or(&job.branch);

        Ok(PushRequest {
            branch: sanitize_branch(branch).to_string(),
            files,
            message,
            author,
        })
    }

    async fn push(
        &self,
        target: &SyncTarget,
        job: &sync_job::Model,
        payload: &SyncJobPayload,
        progress: &StepProgress<'_>,
    ) -> Result<ProviderOutcome, ProcessorError> {
        progress.report(20).await;

        let branches = match target.adapter.list_branches(&target.coordinates).await {
            Ok(branches) => branches,
            Err(err) => return target.failure(err.context("Failed to get branches")),
        };
        progress.report(30).await;

        let request = match self.push_request(job, payload) {
            Ok(request) => request,
            Err(err) => return target.failure(err.context("Push failed")),
        };
        if let Err(err) = target.adapter.capabilities().check_files(&request.files) {
            return target.failure(err.context("Push failed"));
        }
        progress.report(50).await;

        let commit = match target.adapter.push(&target.coordinates, &request).await {
            Ok(commit) => commit,
            Err(err) => return target.failure(err.context("Push failed")),
        };
        progress.report(80).await;

        let sha = commit.sha.clone();
        Ok(target.succeeded(
            format!("Successfully pushed to {}", request.branch),
            json!({
                "branch": request.branch,
                "commit": commit,
                "files": request.files.len(),
                "remote_branches": branches.len(),
            }),
            Some(sha),
        ))
    }

    async fn pull(
        &self,
        target: &SyncTarget,
        payload: &SyncJobPayload,
        progress: &StepProgress<'_>,
    ) -> Result<ProviderOutcome, ProcessorError> {
        progress.report(20).await;

        let info = match target.adapter.get_repository(&target.coordinates).await {
            Ok(info) => info,
            Err(err) => return target.failure(err.context("Failed to get repository info")),
        };
        progress.report(40).await;

        let branch = payload
            .source_ref
            .as_deref()
            .map(sanitize_branch)
            .unwrap_or(info.default_branch.as_str())
            .to_string();

        let snapshot = match target.adapter.pull(&target.coordinates, &branch).await {
            Ok(snapshot) => snapshot,
            Err(err) => return target.failure(err.context("Pull failed")),
        };
        progress.report(80).await;

        let sha = snapshot.commit.sha.clone();
        Ok(target.succeeded(
            format!("Successfully pulled changes from {branch}"),
            json!({
                "branch": branch,
                "commit": snapshot.commit,
                "tree": snapshot.tree,
            }),
            Some(sha),
        ))
    }

    /// Pulls every remote branch in order. Branch failures never stop the
    /// loop; the provider succeeds only when all branches did.
    async fn full_sync(
        &self,
        target: &SyncTarget,
        progress: &StepProgress<'_>,
    ) -> Result<ProviderOutcome, ProcessorError> {
        progress.report(10).await;

        let branches = match target.adapter.list_branches(&target.coordinates).await {
            Ok(branches) => branches,
            Err(err) => return target.failure(err.context("Failed to list branches")),
        };
        progress.report(30).await;

        let total = branches.len();
        let mut results = Vec::with_capacity(total);
        for (index, branch) in branches.iter().enumerate() {
            progress.report(30 + (index * 60 / total) as i16).await;

            match target.adapter.pull(&target.coordinates, &branch.name).await {
                Ok(snapshot) => results.push(BranchResult::pulled(branch, &snapshot)),
                Err(err) => {
                    warn!(branch = %branch.name, error = %err, "branch pull failed");
                    results.push(BranchResult::failed(branch, &err));
                }
            }
        }
        progress.report(90).await;

        let failed = results.iter().filter(|result| !result.success).count();
        let succeeded = results.len() - failed;
        let data = json!({
            "remote_branches": branches.iter().map(|branch| branch.name.as_str()).collect::<Vec<_>>(),
            "results": results,
        });

        if failed == 0 {
            return Ok(target.succeeded(
                "All branches synced successfully".to_string(),
                data,
                None,
            ));
        }

        let first_error = results
            .iter()
            .find(|result| !result.success)
            .map(|result| {
                format!(
                    "Pull of branch '{}' failed: {}",
                    result.branch,
                    result.error.as_deref().unwrap_or("unknown error")
                )
            })
            .unwrap_or_default();

        Ok(ProviderOutcome::partial(
            target.provider.id,
            &target.provider.name,
            format!("Synced {succeeded} of {} branches", results.len()),
            first_error,
            data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullStore;

    #[async_trait]
    impl JobStore for NullStore {
        async fn create(
            &self,
            _job: crate::repositories::NewSyncJob,
        ) -> Result<sync_job::Model, StoreError> {
            Err(StoreError::Validation("unused".to_string()))
        }
        async fn find(&self, _id: Uuid) -> Result<Option<sync_job::Model>, StoreError> {
            Ok(None)
        }
        async fn list(
            &self,
            _filter: &crate::repositories::JobFilter,
        ) -> Result<Vec<sync_job::Model>, StoreError> {
            Ok(Vec::new())
        }
        async fn mark_processing(&self, id: Uuid, _attempts: i32) -> Result<sync_job::Model, StoreError> {
            Err(StoreError::job_not_found(id))
        }
        async fn record_progress(&self, _id: Uuid, _progress: i16) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn merge_metadata(&self, id: Uuid, _patch: JsonValue) -> Result<sync_job::Model, StoreError> {
            Err(StoreError::job_not_found(id))
        }
        async fn finish(&self, id: Uuid, _outcome: JobOutcome) -> Result<sync_job::Model, StoreError> {
            Err(StoreError::job_not_found(id))
        }
        async fn reset_for_retry(&self, id: Uuid) -> Result<sync_job::Model, StoreError> {
            Err(StoreError::job_not_found(id))
        }
        async fn apply_queue_snapshot(
            &self,
            id: Uuid,
            _update: crate::repositories::QueueSync,
        ) -> Result<sync_job::Model, StoreError> {
            Err(StoreError::job_not_found(id))
        }
        async fn cancel(&self, id: Uuid) -> Result<sync_job::Model, StoreError> {
            Err(StoreError::job_not_found(id))
        }
        async fn set_priority(&self, id: Uuid, _priority: i32) -> Result<sync_job::Model, StoreError> {
            Err(StoreError::job_not_found(id))
        }
        async fn status_counts(&self) -> Result<crate::repositories::StatusCounts, StoreError> {
            Ok(Default::default())
        }
    }

    #[test]
    fn progress_is_split_across_providers() {
        let step = |index, total| StepProgress {
            jobs: &NullStore,
            sink: &NoopProgress,
            job_id: Uuid::nil(),
            index,
            total,
        };

        assert_eq!(step(0, 1).overall(30), 30);
        assert_eq!(step(0, 2).overall(100), 50);
        assert_eq!(step(1, 2).overall(20), 60);
        assert_eq!(step(1, 2).overall(100), 100);
        assert_eq!(step(2, 3).overall(150), 100);
    }

    #[test]
    fn only_missing_jobs_are_final() {
        assert!(!ProcessorError::JobNotFound(Uuid::nil()).is_retryable());
        assert!(ProcessorError::RepositoryNotFound(Uuid::nil()).is_retryable());
        assert!(ProcessorError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
