//! # Failover Monitor
//!
//! Periodically probes every configured provider, records its health and
//! status, and keeps the failover audit trail in step: a provider that goes
//! inactive or accumulates consecutive failed jobs gets an active failover
//! event pointing at the healthiest other provider; once it is healthy and
//! failing jobs stop, the event is resolved and a recovery is recorded.

use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AdapterError, HealthReport, ProviderRegistry};
use crate::config::FailoverConfig;
use crate::error::StoreError;
use crate::models::failover_event::{self, FailoverKind, FailoverStatus};
use crate::models::provider::{self, ProviderStatus};
use crate::models::sync_job::{self, JobStatus};
use crate::repositories::{
    CatalogRepository, FailoverEventRepository, JobFilter, JobOrder, JobStore, NewFailoverEvent,
    ProviderRepository,
};

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("Failover event {0} not found")]
    EventNotFound(Uuid),
    #[error("Failover event {id} is already {status}")]
    NotActive { id: Uuid, status: FailoverStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of probing one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub provider_id: Uuid,
    pub provider: String,
    pub status: ProviderStatus,
    pub health: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorReport {
    pub checked: usize,
    pub opened: Vec<Uuid>,
    pub recovered: Vec<Uuid>,
}

/// Maps a probe outcome onto a status and score. Unreachable or unhealthy
/// providers are inactive; reachable ones below `degraded_health` are
/// degraded.
pub fn classify_health(
    probe: &Result<HealthReport, AdapterError>,
    degraded_health: i16,
) -> (ProviderStatus, i16) {
    match probe {
        Ok(report) if report.healthy => {
            let score = report.score();
            if score < degraded_health {
                (ProviderStatus::Degraded, score)
            } else {
                (ProviderStatus::Active, score)
            }
        }
        _ => (ProviderStatus::Inactive, 0),
    }
}

/// Whether a finished job counts as a failure against `provider_id`.
///
/// The per-provider result recorded by the processor decides; a failed job
/// without one only counts when it targeted nothing else.
fn failed_against(job: &sync_job::Model, provider_id: Uuid) -> bool {
    let recorded = job
        .metadata
        .get(format!("{}_results", job.action))
        .and_then(|results| results.get(provider_id.to_string()))
        .and_then(|outcome| outcome.get("success"))
        .and_then(|success| success.as_bool());

    match recorded {
        Some(success) => !success,
        None => job.status == JobStatus::Failed && job.target_providers() == [provider_id],
    }
}

pub struct FailoverMonitor {
    providers: ProviderRepository,
    events: FailoverEventRepository,
    catalog: CatalogRepository,
    jobs: Arc<dyn JobStore>,
    registry: Arc<ProviderRegistry>,
    config: FailoverConfig,
}

impl FailoverMonitor {
    pub fn new(
        providers: ProviderRepository,
        events: FailoverEventRepository,
        catalog: CatalogRepository,
        jobs: Arc<dyn JobStore>,
        registry: Arc<ProviderRegistry>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            providers,
            events,
            catalog,
            jobs,
            registry,
            config,
        }
    }

    /// Run health sweeps until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting failover monitor");
        let interval = self.config.health_interval();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Failover monitor shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    let started = Instant::now();
                    match self.tick().await {
                        Ok(report) => debug!(
                            checked = report.checked,
                            opened = report.opened.len(),
                            recovered = report.recovered.len(),
                            "Failover sweep completed"
                        ),
                        Err(err) => error!(error = ?err, "Failover sweep failed"),
                    }
                    histogram!("failover_sweep_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Failover monitor stopped");
    }

    /// One sweep over every provider. A provider whose bookkeeping fails is
    /// logged and skipped.
    pub async fn tick(&self) -> Result<MonitorReport, FailoverError> {
        let mut report = MonitorReport::default();

        for provider in self.providers.list_all().await? {
            report.checked += 1;
            match self.check_provider(&provider).await {
                Ok(check) => match self.evaluate(&provider, &check).await {
                    Ok(Some(event)) if event.event_type == FailoverKind::Failover => {
                        report.opened.push(event.id)
                    }
                    Ok(Some(event)) => report.recovered.push(event.id),
                    Ok(None) => {}
                    Err(err) => {
                        error!(provider_id = %provider.id, error = %err, "Failover evaluation failed")
                    }
                },
                Err(err) => {
                    error!(provider_id = %provider.id, error = %err, "Provider health check failed")
                }
            }
        }

        Ok(report)
    }

    /// Probes one provider and stores its status, score and check time.
    #[instrument(skip(self, provider), fields(provider_id = %provider.id, provider = %provider.name))]
    pub async fn check_provider(
        &self,
        provider: &provider::Model,
    ) -> Result<HealthCheck, FailoverError> {
        let probe = match self.registry.resolve(provider) {
            Ok(adapter) => adapter.health().await,
            Err(err) => Err(AdapterError::configuration(err.to_string())),
        };

        let (status, health) = classify_health(&probe, self.config.degraded_health);
        let (latency_ms, error) = match &probe {
            Ok(report) => (Some(report.latency_ms), None),
            Err(err) => (None, Some(err.to_string())),
        };

        if provider.status != status {
            info!(from = %provider.status, to = %status, health, "Provider status changed");
        }

        self.providers
            .record_health(provider.id, status.clone(), health)
            .await?;
        gauge!("provider_health", "provider" => provider.name.clone()).set(f64::from(health));

        Ok(HealthCheck {
            provider_id: provider.id,
            provider: provider.name.clone(),
            status,
            health,
            latency_ms,
            error,
        })
    }

    /// Length of the run of most recent finished jobs that failed against
    /// the provider, capped at the configured threshold.
    pub async fn consecutive_failures(&self, provider_id: Uuid) -> Result<usize, FailoverError> {
        let recent = self
            .jobs
            .list(&JobFilter {
                statuses: vec![JobStatus::Completed, JobStatus::Failed],
                provider_id: Some(provider_id),
                order: JobOrder::RecentlyUpdated,
                limit: Some(self.config.failure_threshold as u64),
                ..Default::default()
            })
            .await?;

        Ok(recent
            .iter()
            .take_while(|job| failed_against(job, provider_id))
            .count())
    }

    /// Opens or closes the provider's failover event after a check. Returns
    /// the event written, if any.
    async fn evaluate(
        &self,
        provider: &provider::Model,
        check: &HealthCheck,
    ) -> Result<Option<failover_event::Model>, FailoverError> {
        let failures = self.consecutive_failures(provider.id).await?;
        let threshold_hit = self.config.failure_threshold > 0 && failures >= self.config.failure_threshold;
        let failing = check.status == ProviderStatus::Inactive || threshold_hit;
        let open = self.events.find_active_for_provider(provider.id).await?;

        match open {
            None if failing => {
                let reason = if check.status == ProviderStatus::Inactive {
                    format!(
                        "Provider {} is unreachable: {}",
                        provider.name,
                        check.error.as_deref().unwrap_or("health check reported unhealthy")
                    )
                } else {
                    format!("{failures} consecutive sync jobs failed on provider {}", provider.name)
                };
                let event = self.open_failover(provider, check, failures, reason).await?;
                Ok(Some(event))
            }
            Some(event) if !failing && check.status == ProviderStatus::Active => {
                let recovery = self.record_recovery(provider, event).await?;
                Ok(Some(recovery))
            }
            _ => Ok(None),
        }
    }

    async fn open_failover(
        &self,
        provider: &provider::Model,
        check: &HealthCheck,
        failures: usize,
        reason: String,
    ) -> Result<failover_event::Model, FailoverError> {
        let fallback = self
            .providers
            .list_active()
            .await?
            .into_iter()
            .find(|candidate| candidate.id != provider.id);
        let affected = self.catalog.count_repositories_for_provider(provider.id).await?;

        warn!(
            provider_id = %provider.id,
            fallback_provider_id = ?fallback.as_ref().map(|p| p.id),
            affected_repos = affected,
            %reason,
            "Opening failover"
        );

        let event = self
            .events
            .create(NewFailoverEvent {
                kind: FailoverKind::Failover,
                provider_id: provider.id,
                fallback_provider_id: fallback.as_ref().map(|p| p.id),
                reason,
                affected_repos: i32::try_from(affected).unwrap_or(i32::MAX),
                status: FailoverStatus::Active,
                metadata: Some(json!({
                    "health": check.health,
                    "status": check.status,
                    "consecutive_failures": failures,
                    "fallback_provider": fallback.as_ref().map(|p| p.name.clone()),
                })),
                duration_seconds: None,
            })
            .await?;

        counter!("failover_events_total", "kind" => "failover").increment(1);
        Ok(event)
    }

    async fn record_recovery(
        &self,
        provider: &provider::Model,
        event: failover_event::Model,
    ) -> Result<failover_event::Model, FailoverError> {
        let resolved = self.events.resolve(event.id).await?;

        let recovery = self
            .events
            .create(NewFailoverEvent {
                kind: FailoverKind::Recovery,
                provider_id: provider.id,
                fallback_provider_id: resolved.fallback_provider_id,
                reason: format!("Provider {} recovered", provider.name),
                affected_repos: resolved.affected_repos,
                status: FailoverStatus::Completed,
                metadata: Some(json!({ "failover_event_id": resolved.id })),
                duration_seconds: resolved.duration_seconds,
            })
            .await?;

        info!(
            provider_id = %provider.id,
            failover_event_id = %resolved.id,
            duration_seconds = ?resolved.duration_seconds,
            "Provider recovered"
        );
        counter!("failover_events_total", "kind" => "recovery").increment(1);
        Ok(recovery)
    }

    /// Operator resolution of an active failover event.
    #[instrument(skip(self))]
    pub async fn resolve_failover(
        &self,
        event_id: Uuid,
    ) -> Result<failover_event::Model, FailoverError> {
        let event = self
            .events
            .find_by_id(event_id)
            .await?
            .ok_or(FailoverError::EventNotFound(event_id))?;

        if event.status != FailoverStatus::Active {
            return Err(FailoverError::NotActive {
                id: event_id,
                status: event.status,
            });
        }

        Ok(self.events.resolve(event_id).await?)
    }
}
