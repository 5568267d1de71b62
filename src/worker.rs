//! # Worker Pool
//!
//! Leases jobs from the durable queue and runs them through the
//! [`SyncProcessor`] with at most `concurrency` executions in flight.
//!
//! The pool is `stopped` until [`WorkerPool::start`] spawns the loop and is
//! `running` until [`WorkerPool::stop`] cancels it and drains in-flight
//! jobs. While running it can be paused: nothing new is leased, running
//! jobs finish, and maintenance (stalled-lease reclaim, retention pruning)
//! keeps going. Lifecycle events are broadcast for monitoring only.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, broadcast, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::processor::{ProgressSink, SyncProcessor};
use crate::queue::{Delivery, DurableQueue, FailOutcome, STALLED_REASON};
use crate::repositories::{JobOutcome, JobStore};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications. Dropped when nobody is subscribed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Active { job_id: Uuid, attempt: i32 },
    Progress { job_id: Uuid, progress: i16 },
    Completed { job_id: Uuid, message: String },
    Failed { job_id: Uuid, error: String, will_retry: bool },
    Stalled { job_id: Uuid },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub name: String,
    pub is_running: bool,
    pub is_paused: bool,
    pub concurrency: usize,
    pub in_flight: usize,
}

enum PoolState {
    Stopped,
    Running {
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
    },
}

/// State shared between the pool handle and its loop.
struct PoolInner {
    name: String,
    worker_id: String,
    queue: DurableQueue,
    processor: Arc<SyncProcessor>,
    jobs: Arc<dyn JobStore>,
    config: WorkerConfig,
    paused: watch::Sender<bool>,
    events: broadcast::Sender<WorkerEvent>,
    in_flight: Arc<AtomicUsize>,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        queue: DurableQueue,
        processor: Arc<SyncProcessor>,
        jobs: Arc<dyn JobStore>,
        config: WorkerConfig,
    ) -> Self {
        let name = name.into();
        let worker_id = format!("{name}:{}", Uuid::new_v4());
        let (paused, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(PoolInner {
                name,
                worker_id,
                queue,
                processor,
                jobs,
                config,
                paused,
                events,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
            state: Mutex::new(PoolState::Stopped),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Spawns the worker loop. Calling it on a running pool does nothing.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, PoolState::Running { .. }) {
            info!(worker = %self.inner.name, "Worker already running");
            return;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run(shutdown.clone()));
        *state = PoolState::Running { shutdown, handle };

        info!(
            worker = %self.inner.name,
            concurrency = self.inner.config.concurrency,
            "Worker started"
        );
    }

    /// Stops leasing and waits for in-flight jobs. Calling it on a stopped
    /// pool does nothing.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let PoolState::Running { shutdown, handle } =
            std::mem::replace(&mut *state, PoolState::Stopped)
        else {
            info!(worker = %self.inner.name, "Worker already stopped");
            return;
        };

        shutdown.cancel();
        if let Err(err) = handle.await {
            error!(worker = %self.inner.name, error = %err, "Worker loop panicked");
        }
        info!(worker = %self.inner.name, "Worker stopped");
    }

    pub fn pause(&self) {
        if !self.inner.paused.send_replace(true) {
            info!(worker = %self.inner.name, "Worker paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.send_replace(false) {
            info!(worker = %self.inner.name, "Worker resumed");
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, PoolState::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub async fn stats(&self) -> WorkerStats {
        WorkerStats {
            name: self.inner.name.clone(),
            is_running: self.is_running().await,
            is_paused: self.is_paused(),
            concurrency: self.inner.config.concurrency,
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Progress sink mirroring checkpoints onto the queue entry.
struct QueueProgress<'a> {
    queue: &'a DurableQueue,
    events: &'a broadcast::Sender<WorkerEvent>,
}

#[async_trait]
impl ProgressSink for QueueProgress<'_> {
    async fn report(&self, job_id: Uuid, progress: i16) {
        if let Err(err) = self.queue.update_progress(job_id, progress).await {
            debug!(%job_id, error = %err, "failed to mirror progress to queue");
        }
        let _ = self.events.send(WorkerEvent::Progress { job_id, progress });
    }
}

/// Idle wait between empty polls, stretched by up to 20% so pools started
/// together do not poll in lockstep.
fn idle_delay<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    base + base.mul_f64(rng.gen_range(0.0..=0.2))
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "Job task panicked");
    }
}

impl PoolInner {
    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut paused = self.paused.subscribe();
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval());
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *paused.borrow_and_update() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = paused.changed() => {}
                    _ = maintenance.tick() => self.maintain().await,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
                }
                continue;
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = paused.changed() => continue,
                _ = maintenance.tick() => {
                    self.maintain().await;
                    continue;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = match self
                .queue
                .lease_next(&self.worker_id, self.config.lease())
                .await
            {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    self.idle(&shutdown, &mut paused).await;
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    error!(worker = %self.name, error = %err, "Failed to lease job");
                    self.emit(WorkerEvent::Error {
                        message: err.to_string(),
                    });
                    self.idle(&shutdown, &mut paused).await;
                    continue;
                }
            };

            let worker = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.execute(delivery).await;
            });
        }

        info!(worker = %self.name, in_flight = tasks.len(), "Draining in-flight jobs");
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
    }

    async fn idle(&self, shutdown: &CancellationToken, paused: &mut watch::Receiver<bool>) {
        let delay = idle_delay(self.config.poll_interval(), &mut rand::thread_rng());
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = paused.changed() => {}
            _ = sleep(delay) => {}
        }
    }

    async fn execute(self: Arc<Self>, delivery: Delivery) {
        let job_id = delivery.job_id;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        gauge!("worker_jobs_in_flight", "worker" => self.name.clone()).increment(1.0);
        let in_flight = self.in_flight.clone();
        let worker_name = self.name.clone();
        scopeguard::defer! {
            in_flight.fetch_sub(1, Ordering::SeqCst);
            gauge!("worker_jobs_in_flight", "worker" => worker_name.clone()).decrement(1.0);
        }

        self.emit(WorkerEvent::Active {
            job_id,
            attempt: delivery.attempt,
        });
        info!(%job_id, attempt = delivery.attempt, "Job active");

        let heartbeat = scopeguard::guard(self.spawn_heartbeat(job_id), |handle| handle.abort());

        let sink = QueueProgress {
            queue: &self.queue,
            events: &self.events,
        };
        let outcome = self.processor.process(&delivery, &sink).await;
        drop(heartbeat);

        match outcome {
            Ok(result) if result.success => {
                match self
                    .queue
                    .complete(job_id, &self.worker_id, result.to_json())
                    .await
                {
                    Ok(true) => {
                        counter!("worker_jobs_completed_total", "worker" => self.name.clone())
                            .increment(1);
                        self.emit(WorkerEvent::Completed {
                            job_id,
                            message: result.message,
                        });
                    }
                    Ok(false) => warn!(%job_id, "Lease lost before completion was acknowledged"),
                    Err(err) => {
                        error!(%job_id, error = %err, "Failed to acknowledge completion");
                        self.emit(WorkerEvent::Error {
                            message: err.to_string(),
                        });
                    }
                }
            }
            Ok(result) => {
                let reason = result.error().unwrap_or_else(|| result.message.clone());
                self.fail(job_id, &reason, false).await;
            }
            Err(err) => {
                self.fail(job_id, &err.to_string(), err.is_retryable())
                    .await;
            }
        }
    }

    async fn fail(&self, job_id: Uuid, reason: &str, retryable: bool) {
        counter!("worker_jobs_failed_total", "worker" => self.name.clone()).increment(1);

        match self
            .queue
            .fail(job_id, &self.worker_id, reason, retryable)
            .await
        {
            Ok(FailOutcome::Retrying { .. }) => self.emit(WorkerEvent::Failed {
                job_id,
                error: reason.to_string(),
                will_retry: true,
            }),
            Ok(FailOutcome::Failed { .. }) => self.emit(WorkerEvent::Failed {
                job_id,
                error: reason.to_string(),
                will_retry: false,
            }),
            Ok(FailOutcome::LeaseLost) => {
                warn!(%job_id, "Lease lost before failure was recorded");
            }
            Err(err) => {
                error!(%job_id, error = %err, "Failed to record job failure in queue");
                self.emit(WorkerEvent::Error {
                    message: err.to_string(),
                });
            }
        }
    }

    /// Renews the lease every third of its length until aborted or lost.
    fn spawn_heartbeat(&self, job_id: Uuid) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let worker_id = self.worker_id.clone();
        let lease = self.config.lease();
        let every = lease / 3;

        tokio::spawn(async move {
            loop {
                sleep(every).await;
                match queue.heartbeat(job_id, &worker_id, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%job_id, "Lease lost, stopping heartbeat");
                        break;
                    }
                    Err(err) => warn!(%job_id, error = %err, "Heartbeat failed"),
                }
            }
        })
    }

    /// Reclaims expired leases and prunes finished entries.
    async fn maintain(&self) {
        match self.queue.reclaim_stalled().await {
            Ok(report) => {
                for job_id in report.requeued {
                    self.emit(WorkerEvent::Stalled { job_id });
                }
                for job_id in report.failed {
                    self.emit(WorkerEvent::Stalled { job_id });
                    if let Err(err) = self
                        .jobs
                        .finish(job_id, JobOutcome::failed(STALLED_REASON))
                        .await
                    {
                        debug!(%job_id, error = %err, "Could not mark stalled job failed");
                    }
                    self.emit(WorkerEvent::Failed {
                        job_id,
                        error: STALLED_REASON.to_string(),
                        will_retry: false,
                    });
                }
            }
            Err(err) => {
                error!(worker = %self.name, error = %err, "Stalled job reclaim failed");
                self.emit(WorkerEvent::Error {
                    message: err.to_string(),
                });
            }
        }

        if let Err(err) = self.queue.prune().await {
            warn!(worker = %self.name, error = %err, "Queue pruning failed");
        }
        if let Err(err) = self.queue.counts().await {
            debug!(error = %err, "Queue depth refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn idle_delay_stays_within_jitter_bounds() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let delay = idle_delay(base, &mut rng);
            assert!(delay >= base);
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = WorkerEvent::Failed {
            job_id: Uuid::nil(),
            error: "boom".to_string(),
            will_retry: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "failed");
        assert_eq!(value["will_retry"], true);
    }
}
