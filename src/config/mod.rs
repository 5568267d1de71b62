//! Configuration loading for the mirror-sync job subsystem.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `MIRRORSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "MIRRORSYNC_";

/// Application configuration derived from `MIRRORSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub providers: ProviderClientConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub sync_author: SyncAuthorConfig,
}

/// Durable queue behaviour: attempt cap, backoff and retention horizons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Total delivery attempts per queue cycle, including the first one.
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: i32,
    /// First retry delay; doubles for each subsequent attempt.
    #[serde(default = "default_queue_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_completed_retention_seconds")]
    pub completed_retention_seconds: u64,
    #[serde(default = "default_completed_retention_count")]
    pub completed_retention_count: u64,
    #[serde(default = "default_failed_retention_seconds")]
    pub failed_retention_seconds: u64,
    #[serde(default = "default_failed_retention_count")]
    pub failed_retention_count: u64,
}

/// Worker pool sizing and lease timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerConfig {
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_worker_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_worker_maintenance_interval_seconds")]
    pub maintenance_interval_seconds: u64,
    #[serde(default = "default_worker_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
}

/// HTTP client settings shared by every provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProviderClientConfig {
    #[serde(default = "default_provider_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_provider_user_agent")]
    pub user_agent: String,
}

/// Thresholds used by the failover monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FailoverConfig {
    /// Consecutive failed jobs against one provider before a failover opens.
    #[serde(default = "default_failover_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_failover_health_interval_seconds")]
    pub health_interval_seconds: u64,
    /// Health score below which a reachable provider is reported degraded.
    #[serde(default = "default_failover_degraded_health")]
    pub degraded_health: i16,
}

/// Commit author used for pushes that do not carry their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncAuthorConfig {
    #[serde(default = "default_sync_author_name")]
    pub name: String,
    #[serde(default = "default_sync_author_email")]
    pub email: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            providers: ProviderClientConfig::default(),
            failover: FailoverConfig::default(),
            sync_author: SyncAuthorConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_attempts: default_queue_max_attempts(),
            backoff_base_ms: default_queue_backoff_base_ms(),
            completed_retention_seconds: default_completed_retention_seconds(),
            completed_retention_count: default_completed_retention_count(),
            failed_retention_seconds: default_failed_retention_seconds(),
            failed_retention_count: default_failed_retention_count(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            poll_interval_ms: default_worker_poll_interval_ms(),
            lease_seconds: default_worker_lease_seconds(),
            maintenance_interval_seconds: default_worker_maintenance_interval_seconds(),
            job_timeout_seconds: default_worker_job_timeout_seconds(),
        }
    }
}

impl Default for ProviderClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_provider_timeout_seconds(),
            user_agent: default_provider_user_agent(),
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failover_failure_threshold(),
            health_interval_seconds: default_failover_health_interval_seconds(),
            degraded_health: default_failover_degraded_health(),
        }
    }
}

impl Default for SyncAuthorConfig {
    fn default() -> Self {
        Self {
            name: default_sync_author_name(),
            email: default_sync_author_email(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }

        if !(1..=10).contains(&self.max_attempts) {
            return Err(ConfigError::InvalidQueueMaxAttempts {
                value: self.max_attempts,
            });
        }

        if self.backoff_base_ms == 0 || self.backoff_base_ms > 600_000 {
            return Err(ConfigError::InvalidQueueBackoff {
                value: self.backoff_base_ms,
            });
        }

        if self.completed_retention_count == 0 || self.failed_retention_count == 0 {
            return Err(ConfigError::InvalidQueueRetention {
                completed: self.completed_retention_count,
                failed: self.failed_retention_count,
            });
        }

        Ok(())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > 100 {
            return Err(ConfigError::InvalidWorkerConcurrency {
                value: self.concurrency,
            });
        }

        // Heartbeats run at a third of the lease; anything shorter thrashes the store.
        if self.lease_seconds < 3 {
            return Err(ConfigError::InvalidWorkerLease {
                value: self.lease_seconds,
            });
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidWorkerPollInterval {
                value: self.poll_interval_ms,
            });
        }

        if self.job_timeout_seconds == 0 {
            return Err(ConfigError::InvalidWorkerJobTimeout {
                value: self.job_timeout_seconds,
            });
        }

        Ok(())
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_seconds.max(1))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }
}

impl ProviderClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_seconds == 0 || self.timeout_seconds > 300 {
            return Err(ConfigError::InvalidProviderTimeout {
                value: self.timeout_seconds,
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl FailoverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailoverThreshold {
                value: self.failure_threshold,
            });
        }

        if !(0..=100).contains(&self.degraded_health) {
            return Err(ConfigError::InvalidFailoverDegradedHealth {
                value: self.degraded_health,
            });
        }

        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_seconds.max(1))
    }
}

impl AppConfig {
    /// Serializes the configuration with credentials in the database URL masked.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        config.database_url = redact_database_url(&config.database_url);
        serde_json::to_string_pretty(&config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }

        self.queue.validate()?;
        self.worker.validate()?;
        self.providers.validate()?;
        self.failover.validate()?;

        Ok(())
    }

    /// Local and test profiles get human-readable logs unless overridden.
    pub fn is_local_like(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }
}

fn redact_database_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            // set_password only fails for cannot-be-a-base URLs, which have no password.
            let _ = parsed.set_password(Some("[REDACTED]"));
            parsed.to_string()
        }
        _ => raw.to_string(),
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://mirror-sync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_queue_name() -> String {
    "sync-jobs".to_string()
}

fn default_queue_max_attempts() -> i32 {
    3
}

fn default_queue_backoff_base_ms() -> u64 {
    2000
}

fn default_completed_retention_seconds() -> u64 {
    3600 // 1 hour
}

fn default_completed_retention_count() -> u64 {
    100
}

fn default_failed_retention_seconds() -> u64 {
    86400 // 24 hours
}

fn default_failed_retention_count() -> u64 {
    500
}

fn default_worker_concurrency() -> usize {
    5
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_lease_seconds() -> u64 {
    30
}

fn default_worker_maintenance_interval_seconds() -> u64 {
    15
}

fn default_worker_job_timeout_seconds() -> u64 {
    600 // 10 minutes
}

fn default_provider_timeout_seconds() -> u64 {
    30
}

fn default_provider_user_agent() -> String {
    format!("mirror-sync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_failover_failure_threshold() -> usize {
    3
}

fn default_failover_health_interval_seconds() -> u64 {
    300 // 5 minutes
}

fn default_failover_degraded_health() -> i16 {
    50
}

fn default_sync_author_name() -> String {
    "Mirror Sync".to_string()
}

fn default_sync_author_email() -> String {
    "sync@mirror-sync.local".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("database URL is missing; set MIRRORSYNC_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("database max connections must be positive, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("queue name must not be empty")]
    EmptyQueueName,
    #[error("queue max attempts must be between 1 and 10, got {value}")]
    InvalidQueueMaxAttempts { value: i32 },
    #[error("queue backoff base must be between 1 and 600000 milliseconds, got {value}")]
    InvalidQueueBackoff { value: u64 },
    #[error(
        "queue retention counts must be positive (completed: {completed}, failed: {failed})"
    )]
    InvalidQueueRetention { completed: u64, failed: u64 },
    #[error("worker concurrency must be between 1 and 100, got {value}")]
    InvalidWorkerConcurrency { value: usize },
    #[error("worker lease must be at least 3 seconds, got {value}")]
    InvalidWorkerLease { value: u64 },
    #[error("worker poll interval must be positive, got {value}")]
    InvalidWorkerPollInterval { value: u64 },
    #[error("worker job timeout must be positive, got {value}")]
    InvalidWorkerJobTimeout { value: u64 },
    #[error("provider timeout must be between 1 and 300 seconds, got {value}")]
    InvalidProviderTimeout { value: u64 },
    #[error("failover failure threshold must be at least 1, got {value}")]
    InvalidFailoverThreshold { value: usize },
    #[error("failover degraded health must be between 0 and 100, got {value}")]
    InvalidFailoverDegradedHealth { value: i16 },
}

/// Loads configuration using layered `.env` files and `MIRRORSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| {
                if matches!(profile.as_str(), "local" | "test") {
                    "pretty".to_string()
                } else {
                    default_log_format()
                }
            });
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(
            &mut layered,
            "DB_MAX_CONNECTIONS",
            default_db_max_connections,
        );
        let db_acquire_timeout_ms = take_parsed(
            &mut layered,
            "DB_ACQUIRE_TIMEOUT_MS",
            default_db_acquire_timeout_ms,
        );

        let queue = QueueConfig {
            name: layered
                .remove("QUEUE_NAME")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_queue_name),
            max_attempts: take_parsed(
                &mut layered,
                "QUEUE_MAX_ATTEMPTS",
                default_queue_max_attempts,
            ),
            backoff_base_ms: take_parsed(
                &mut layered,
                "QUEUE_BACKOFF_BASE_MS",
                default_queue_backoff_base_ms,
            ),
            completed_retention_seconds: take_parsed(
                &mut layered,
                "QUEUE_COMPLETED_RETENTION_SECONDS",
                default_completed_retention_seconds,
            ),
            completed_retention_count: take_parsed(
                &mut layered,
                "QUEUE_COMPLETED_RETENTION_COUNT",
                default_completed_retention_count,
            ),
            failed_retention_seconds: take_parsed(
                &mut layered,
                "QUEUE_FAILED_RETENTION_SECONDS",
                default_failed_retention_seconds,
            ),
            failed_retention_count: take_parsed(
                &mut layered,
                "QUEUE_FAILED_RETENTION_COUNT",
                default_failed_retention_count,
            ),
        };

        let worker = WorkerConfig {
            concurrency: take_parsed(
                &mut layered,
                "WORKER_CONCURRENCY",
                default_worker_concurrency,
            ),
            poll_interval_ms: take_parsed(
                &mut layered,
                "WORKER_POLL_INTERVAL_MS",
                default_worker_poll_interval_ms,
            ),
            lease_seconds: take_parsed(
                &mut layered,
                "WORKER_LEASE_SECONDS",
                default_worker_lease_seconds,
            ),
            maintenance_interval_seconds: take_parsed(
                &mut layered,
                "WORKER_MAINTENANCE_INTERVAL_SECONDS",
                default_worker_maintenance_interval_seconds,
            ),
            job_timeout_seconds: take_parsed(
                &mut layered,
                "WORKER_JOB_TIMEOUT_SECONDS",
                default_worker_job_timeout_seconds,
            ),
        };

        let providers = ProviderClientConfig {
            timeout_seconds: take_parsed(
                &mut layered,
                "PROVIDER_TIMEOUT_SECONDS",
                default_provider_timeout_seconds,
            ),
            user_agent: layered
                .remove("PROVIDER_USER_AGENT")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_provider_user_agent),
        };

        let failover = FailoverConfig {
            failure_threshold: take_parsed(
                &mut layered,
                "FAILOVER_FAILURE_THRESHOLD",
                default_failover_failure_threshold,
            ),
            health_interval_seconds: take_parsed(
                &mut layered,
                "FAILOVER_HEALTH_INTERVAL_SECONDS",
                default_failover_health_interval_seconds,
            ),
            degraded_health: take_parsed(
                &mut layered,
                "FAILOVER_DEGRADED_HEALTH",
                default_failover_degraded_health,
            ),
        };

        let sync_author = SyncAuthorConfig {
            name: layered
                .remove("SYNC_AUTHOR_NAME")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_sync_author_name),
            email: layered
                .remove("SYNC_AUTHOR_EMAIL")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_sync_author_email),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            queue,
            worker,
            providers,
            failover,
            sync_author,
        };

        config.validate()?;

        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes `key` and parses it, falling back to `default` when absent or unparsable.
fn take_parsed<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: impl FnOnce() -> T,
) -> T {
    layered
        .remove(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(default)
}
