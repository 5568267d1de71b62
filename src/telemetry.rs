//! Global tracing subscriber installation.
//!
//! Logs go to stderr so operator commands can print JSON on stdout.

use std::any::type_name_of_val;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Noisy dependency targets capped at `warn` unless the base level is verbose.
const QUIET_TARGETS: &[&str] = &["sqlx", "sea_orm", "hyper", "reqwest"];

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Filter directives for a configured level. `RUST_LOG` replaces them
/// entirely when set.
pub fn filter_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    if matches!(level.as_str(), "debug" | "trace") {
        return level;
    }

    let mut directives = vec![level];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    directives.join(",")
}

/// Initialize global tracing exactly once, bridging `log::` records (sqlx
/// statements among them) into it.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        // Another LogTracer being registered already is fine.
        if !type_name_of_val(log::logger()).contains("LogTracer") {
            eprintln!("Warning: `log` records will not reach tracing: {err}");
        }
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config.log_level)));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().with_writer(io::stderr).boxed(),
        _ => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(io::stderr)
            .boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!("Warning: keeping the existing tracing subscriber: {err}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_targets_are_capped_at_default_levels() {
        assert_eq!(
            filter_directives("INFO"),
            "info,sqlx=warn,sea_orm=warn,hyper=warn,reqwest=warn"
        );
        assert_eq!(filter_directives("debug"), "debug");
    }

    #[test]
    fn repeated_initialization_is_harmless() {
        let config = AppConfig {
            log_format: "pretty".to_string(),
            ..AppConfig::default()
        };
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }
}
