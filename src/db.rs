//! Database pool shared by the job record store and the durable queue.
//!
//! Both live in one database, so an in-memory SQLite URL is pinned to a
//! single pooled connection; a second connection would see an empty schema.

use anyhow::{Context, Result};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::AppConfig;

const CONNECT_ATTEMPTS: u32 = 5;
const FIRST_CONNECT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: sea_orm::DbErr,
    },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

fn is_in_memory_sqlite(url: &str) -> bool {
    url.starts_with("sqlite:") && (url.contains(":memory:") || url.contains("mode=memory"))
}

/// Pool options derived from configuration.
pub fn connect_options(cfg: &AppConfig) -> Result<ConnectOptions, DatabaseError> {
    let url = cfg.database_url.trim();
    if url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Database URL cannot be empty".to_string(),
        });
    }

    let mut opt = ConnectOptions::new(url);
    opt.acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    if is_in_memory_sqlite(url) {
        // The database disappears with its connection, so never recycle it.
        opt.max_connections(1).min_connections(1);
    } else {
        opt.max_connections(cfg.db_max_connections)
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800));
    }
    Ok(opt)
}

/// Connects, retrying transient failures with a doubling delay.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    let opt = connect_options(cfg)?;
    let mut delay = FIRST_CONNECT_DELAY;
    let mut attempt = 1;

    loop {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                log::info!("Connected to database (attempt {attempt})");
                return Ok(conn);
            }
            Err(source) if attempt >= CONNECT_ATTEMPTS => {
                log::error!("Giving up on database after {attempt} attempts: {source}");
                return Err(DatabaseError::ConnectionFailed {
                    attempts: attempt,
                    source,
                }
                .into());
            }
            Err(err) => {
                log::warn!("Database connection attempt {attempt} failed: {err}; retrying in {delay:?}");
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// Applies every pending migration.
pub async fn migrate(db: &DatabaseConnection) -> Result<()> {
    Migrator::up(db, None)
        .await
        .context("applying database migrations")?;
    Ok(())
}

pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt)
        .await
        .context("Database health check failed")?;
    Ok(())
}
