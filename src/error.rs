//! Error types shared by the persistence layer and helpers to classify
//! backend database errors.

use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;
use uuid::Uuid;

use crate::models::sync_job::JobStatus;

/// Errors raised by the job record store and catalog lookups.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("Can only update priority for queued jobs (job {id} is {status})")]
    PriorityLocked { id: Uuid, status: JobStatus },
    #[error("{0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn job_not_found(id: Uuid) -> Self {
        StoreError::NotFound { entity: "Job", id }
    }
}

/// Logs a database error with the operation it came from and hands it back.
pub fn map_db_err(context: &'static str, err: DbErr) -> DbErr {
    tracing::error!(error = ?err, context, "database operation failed");
    err
}

/// True when the error is a unique-key violation on Postgres or SQLite.
pub fn is_unique_violation(error: &DbErr) -> bool {
    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code = code.as_ref();
        code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_sqlx_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&DbErr::RecordNotFound(
            "missing".to_string()
        )));
        assert!(!is_unique_violation(&DbErr::Custom("boom".to_string())));
    }

    #[test]
    fn transition_error_names_both_states() {
        let id = Uuid::nil();
        let err = StoreError::InvalidTransition {
            id,
            from: JobStatus::Completed,
            to: JobStatus::Queued,
        };
        assert_eq!(
            err.to_string(),
            format!("job {id} cannot move from completed to queued")
        );
    }
}
