//! Error taxonomy shared across the scheduling subsystem.
//!
//! The kind is preserved through every layer so the HTTP layer can map an
//! operation failure to the matching status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed definition, action, or payload; empty required field.
    #[error("invalid request: {0}")]
    ContractInvalid(String),

    /// Unknown job or record identity.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate job name on add.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Trigger-engine construction or shutdown failure.
    #[error("scheduler failure: {0}")]
    Server(String),

    /// Store failure.
    #[error("database failure: {0}")]
    Database(String),
}

/// Coarse classification used for HTTP status mapping and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ContractInvalid,
    NotFound,
    Conflict,
    Server,
    Database,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::ContractInvalid(_) => ErrorKind::ContractInvalid,
            SchedulerError::NotFound(_) => ErrorKind::NotFound,
            SchedulerError::Conflict(_) => ErrorKind::Conflict,
            SchedulerError::Server(_) => ErrorKind::Server,
            SchedulerError::Database(_) => ErrorKind::Database,
        }
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => {
                SchedulerError::NotFound("no matching row".to_string())
            }
            other => SchedulerError::Database(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for SchedulerError {
    fn from(e: r2d2::Error) -> Self {
        SchedulerError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
