//! Error types for the migration coordinator.
//!
//! Every error carries a stable machine-readable code (see [`Error::code`])
//! and a retry classification (see [`Error::is_retryable`]). The orchestrator
//! uses the classification to decide between local retry with backoff and
//! immediate failure of the migration.

use std::io;
use thiserror::Error;

use crate::types::{MigrationId, MigrationStatus};

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the migration coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Bad input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Could not reach a database.
    #[error("database connection error: {0}")]
    DatabaseConnection(String),

    /// A query against a reachable database failed.
    #[error("database query error: {0}")]
    DatabaseQuery(String),

    /// Execution failed after local retries were exhausted.
    #[error("migration error: {0}")]
    Migration(String),

    /// No migration with this id.
    #[error("migration not found: {0}")]
    MigrationNotFound(MigrationId),

    /// A migration with this name, version and attempt already exists.
    #[error("migration already exists: {name} v{version}")]
    MigrationAlreadyExists { name: String, version: String },

    /// A migration with this name is already in flight.
    #[error("migration in progress: {0}")]
    MigrationInProgress(MigrationId),

    /// Compare-and-swap on the migration status failed.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: MigrationId,
        from: MigrationStatus,
        to: MigrationStatus,
    },

    /// Another holder owns an unexpired lock on the resource.
    #[error("lock on {resource} held by {holder}")]
    LockHeld { resource: String, holder: String },

    /// Release was attempted by a handle that no longer owns the lock.
    #[error("lock on {0} not held")]
    LockNotHeld(String),

    /// The lock lapsed or was taken over by another holder.
    #[error("lock on {0} expired")]
    LockExpired(String),

    /// No shard matched the requested target.
    #[error("shard not found: {0}")]
    ShardNotFound(String),

    /// A dependency returned an error.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// A dependency did not answer in time.
    #[error("external service timeout: {0}")]
    ExternalServiceTimeout(String),

    /// A dependency is currently unavailable.
    #[error("external service unavailable: {0}")]
    ExternalServiceUnavailable(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Storage layer errors (file or store I/O).
    #[error("storage error: {0}")]
    Storage(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error code exposed to API callers and persisted with events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::DatabaseConnection(_) => "DATABASE_CONNECTION_ERROR",
            Error::DatabaseQuery(_) => "DATABASE_QUERY_ERROR",
            Error::Migration(_) => "MIGRATION_ERROR",
            Error::MigrationNotFound(_) => "MIGRATION_NOT_FOUND",
            Error::MigrationAlreadyExists { .. } => "MIGRATION_ALREADY_EXISTS",
            Error::MigrationInProgress(_) => "MIGRATION_IN_PROGRESS",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::LockHeld { .. } => "LOCK_HELD",
            Error::LockNotHeld(_) => "LOCK_NOT_HELD",
            Error::LockExpired(_) => "LOCK_EXPIRED",
            Error::ShardNotFound(_) => "SHARD_NOT_FOUND",
            Error::ExternalService(_) => "EXTERNAL_SERVICE_ERROR",
            Error::ExternalServiceTimeout(_) => "EXTERNAL_SERVICE_TIMEOUT",
            Error::ExternalServiceUnavailable(_) => "EXTERNAL_SERVICE_UNAVAILABLE",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "DATABASE_ERROR",
            Error::Cancelled => "CANCELLED",
            Error::Timeout => "TIMEOUT",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the orchestrator should retry the failed operation locally.
    ///
    /// Transient infrastructure failures and lock contention are retryable.
    /// Structural errors (bad input, missing shard, invalid transition)
    /// propagate immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DatabaseConnection(_)
                | Error::DatabaseQuery(_)
                | Error::LockHeld { .. }
                | Error::ExternalService(_)
                | Error::ExternalServiceTimeout(_)
                | Error::ExternalServiceUnavailable(_)
                | Error::Storage(_)
                | Error::Timeout
        )
    }

    /// Whether this error is the caller's fault rather than an execution failure.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::MigrationNotFound(_)
                | Error::MigrationAlreadyExists { .. }
                | Error::MigrationInProgress(_)
                | Error::InvalidTransition { .. }
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Storage(e.to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Storage(format!("encoding: {}", e))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::DatabaseConnection("refused".into()).is_retryable());
        assert!(Error::ExternalServiceTimeout("slow".into()).is_retryable());
        assert!(Error::LockHeld {
            resource: "migration:a".into(),
            holder: "w1".into()
        }
        .is_retryable());

        assert!(!Error::Validation("empty name".into()).is_retryable());
        assert!(!Error::ShardNotFound("orders".into()).is_retryable());
        assert!(!Error::InvalidTransition {
            id: MigrationId::new(),
            from: MigrationStatus::Succeeded,
            to: MigrationStatus::Running,
        }
        .is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(Error::ShardNotFound("x".into()).code(), "SHARD_NOT_FOUND");
        assert_eq!(
            Error::MigrationNotFound(MigrationId::new()).code(),
            "MIGRATION_NOT_FOUND"
        );
        assert_eq!(
            Error::ExternalServiceUnavailable("x".into()).code(),
            "EXTERNAL_SERVICE_UNAVAILABLE"
        );
    }

    #[test]
    fn test_io_conversion() {
        let timed_out: Error = io::Error::new(io::ErrorKind::TimedOut, "t").into();
        assert_eq!(timed_out, Error::Timeout);

        let other: Error = io::Error::new(io::ErrorKind::PermissionDenied, "p").into();
        assert!(matches!(other, Error::Storage(_)));
    }
}
