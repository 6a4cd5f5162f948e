use std::time::Duration;

use sqlx::{
    error::{DatabaseError, ErrorKind},
    postgres::PgDatabaseError,
    sqlite::SqliteError,
};
use thiserror::Error;

/// The standard result type used throughout the application.
pub type StdResult<T> = Result<T, anyhow::Error>;

/// The result type of the storage layer.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error returned by a single upstream fetch attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network level failure or server side (5xx) error
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The upstream throttled the call, optionally telling how long to wait
    #[error("Throttled by upstream (retry after {retry_after:?}): {message}")]
    Throttled {
        retry_after: Option<Duration>,
        message: String,
    },

    /// The credential was rejected
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    /// The request can not succeed as is (4xx, GraphQL error)
    #[error("Permanent request error: {0}")]
    PermanentRequest(String),

    /// The response could not be decoded
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The run was cancelled while the call was pending
    #[error("Cancelled")]
    Cancelled,
}

/// How a [FetchError] must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with the exponential schedule.
    Transient,
    /// Retry after the server hint if any, else with the exponential schedule.
    Throttled(Option<Duration>),
    /// Fail the batch, do not retry.
    Permanent,
    /// Fail the batch and abort the whole run.
    RunFatal,
    /// The run is shutting down.
    Cancelled,
}

impl FetchError {
    /// Classifies the error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::TransientNetwork(_) => ErrorClass::Transient,
            FetchError::Throttled { retry_after, .. } => ErrorClass::Throttled(*retry_after),
            FetchError::Unauthorized(_) => ErrorClass::RunFatal,
            FetchError::PermanentRequest(_) | FetchError::Malformed(_) => ErrorClass::Permanent,
            FetchError::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Whether the error must abort the whole run.
    pub fn is_run_fatal(&self) -> bool {
        self.class() == ErrorClass::RunFatal
    }
}

/// A batch that could not be fetched, with the number of attempts made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Batch fetch failed after {attempts} attempt(s): {error}")]
pub struct BatchFetchError {
    pub error: FetchError,
    pub attempts: u32,
}

impl BatchFetchError {
    /// Creates a new `BatchFetchError`.
    pub fn new(error: FetchError, attempts: u32) -> Self {
        Self { error, attempts }
    }
}

/// Storage layer error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Connection, pool or lock contention error, worth retrying
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// A constraint was violated, which the upsert/insert-or-ignore writes should never cause
    #[error("Storage integrity violation: {0}")]
    IntegrityViolation(String),

    /// Any other storage error (missing schema, decoding, configuration...)
    #[error("Invalid storage operation: {0}")]
    Invalid(String),

    /// The last error of an operation that was attempted several times
    #[error("Storage failed after {attempts} attempt(s): {last_error}")]
    Retried {
        attempts: u32,
        last_error: Box<StorageError>,
    },
}

impl StorageError {
    /// Whether the operation can be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    /// The number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            StorageError::Retried { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// The error of the last attempt.
    pub fn last_error(&self) -> &StorageError {
        match self {
            StorageError::Retried { last_error, .. } => last_error.last_error(),
            error => error,
        }
    }
}

/// SQLite primary result codes of a lock held by another connection.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Whether a database error reports a contention that may clear on retry.
fn is_contention(error: &dyn DatabaseError) -> bool {
    if let Some(error) = error.try_downcast_ref::<SqliteError>() {
        let primary_code = error
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff);
        return matches!(primary_code, Some(SQLITE_BUSY | SQLITE_LOCKED));
    }
    if let Some(error) = error.try_downcast_ref::<PgDatabaseError>() {
        let code = error.code();
        // Serialization failure, deadlock, lock not available, connection or resource errors.
        return matches!(code, "40001" | "40P01" | "55P03" | "57P01" | "57P03")
            || code.starts_with("08")
            || code.starts_with("53");
    }

    false
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        let message = error.to_string();
        match &error {
            sqlx::Error::Database(database_error) => match database_error.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StorageError::IntegrityViolation(message),
                _ if is_contention(&**database_error) => StorageError::Transient(message),
                _ => StorageError::Invalid(message),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::Transient(message),
            _ => StorageError::Invalid(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fetch_errors() {
        assert_eq!(
            ErrorClass::Transient,
            FetchError::TransientNetwork("reset".to_string()).class()
        );
        assert_eq!(
            ErrorClass::Throttled(Some(Duration::from_secs(3))),
            FetchError::Throttled {
                retry_after: Some(Duration::from_secs(3)),
                message: "slow down".to_string()
            }
            .class()
        );
        assert_eq!(
            ErrorClass::Permanent,
            FetchError::Malformed("eof".to_string()).class()
        );
        assert!(FetchError::Unauthorized("bad credentials".to_string()).is_run_fatal());
        assert!(!FetchError::PermanentRequest("not found".to_string()).is_run_fatal());
    }

    #[test]
    fn classifies_sqlx_errors() {
        assert!(StorageError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert_eq!(
            StorageError::Invalid(sqlx::Error::RowNotFound.to_string()),
            StorageError::from(sqlx::Error::RowNotFound)
        );
    }

    #[test]
    fn retried_error_keeps_the_attempts_and_the_cause() {
        let error = StorageError::Retried {
            attempts: 3,
            last_error: Box::new(StorageError::Transient("database is locked".to_string())),
        };

        assert_eq!(3, error.attempts());
        assert!(!error.is_transient());
        assert_eq!(
            &StorageError::Transient("database is locked".to_string()),
            error.last_error()
        );
        assert_eq!(
            1,
            StorageError::Invalid("no such table".to_string()).attempts()
        );
    }
}
