//! Error types for the storage layer
//!
//! Driver errors are translated exactly once, in `From<sqlx::Error>`,
//! into the taxonomy below. Nothing above the executor inspects raw
//! driver error types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// SQLite primary result codes that mean "try again later".
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Storage-wide error type
///
/// `Clone` so that a single failed load can be handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Lookup matched zero rows
    #[error("Resource not found")]
    NotFound,

    /// Unique or constraint violation on insert
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency version mismatch; re-fetch and retry
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Database busy or locked.
    ///
    /// Transient: consumed by the executor's retry loop and only
    /// ever surfaced as [`AppError::BusyTimeout`].
    #[error("Database busy")]
    Busy,

    /// Gave up retrying a busy database
    #[error("Database busy timeout (waited > {waited:?})")]
    BusyTimeout { waited: Duration },

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Caller's deadline passed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// One or more relations failed to populate
    #[error("Population failed: {0}")]
    Populate(MultiError),

    /// Caller passed something unusable (e.g. an unparsable domain)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Something that must never happen did
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Any other database error
    #[error("Database error: {0}")]
    Database(Arc<sqlx::Error>),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(Arc<anyhow::Error>),
}

impl AppError {
    /// Short label used for metrics and logs
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::Conflict(_) => "conflict",
            AppError::Busy => "busy",
            AppError::BusyTimeout { .. } => "busy_timeout",
            AppError::Cancelled => "cancelled",
            AppError::DeadlineExceeded => "deadline_exceeded",
            AppError::Populate(_) => "populate",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Config(_) => "config",
            AppError::Invariant(_) => "invariant",
            AppError::Database(_) => "database",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, AppError::Busy)
    }
}

fn is_busy_code(code: &str) -> bool {
    // SQLite reports extended codes; the low byte is the primary code.
    code.parse::<i64>()
        .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref().is_some_and(is_busy_code) {
                    return AppError::Busy;
                }
                if db_err.is_unique_violation() {
                    return AppError::AlreadyExists(db_err.message().to_string());
                }
                AppError::Database(Arc::new(err))
            }
            _ => AppError::Database(Arc::new(err)),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(Arc::new(err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(Arc::new(anyhow::anyhow!("Migration failed: {}", err)))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// =============================================================================
// MultiError
// =============================================================================

/// A collection of labeled failures
///
/// Used while populating relations: every relation that fails to
/// resolve adds an entry, and the caller gets all of them at once.
#[derive(Debug, Clone, Default)]
pub struct MultiError {
    errors: Vec<(String, AppError)>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure under the given label
    pub fn push(&mut self, label: impl Into<String>, err: AppError) {
        self.errors.push((label.into(), err));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AppError)> {
        self.errors.iter().map(|(label, err)| (label.as_str(), err))
    }

    /// `Ok(())` when nothing was recorded, otherwise [`AppError::Populate`]
    pub fn combine(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Populate(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (label, err)) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", label, err)?;
        }
        Ok(())
    }
}
