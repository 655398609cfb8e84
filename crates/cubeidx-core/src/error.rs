//! Error types for schema initialization and index maintenance.
//!
//! Callers branch on the variant instead of catching by type: connectivity
//! problems, an uninitialised database, and a corrupt schema all need different
//! remediation, and index-level failures are usually aggregated into a
//! [`MaintenanceReport`](crate::maintain::MaintenanceReport) rather than returned.

use rusqlite::ErrorCode;
use std::fmt;
use thiserror::Error;

/// Result type used throughout cubeidx-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Where a connection was attempted, for error context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbTarget {
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
}

impl fmt::Display for DbTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}/{}", self.host, port, self.database),
            None => write!(f, "{}/{}", self.host, self.database),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The backend could not be reached. Never retried automatically.
    #[error("cannot connect to database at {target}: {source}")]
    Connection {
        target: DbTarget,
        #[source]
        source: rusqlite::Error,
    },

    /// Maintenance was attempted before `system init` ever succeeded.
    #[error("database not initialised (run `cubeidx system init` first)")]
    SchemaNotInitialized,

    /// The schema exists but is inconsistent, or an initializer lost a race.
    #[error("schema error: {message}")]
    Schema { message: String, transient: bool },

    /// A specific field index failed to build.
    #[error("failed to build index {index} for field {field}: {reason}")]
    IndexBuild {
        index: String,
        field: String,
        reason: String,
    },

    /// The permission grant step failed. Schema changes already applied stay.
    #[error("permission grant failed: {0}")]
    Permission(String),

    /// The selected backend lacks a requested capability.
    #[error("backend '{backend}' does not support {capability}")]
    Unsupported {
        backend: &'static str,
        capability: &'static str,
    },

    /// Invalid metadata type or field definition.
    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a fatal schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            transient: false,
        }
    }

    /// Create a schema error the caller may retry.
    pub fn schema_transient(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Schema { transient, .. } => *transient,
            Self::Sql(e) => is_busy(e),
            _ => false,
        }
    }
}

/// Busy/locked codes mean another connection holds the write lock.
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn is_interrupted(err: &rusqlite::Error) -> bool {
    matches!(err.sqlite_error_code(), Some(ErrorCode::OperationInterrupted))
}
