//! Error types for scheduler-admin-store

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// The store (or one of its channels) has been closed
    Closed,
    /// The watch stream was already handed out
    AlreadyWatched,
    /// Configuration errors
    Config,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Closed => "closed",
            ErrorKind::AlreadyWatched => "already_watched",
            ErrorKind::Config => "config",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StoreError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn closed(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, format!("{} is closed", what.into()))
    }

    pub fn already_watched() -> Self {
        Self::new(
            ErrorKind::AlreadyWatched,
            "watch stream has already been taken",
        )
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IO, message)
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Only SQLite lock contention (`SQLITE_BUSY`/`SQLITE_LOCKED` on the
    /// source error) and I/O errors qualify; everything else is permanent for
    /// the batch that produced it.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ErrorKind::Database => self.is_lock_contention(),
            ErrorKind::IO => true,
            ErrorKind::Serialization
            | ErrorKind::Closed
            | ErrorKind::AlreadyWatched
            | ErrorKind::Config => false,
        }
    }

    #[cfg(feature = "sqlite")]
    fn is_lock_contention(&self) -> bool {
        use rusqlite::ErrorCode;

        self.source
            .as_deref()
            .and_then(|source| source.downcast_ref::<rusqlite::Error>())
            .and_then(rusqlite::Error::sqlite_error_code)
            .is_some_and(|code| matches!(code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked))
    }

    #[cfg(not(feature = "sqlite"))]
    fn is_lock_contention(&self) -> bool {
        false
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::io(format!("I/O error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;
