use scheduler_admin_store::StoreError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::source::ResolverError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Index error: {0}")]
    Index(#[from] tantivy::TantivyError),

    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0} is closed")]
    Closed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn broker<E: std::fmt::Display>(e: E) -> Self {
        Self::Broker(e.to_string())
    }

    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed(what.into())
    }

    /// Classify error for retry logic
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Store(e) if e.is_transient() => ErrorCategory::Transient,
            SyncError::Store(_) => ErrorCategory::Permanent,
            SyncError::Index(e) => match e {
                tantivy::TantivyError::IoError(_) | tantivy::TantivyError::LockFailure(..) => {
                    ErrorCategory::Transient
                }
                _ => ErrorCategory::Permanent,
            },
            SyncError::Resolver(e) => e.category(),
            SyncError::Broker(_) | SyncError::Timeout(_) => ErrorCategory::Transient,
            SyncError::Config(_) | SyncError::Closed(_) => ErrorCategory::Permanent,
            SyncError::Join(_) | SyncError::Io(_) => ErrorCategory::Infrastructure,
            SyncError::Other(_) => ErrorCategory::Transient, // Default to retry
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., lock contention, broker hiccup)
    Transient,
    /// Permanent error - don't retry (e.g., invalid config, closed component)
    Permanent,
    /// Infrastructure error - alert ops (e.g., panicked task, disk failure)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(format!("invalid error category: {}", s)),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Infrastructure,
        ] {
            let parsed: ErrorCategory = category.as_str().parse().unwrap();
            assert_eq!(*category, parsed);
        }
    }

    #[test]
    fn test_error_category_invalid() {
        assert!("invalid".parse::<ErrorCategory>().is_err());
    }

    #[test]
    fn test_store_errors_classified_by_transience() {
        let flaky = SyncError::from(StoreError::io("disk hiccup"));
        let broken = SyncError::from(StoreError::serialization("bad row"));

        assert_eq!(flaky.category(), ErrorCategory::Transient);
        assert_eq!(broken.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_resolver_errors() {
        assert!(SyncError::from(ResolverError::NoHosts).is_transient());
        assert!(!SyncError::from(ResolverError::MissingBrokerInfo("s1".into())).is_transient());
    }

    #[test]
    fn test_closed_is_permanent() {
        let err = SyncError::closed("indexer");
        assert_eq!(err.to_string(), "indexer is closed");
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }
}
