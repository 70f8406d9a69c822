//! Error types for the transfer library.

use thiserror::Error;

/// Classification of object-store failures.
///
/// The engine only branches on the permanent kinds; everything else is
/// retried with linear backoff up to the configured attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Source object does not exist (or the requested version is gone).
    NoSuchKey,
    /// Source object is not accessible with the current credentials.
    AccessDenied,
    /// The multipart upload id is no longer valid - another worker has
    /// completed or aborted it.
    NoSuchUpload,
    /// Anything else: network failures, throttling, 5xx responses.
    Other,
}

impl StoreErrorKind {
    /// Permanent failures are never retried at the part level.
    pub fn is_permanent(self) -> bool {
        !matches!(self, StoreErrorKind::Other)
    }
}

/// Main error type for transfer operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Object store error with failure classification.
    #[error("Store error ({kind:?}): {message}")]
    Store {
        kind: StoreErrorKind,
        message: String,
    },

    /// Job queue error.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Progress ledger error.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Queue message that cannot be normalized into a job.
    #[error("Malformed job message: {0}")]
    BadMessage(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a store error with the given classification.
    pub fn store(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        MigrateError::Store {
            kind,
            message: message.into(),
        }
    }

    /// Create a transient (retryable) store error.
    pub fn store_other(message: impl Into<String>) -> Self {
        Self::store(StoreErrorKind::Other, message)
    }

    /// The store failure classification, if this is a store error.
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            MigrateError::Store { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) => 2,
            MigrateError::Store { .. } => 3,
            MigrateError::Queue(_) => 4,
            MigrateError::Ledger(_) => 5,
            _ => 1,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(StoreErrorKind::NoSuchKey.is_permanent());
        assert!(StoreErrorKind::AccessDenied.is_permanent());
        assert!(StoreErrorKind::NoSuchUpload.is_permanent());
        assert!(!StoreErrorKind::Other.is_permanent());
    }

    #[test]
    fn test_store_kind_accessor() {
        let err = MigrateError::store(StoreErrorKind::NoSuchUpload, "gone");
        assert_eq!(err.store_kind(), Some(StoreErrorKind::NoSuchUpload));
        assert_eq!(MigrateError::Queue("x".into()).store_kind(), None);
    }
}
