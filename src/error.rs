//! Error types.
//!
//! [`SymcacheError`] is the caller-facing taxonomy surfaced by the router,
//! the orchestrator and the HTTP API. [`StoreError`] and [`ExtractError`]
//! are the narrower errors of the symbol store and the extraction tool.

use std::time::Duration;

use thiserror::Error;

use crate::models::{CacheKey, ScanStatus};

/// Errors raised by the SQLite symbol store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("illegal scan transition {from} -> {to}")]
    IllegalTransition { from: ScanStatus, to: ScanStatus },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Errors raised by the external extraction tool.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to start extractor: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),

    #[error("extractor exited with {status}: {stderr}")]
    ToolFailed { status: String, stderr: String },

    #[error("unreadable extractor output: {0}")]
    Output(String),

    #[error("extractor returned no symbols")]
    Empty,
}

/// Caller-facing errors.
#[derive(Debug, Error)]
pub enum SymcacheError {
    /// No cached symbols and no matching firmware. The caller can recover by
    /// uploading the firmware named in `required`.
    #[error("no symbols for {what}; upload {required} to symbolicate")]
    NotFound { what: String, required: String },

    /// A scan is running for this key and has not produced symbols yet.
    #[error("symbols for {key} are still being extracted; retry later")]
    InProgress { key: CacheKey },

    /// The extraction tool failed. Retryable by requesting the scan again.
    #[error("symbol extraction failed for {key}: {message}")]
    ExtractionFailed { key: CacheKey, message: String },

    #[error("symbol store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("{0}")]
    BadRequest(String),
}

impl SymcacheError {
    /// Stable machine-readable code, used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SymcacheError::NotFound { .. } => "not_found",
            SymcacheError::InProgress { .. } => "in_progress",
            SymcacheError::ExtractionFailed { .. } => "extraction_failed",
            SymcacheError::StoreUnavailable(_) => "store_unavailable",
            SymcacheError::ObjectStore(_) => "object_store",
            SymcacheError::BadRequest(_) => "bad_request",
        }
    }

    /// Whether retrying the same call later can succeed without caller action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SymcacheError::InProgress { .. }
                | SymcacheError::StoreUnavailable(_)
                | SymcacheError::ObjectStore(_)
        )
    }

    pub(crate) fn object_store(err: anyhow::Error) -> Self {
        SymcacheError::ObjectStore(format!("{:#}", err))
    }
}

pub type Result<T, E = SymcacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_retryability() {
        let key = CacheKey::new("iPhone15,2", "17.5", "21F79");
        let in_progress = SymcacheError::InProgress { key: key.clone() };
        assert_eq!(in_progress.code(), "in_progress");
        assert!(in_progress.is_retryable());

        let not_found = SymcacheError::NotFound {
            what: key.to_string(),
            required: "iPhone15,2_17.5_21F79_Restore.ipsw".to_string(),
        };
        assert_eq!(not_found.code(), "not_found");
        assert!(!not_found.is_retryable());
        assert!(not_found.to_string().contains("iPhone15,2_17.5_21F79_Restore.ipsw"));

        let failed = SymcacheError::ExtractionFailed {
            key,
            message: "boom".to_string(),
        };
        assert_eq!(failed.code(), "extraction_failed");
    }
}
