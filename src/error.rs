//! Failure taxonomy shared by the client, fetcher, and pipeline.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::RunState;

/// Classification of a failed directory-service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The listing (or any match for the identity hint) does not exist.
    NotFound,
    /// The service rejected the request as malformed.
    InvalidRequest,
    /// Credential missing, revoked, or lacking the required API.
    AuthDenied,
    /// Quota or per-second limit exceeded.
    RateLimited,
    /// The request did not complete within the client timeout.
    Timeout,
    /// 5xx-equivalent or connection-level failure.
    Unavailable,
    /// The service answered but the body could not be understood.
    MalformedResponse,
}

impl FailureKind {
    /// Transient failures are retried with backoff; everything else fails fast.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited | FailureKind::Timeout | FailureKind::Unavailable
        )
    }

    /// Stable snake_case label used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::AuthDenied => "auth_denied",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "unavailable",
            FailureKind::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure returned by a [`crate::client::PlacesApi`] call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    /// Failure class driving retry decisions.
    pub kind: FailureKind,
    /// Human-readable detail from the transport.
    pub message: String,
}

impl ServiceError {
    /// Builds a new service error.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for [`ServiceError::new`] with [`FailureKind::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    /// Whether the client should retry the call.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Fatal conditions that abort a run before any output is written.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid mode, control value, or missing credential.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A baseline-required mode found no dataset.
    #[error("dataset {path:?} does not exist; run data-only first to create a baseline")]
    MissingBaseline {
        /// Dataset location that was looked up.
        path: PathBuf,
    },
    /// Reading or writing a file failed.
    #[error("failed to access {path:?}: {source}")]
    Persistence {
        /// File being read or written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The dataset parsed badly or broke an identity invariant.
    #[error("dataset {path:?} is invalid: {details}")]
    InvalidDataset {
        /// Offending file.
        path: PathBuf,
        /// What was wrong with it.
        details: String,
    },
    /// Output could not be serialized.
    #[error("failed to serialize output: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Persistence {
            path: path.into(),
            source,
        }
    }
}

/// A run that ended in [`RunState::Failed`].
#[derive(Debug, Error)]
#[error("sync run failed while {stage}: {source}")]
pub struct RunFailure {
    /// State the run was in when the fatal condition surfaced.
    pub stage: RunState,
    /// Underlying fatal error.
    #[source]
    pub source: SyncError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_are_retryable() {
        for kind in [
            FailureKind::RateLimited,
            FailureKind::Timeout,
            FailureKind::Unavailable,
        ] {
            assert!(kind.is_transient(), "{kind} should be transient");
        }
        for kind in [
            FailureKind::NotFound,
            FailureKind::InvalidRequest,
            FailureKind::AuthDenied,
            FailureKind::MalformedResponse,
        ] {
            assert!(!kind.is_transient(), "{kind} should be permanent");
        }
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::AuthDenied).unwrap();
        assert_eq!(json, "\"auth_denied\"");
    }
}
