//! Error taxonomy for the diagram pipeline.
//!
//! Validation failures are not errors: they are a normal outcome carried by
//! `ValidationResult` and routed to issue creation.

use thiserror::Error;

/// Failure reported by a hosting platform call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// Network failure, timeout, rate limit or server error. Safe to retry.
    #[error("{op}: transient failure: {message}")]
    Transient { op: String, message: String },
    /// Auth, permissions, not-found or malformed request. Never retried.
    #[error("{op}: permanent failure: {message}")]
    Permanent { op: String, message: String },
    /// The branch head moved under a batched commit.
    #[error("branch {branch} moved during commit: {message}")]
    Conflict { branch: String, message: String },
}

impl PlatformError {
    pub fn transient(op: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            op: op.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(op: &str, message: impl Into<String>) -> Self {
        Self::Permanent {
            op: op.to_string(),
            message: message.into(),
        }
    }

    pub fn conflict(branch: &str, message: impl Into<String>) -> Self {
        Self::Conflict {
            branch: branch.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Errors that abort a pipeline run or prevent startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Bad `RepoTarget`; fatal at startup or reload.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Transient platform failure that outlived its retry budget.
    #[error("transient platform error: {0}")]
    TransientPlatform(String),
    #[error("permanent platform error: {0}")]
    PermanentPlatform(String),
    /// The batched commit was rejected twice because the branch kept moving.
    #[error("reconciliation conflict: {0}")]
    ReconciliationConflict(String),
    /// Two source files map to the same sidecar path.
    #[error("metadata path {sidecar} is claimed by both {first} and {second}")]
    SidecarCollision {
        sidecar: String,
        first: String,
        second: String,
    },
    /// The run task itself aborted.
    #[error("run aborted: {0}")]
    RunAborted(String),
}

impl From<PlatformError> for PipelineError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Transient { .. } => Self::TransientPlatform(err.to_string()),
            PlatformError::Permanent { .. } => Self::PermanentPlatform(err.to_string()),
            PlatformError::Conflict { .. } => Self::ReconciliationConflict(err.to_string()),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
