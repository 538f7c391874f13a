//! Engine error taxonomy.
//!
//! Every variant maps to exactly one terminal [`ExecutionStatus`]; the
//! orchestrator never lets one of these escape to the caller.

use std::path::PathBuf;

use crate::result::ExecutionStatus;

/// Errors raised while admitting and preparing an execution.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The request is malformed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The language id is not on the allow-list.
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    /// The admission queue is at capacity.
    #[error("execution queue is full ({depth} waiting)")]
    QueueFull { depth: usize },

    /// The limiter was shut down while the request waited.
    #[error("concurrency limiter is closed")]
    LimiterClosed,

    /// A workspace could not be created or written.
    #[error("workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An operator-supplied language profile is unusable.
    #[error("invalid language profile '{language}': {reason}")]
    InvalidProfile { language: String, reason: String },
}

impl EngineError {
    /// The terminal status a request failing with this error ends in.
    pub const fn status(&self) -> ExecutionStatus {
        match self {
            Self::Validation(_) => ExecutionStatus::ValidationFailed,
            Self::UnsupportedLanguage(_) => ExecutionStatus::UnsupportedLanguage,
            Self::QueueFull { .. } => ExecutionStatus::QueueFull,
            Self::LimiterClosed | Self::Workspace { .. } | Self::InvalidProfile { .. } => {
                ExecutionStatus::InternalError
            }
        }
    }
}
