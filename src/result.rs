//! Terminal execution outcomes.
//!
//! An [`ExecutionResult`] is produced exactly once per request and never
//! mutated afterwards. [`ExecutionResponse`] is the wire shape handed to the
//! editor collaborator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Final status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Exited with code 0.
    Succeeded,
    /// Request was malformed and never admitted.
    ValidationFailed,
    /// Language id is not on the allow-list.
    UnsupportedLanguage,
    /// The admission queue was at capacity.
    QueueFull,
    /// The compile step exited nonzero.
    CompileError,
    /// The program exited nonzero or died from a signal.
    RuntimeError,
    /// Hard-killed after exhausting its time budget.
    TimedOut,
    /// The toolchain binary could not be started.
    SpawnError,
    /// The sandbox refused a capability outside its curated surface.
    CapabilityDenied,
    /// Stopped by the caller.
    Cancelled,
    /// Engine-side failure (workspace I/O, panicked worker).
    InternalError,
}

impl ExecutionStatus {
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "Succeeded",
            Self::ValidationFailed => "ValidationFailed",
            Self::UnsupportedLanguage => "UnsupportedLanguage",
            Self::QueueFull => "QueueFull",
            Self::CompileError => "CompileError",
            Self::RuntimeError => "RuntimeError",
            Self::TimedOut => "TimedOut",
            Self::SpawnError => "SpawnError",
            Self::CapabilityDenied => "CapabilityDenied",
            Self::Cancelled => "Cancelled",
            Self::InternalError => "InternalError",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which step produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Execution,
}

/// Complete outcome of one execution request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    /// Canonical language id, or the raw id for rejected requests.
    pub language: String,
    pub status: ExecutionStatus,
    pub stage: Stage,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Wall time from submission to finalization.
    pub duration_ms: u64,
    /// Time spent in the compile step, if one ran.
    pub compile_ms: Option<u64>,
    /// Time spent in the run step, if it was entered.
    pub run_ms: Option<u64>,
    /// Set when stdout or stderr hit the output cap.
    pub truncated: bool,
    /// Human-readable explanation for non-successful outcomes.
    pub message: Option<String>,
}

impl ExecutionResult {
    /// Result for a request that failed before any step ran.
    pub fn rejected(
        execution_id: &str,
        language: &str,
        status: ExecutionStatus,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            language: language.to_string(),
            status,
            stage: Stage::Execution,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: millis(elapsed),
            compile_ms: None,
            run_ms: None,
            truncated: false,
            message: Some(message.into()),
        }
    }

    /// Starting point for an admitted request; steps overwrite the status.
    pub(crate) fn pending(execution_id: &str, language: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            language: language.to_string(),
            status: ExecutionStatus::InternalError,
            stage: Stage::Execution,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 0,
            compile_ms: None,
            run_ms: None,
            truncated: false,
            message: None,
        }
    }

    pub const fn success(&self) -> bool {
        self.status.is_success()
    }
}

/// Result object returned to the editor collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub success: bool,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    pub stage: Stage,
    pub truncated: bool,
    pub error: Option<String>,
}

impl From<ExecutionResult> for ExecutionResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            success: result.success(),
            execution_id: result.execution_id,
            status: result.status,
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            execution_time_ms: result.duration_ms,
            stage: result.stage,
            truncated: result.truncated,
            error: result.message,
        }
    }
}

/// Saturating conversion used for every `*_ms` field.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
