//! Execution backends.
//!
//! A backend runs one step (compile or run) of an execution inside an
//! already-populated workspace and reports how it ended. Two backends exist:
//! [`ProcessRunner`] spawns the language toolchain as a child process, and
//! [`ScriptSandbox`] evaluates code in a fresh in-process engine. The
//! orchestrator picks one per language profile.

mod process;
mod sandbox;

pub use process::ProcessRunner;
pub use sandbox::ScriptSandbox;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::registry::LanguageProfile;
use crate::workspace::Workspace;

/// Everything a backend needs to run one step.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub execution_id: &'a str,
    pub workspace: &'a Workspace,
    pub profile: &'a LanguageProfile,
    /// Rendered argv for process backends; empty for the sandbox.
    pub argv: &'a [String],
    /// Source code, for backends that evaluate it directly.
    pub source: &'a str,
    pub stdin: Option<&'a str>,
    pub timeout: Duration,
    /// Cap applied to stdout and stderr independently.
    pub max_output_bytes: usize,
}

/// How a step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Ran to completion; see `exit_code`.
    Exited,
    TimedOut,
    Cancelled,
    /// The sandbox refused an operation.
    CapabilityDenied { capability: String },
}

/// Outcome of one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub termination: Termination,
    /// `None` when the step did not exit normally (signal, timeout, denial).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub elapsed: Duration,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

/// Errors that prevent a step from producing an outcome at all.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The toolchain binary is missing or not executable.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The profile rendered an empty argv.
    #[error("empty command")]
    EmptyCommand,

    /// The execution worker panicked or was lost.
    #[error("execution worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Trait for execution backends.
///
/// # Cancel Safety
/// Implementations stop the running code when `cancel` fires and when the
/// returned future is dropped.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Run one step and wait for it to end or for the timeout.
    async fn execute(
        &self,
        invocation: &Invocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, BackendError>;
}

/// Byte buffer that keeps at most `limit` bytes and remembers overflow.
#[derive(Debug)]
pub(crate) struct CappedBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub(crate) const fn truncated(&self) -> bool {
        self.truncated
    }

    /// Decode the kept bytes. A character cut in half by the cap is dropped
    /// so the text never grows past `limit`.
    pub(crate) fn to_string_lossy(&self) -> String {
        let data = if self.truncated {
            without_split_char(&self.data)
        } else {
            &self.data[..]
        };
        String::from_utf8_lossy(data).into_owned()
    }
}

fn without_split_char(data: &[u8]) -> &[u8] {
    let tail = data.len().saturating_sub(3);
    for start in (tail..data.len()).rev() {
        // Skip continuation bytes back to the last lead byte.
        if data[start] & 0xC0 == 0x80 {
            continue;
        }
        return match std::str::from_utf8(&data[start..]) {
            Err(e) if e.error_len().is_none() => &data[..start],
            _ => data,
        };
    }
    data
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_buffer_never_splits_a_character() {
        let mut buf = CappedBuffer::new(2);
        buf.push("aé".as_bytes());
        assert!(buf.truncated());
        assert_eq!(buf.to_string_lossy(), "a");

        let mut buf = CappedBuffer::new(3);
        buf.push("aé€".as_bytes());
        assert_eq!(buf.to_string_lossy(), "aé");

        let mut buf = CappedBuffer::new(4);
        buf.push("a€b".as_bytes());
        assert_eq!(buf.to_string_lossy(), "a€");
    }

    #[test]
    fn invalid_bytes_below_the_cap_are_still_replaced() {
        let mut buf = CappedBuffer::new(8);
        buf.push(&[b'a', 0xFF, b'b']);
        assert!(!buf.truncated());
        assert_eq!(buf.to_string_lossy(), "a\u{FFFD}b");
    }

    #[test]
    fn capped_buffer_truncates_and_flags() {
        let mut buf = CappedBuffer::new(5);
        buf.push(b"abc");
        assert!(!buf.truncated());
        buf.push(b"defgh");
        assert!(buf.truncated());
        assert_eq!(buf.to_string_lossy(), "abcde");
        buf.push(b"x");
        assert_eq!(buf.to_string_lossy(), "abcde");
    }

    #[test]
    fn step_outcome_success_requires_zero_exit() {
        let outcome = StepOutcome {
            termination: Termination::Exited,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            elapsed: Duration::ZERO,
        };
        assert!(outcome.succeeded());

        let failed = StepOutcome {
            exit_code: Some(2),
            ..outcome.clone()
        };
        assert!(!failed.succeeded());

        let timed_out = StepOutcome {
            termination: Termination::TimedOut,
            exit_code: None,
            ..outcome
        };
        assert!(!timed_out.succeeded());
    }
}
