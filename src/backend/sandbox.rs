//! In-process sandbox backend.
//!
//! Evaluates Rhai scripts in a freshly built engine per request. The engine
//! only exposes the curated capabilities registered below; filesystem,
//! process, network, environment and module access are either absent or
//! registered as stubs that refuse and record the attempt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Position, FLOAT, INT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{BackendError, CappedBuffer, Invocation, IsolationBackend, StepOutcome, Termination};
use crate::config::SandboxConfig;

/// Operations between deadline checks in the progress hook.
const PROGRESS_CHECK_INTERVAL: u64 = 256;
/// Granularity at which `sleep` notices an abort.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Functions that exist only to refuse, paired with the capability they guard.
const DENIED_FUNCTIONS: &[(&str, &str)] = &[
    ("read_file", "filesystem"),
    ("write_file", "filesystem"),
    ("open_file", "filesystem"),
    ("remove_file", "filesystem"),
    ("list_dir", "filesystem"),
    ("exec", "process"),
    ("spawn", "process"),
    ("system", "process"),
    ("http_get", "network"),
    ("http_post", "network"),
    ("fetch", "network"),
    ("connect", "network"),
    ("env_var", "environment"),
];

/// Backend that evaluates Rhai code without spawning a process.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    limits: SandboxConfig,
}

impl ScriptSandbox {
    #[must_use]
    pub const fn new(limits: SandboxConfig) -> Self {
        Self { limits }
    }
}

/// State shared between one engine instance and the async side.
struct SandboxState {
    stdout: Mutex<CappedBuffer>,
    stderr: Mutex<CappedBuffer>,
    denied: Mutex<Option<String>>,
    aborted: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl SandboxState {
    fn new(output_limit: usize) -> Self {
        Self {
            stdout: Mutex::new(CappedBuffer::new(output_limit)),
            stderr: Mutex::new(CappedBuffer::new(output_limit)),
            denied: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    fn write_line(&self, stream: Stream, text: &str) {
        let buffer = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push(text.as_bytes());
        buffer.push(b"\n");
    }

    /// Records the first denial and builds the error the script sees.
    fn deny(&self, capability: &str, function: &str) -> Box<EvalAltResult> {
        let description = denial_description(capability, function);
        self.record_denial(&description);
        EvalAltResult::ErrorRuntime(
            Dynamic::from(format!("capability denied: {description}")),
            Position::NONE,
        )
        .into()
    }

    fn record_denial(&self, description: &str) {
        let mut denied = self.denied.lock().unwrap_or_else(PoisonError::into_inner);
        if denied.is_none() {
            *denied = Some(description.to_string());
        }
    }

    fn denied(&self) -> Option<String> {
        self.denied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Output so far: (stdout, stderr, truncated).
    fn snapshot(&self) -> (String, String, bool) {
        let stdout = self.stdout.lock().unwrap_or_else(PoisonError::into_inner);
        let stderr = self.stderr.lock().unwrap_or_else(PoisonError::into_inner);
        (
            stdout.to_string_lossy(),
            stderr.to_string_lossy(),
            stdout.truncated() || stderr.truncated(),
        )
    }
}

/// Flags the engine aborted if the calling future is dropped mid-run.
struct AbortOnDrop(Arc<SandboxState>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// How the blocking evaluation ended.
enum Evaluation {
    Completed,
    Failed(String),
    Terminated,
    Denied(String),
}

#[async_trait]
impl IsolationBackend for ScriptSandbox {
    #[instrument(
        skip_all,
        fields(
            execution_id = %invocation.execution_id,
            source_len = invocation.source.len(),
        )
    )]
    async fn execute(
        &self,
        invocation: &Invocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, BackendError> {
        let started = Instant::now();
        let deadline = started + invocation.timeout;
        let state = Arc::new(SandboxState::new(invocation.max_output_bytes));
        let _abort_guard = AbortOnDrop(Arc::clone(&state));

        let mut worker = {
            let state = Arc::clone(&state);
            let source = invocation.source.to_owned();
            let stdin = invocation.stdin.unwrap_or_default().to_owned();
            let limits = self.limits.clone();
            let memory_limit = invocation.profile.memory_limit_bytes;
            tokio::task::spawn_blocking(move || {
                evaluate(&source, &stdin, &limits, memory_limit, deadline, &state)
            })
        };

        let evaluation = tokio::select! {
            joined = &mut worker => Some(joined.map_err(|e| BackendError::Worker(e.to_string()))?),
            () = tokio::time::sleep_until(deadline.into()) => None,
            () = cancel.cancelled() => None,
        };
        let elapsed = started.elapsed();

        let evaluation = evaluation.unwrap_or_else(|| {
            // The worker notices the flag at its next progress check; it is
            // not awaited.
            state.abort();
            warn!("Sandbox worker detached after deadline or cancellation");
            Evaluation::Terminated
        });

        let (stdout, mut stderr, truncated) = state.snapshot();
        let (termination, exit_code) = match evaluation {
            Evaluation::Completed => (Termination::Exited, Some(0)),
            Evaluation::Failed(message) => {
                push_line(&mut stderr, &message);
                (Termination::Exited, Some(1))
            }
            Evaluation::Terminated if cancel.is_cancelled() => (Termination::Cancelled, None),
            Evaluation::Terminated => (Termination::TimedOut, None),
            Evaluation::Denied(capability) => {
                push_line(&mut stderr, &format!("capability denied: {capability}"));
                (Termination::CapabilityDenied { capability }, None)
            }
        };

        debug!(?exit_code, ?termination, elapsed_ms = elapsed.as_millis(), "Sandbox finished");

        Ok(StepOutcome {
            termination,
            exit_code,
            stdout,
            stderr,
            truncated,
            elapsed,
        })
    }
}

fn evaluate(
    source: &str,
    stdin: &str,
    limits: &SandboxConfig,
    memory_limit: u64,
    deadline: Instant,
    state: &Arc<SandboxState>,
) -> Evaluation {
    let engine = build_engine(limits, memory_limit, deadline, stdin, state);
    let outcome = engine.run(source);

    // A caught denial still taints the run.
    if let Some(capability) = state.denied() {
        return Evaluation::Denied(capability);
    }
    match outcome {
        Ok(()) => Evaluation::Completed,
        Err(err) => match root_cause(&err) {
            EvalAltResult::ErrorTerminated(..) => Evaluation::Terminated,
            EvalAltResult::ErrorModuleNotFound(path, _) => {
                let capability = format!("module loading ('{path}')");
                state.record_denial(&capability);
                Evaluation::Denied(capability)
            }
            // A denied name called with more arguments than any stub takes.
            EvalAltResult::ErrorFunctionNotFound(signature, _) => {
                match denied_function(signature) {
                    Some((function, capability)) => {
                        let description = denial_description(capability, function);
                        state.record_denial(&description);
                        Evaluation::Denied(description)
                    }
                    None => Evaluation::Failed(err.to_string()),
                }
            }
            _ => Evaluation::Failed(err.to_string()),
        },
    }
}

fn denial_description(capability: &str, function: &str) -> String {
    format!("{capability} access via '{function}'")
}

/// Entry of `DENIED_FUNCTIONS` named by a signature such as
/// `write_file (&str, &str, &str)`.
fn denied_function(signature: &str) -> Option<(&'static str, &'static str)> {
    let name = signature
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()?;
    DENIED_FUNCTIONS
        .iter()
        .find(|(function, _)| *function == name)
        .copied()
}

fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => root_cause(inner),
        other => other,
    }
}

fn build_engine(
    limits: &SandboxConfig,
    memory_limit: u64,
    deadline: Instant,
    stdin: &str,
    state: &Arc<SandboxState>,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");

    if limits.max_operations > 0 {
        engine.set_max_operations(limits.max_operations);
    }
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    let string_cap = usize::try_from(memory_limit)
        .unwrap_or(usize::MAX)
        .min(limits.max_string_bytes);
    engine.set_max_string_size(string_cap);
    engine.set_max_array_size(limits.max_array_len);
    engine.set_max_map_size(limits.max_map_len);

    let out = Arc::clone(state);
    engine.on_print(move |text| out.write_line(Stream::Stdout, text));
    let err = Arc::clone(state);
    engine.on_debug(move |text, _, _| err.write_line(Stream::Stderr, text));

    let progress = Arc::clone(state);
    engine.on_progress(move |ops| {
        let expired = ops % PROGRESS_CHECK_INTERVAL == 0
            && (progress.is_aborted() || Instant::now() >= deadline);
        expired.then_some(Dynamic::UNIT)
    });

    register_timers(&mut engine, deadline, state);
    register_stdin(&mut engine, stdin);
    register_denials(&mut engine, state);
    engine
}

fn register_timers(engine: &mut Engine, deadline: Instant, state: &Arc<SandboxState>) {
    let started = Instant::now();

    let sleeper = Arc::clone(state);
    engine.register_fn("sleep", move |seconds: INT| {
        let requested = Duration::from_secs(u64::try_from(seconds).unwrap_or(0));
        bounded_sleep(requested, deadline, &sleeper)
    });
    let sleeper = Arc::clone(state);
    engine.register_fn("sleep", move |seconds: FLOAT| {
        let requested = Duration::try_from_secs_f64(seconds).unwrap_or_default();
        bounded_sleep(requested, deadline, &sleeper)
    });
    let sleeper = Arc::clone(state);
    engine.register_fn("sleep_ms", move |millis: INT| {
        let requested = Duration::from_millis(u64::try_from(millis).unwrap_or(0));
        bounded_sleep(requested, deadline, &sleeper)
    });
    engine.register_fn("elapsed_ms", move || -> INT {
        INT::try_from(started.elapsed().as_millis()).unwrap_or(INT::MAX)
    });
}

/// Never sleeps past the deadline; a sleep cut short by the deadline or an
/// abort terminates the script.
fn bounded_sleep(
    requested: Duration,
    deadline: Instant,
    state: &SandboxState,
) -> Result<(), Box<EvalAltResult>> {
    let until = (Instant::now() + requested).min(deadline);
    loop {
        if state.is_aborted() || Instant::now() >= deadline {
            return Err(EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE).into());
        }
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        std::thread::sleep(remaining.min(SLEEP_SLICE));
    }
}

fn register_stdin(engine: &mut Engine, stdin: &str) {
    let all = stdin.to_string();
    engine.register_fn("read_stdin", move || all.clone());

    let lines: Mutex<VecDeque<String>> = Mutex::new(stdin.lines().map(str::to_string).collect());
    engine.register_fn("read_line", move || -> String {
        lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_default()
    });
}

fn register_denials(engine: &mut Engine, state: &Arc<SandboxState>) {
    for &(function, capability) in DENIED_FUNCTIONS {
        let s = Arc::clone(state);
        engine.register_fn(function, move || -> Result<Dynamic, Box<EvalAltResult>> {
            Err(s.deny(capability, function))
        });
        let s = Arc::clone(state);
        engine.register_fn(
            function,
            move |_: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                Err(s.deny(capability, function))
            },
        );
        let s = Arc::clone(state);
        engine.register_fn(
            function,
            move |_: Dynamic, _: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                Err(s.deny(capability, function))
            },
        );
        let s = Arc::clone(state);
        engine.register_fn(
            function,
            move |_: Dynamic, _: Dynamic, _: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                Err(s.deny(capability, function))
            },
        );
    }
}

fn push_line(buf: &mut String, line: &str) {
    if !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(line);
    buf.push('\n');
}
