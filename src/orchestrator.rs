//! Execution orchestrator.
//!
//! Drives one request through validation, admission, workspace allocation,
//! the optional compile step and the run step, and always hands back a
//! finalized [`ExecutionResult`]. Failures of any kind become result
//! statuses; nothing escapes as an error.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::backend::{
    BackendError, Invocation, IsolationBackend, ProcessRunner, ScriptSandbox, StepOutcome,
    Termination,
};
use crate::config::{Config, LimitsConfig};
use crate::error::EngineError;
use crate::events::{ExecutionEvent, ExecutionObserver};
use crate::limiter::ConcurrencyLimiter;
use crate::registry::{LanguageProfile, LanguageRegistry};
use crate::result::{millis, ExecutionResult, ExecutionStatus, Stage};
use crate::workspace::{validate_filename, Workspace, WorkspaceManager};

const MAX_EXECUTION_ID_LEN: usize = 64;

/// A request to run a piece of code.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Caller-chosen id; replaced by a generated one if malformed.
    pub id: String,
    pub language: String,
    pub source_code: String,
    pub stdin: Option<String>,
    /// Source file name; defaults to the profile's.
    pub filename: Option<String>,
    /// Defaults to the profile's timeout; clamped to the configured maximum.
    pub timeout_ms: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source_code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            language: language.into(),
            source_code: source_code.into(),
            stdin: None,
            filename: None,
            timeout_ms: None,
            max_output_bytes: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub const fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = Some(max_output_bytes);
        self
    }
}

/// A validated request, ready to run.
#[derive(Debug)]
struct Job {
    execution_id: String,
    profile: Arc<LanguageProfile>,
    source: String,
    stdin: Option<String>,
    filename: String,
    timeout: Duration,
    max_output_bytes: usize,
}

/// What the spawned execution task needs; cheap to clone.
#[derive(Clone)]
struct Executor {
    workspaces: Arc<WorkspaceManager>,
    process: Arc<dyn IsolationBackend>,
    sandbox: Arc<dyn IsolationBackend>,
}

/// Entry point for running code.
pub struct Orchestrator {
    registry: LanguageRegistry,
    limits: LimitsConfig,
    limiter: ConcurrencyLimiter,
    executor: Executor,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    /// Workspace reaper, started with the first admitted request.
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("languages", &self.registry.len())
            .field("limiter", &self.limiter)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build the registry, workspace manager and backends from `config`.
    pub fn new(config: &Config) -> Result<Self, EngineError> {
        let registry = LanguageRegistry::from_config(config)?;
        let workspaces = Arc::new(WorkspaceManager::new(&config.workspace)?);
        Ok(Self {
            registry,
            limits: config.limits.clone(),
            limiter: ConcurrencyLimiter::new(
                config.limits.max_concurrent,
                config.limits.max_queue_depth,
            ),
            executor: Executor {
                workspaces,
                process: Arc::new(
                    ProcessRunner::new(config.toolchain_path())
                        .with_passthrough(config.toolchain_env()),
                ),
                sandbox: Arc::new(ScriptSandbox::new(config.sandbox.clone())),
            },
            observers: Vec::new(),
            reaper: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Replace the backend used for non-sandboxed languages.
    #[must_use]
    pub fn with_process_backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.executor.process = backend;
        self
    }

    /// Replace the backend used for sandboxed languages.
    #[must_use]
    pub fn with_sandbox_backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.executor.sandbox = backend;
        self
    }

    pub const fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub const fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.executor.workspaces
    }

    /// Executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.limiter.in_flight()
    }

    /// Requests waiting for a slot.
    pub fn queued(&self) -> usize {
        self.limiter.queued()
    }

    /// Run `request` to completion.
    ///
    /// # Cancel Safety
    /// Dropping the future cancels the execution; the slot and workspace
    /// are still released.
    pub async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        self.submit_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run `request`, stopping early if `cancel` fires.
    #[instrument(
        skip_all,
        fields(execution_id = tracing::field::Empty, language = %request.language)
    )]
    pub async fn submit_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let execution_id = normalize_id(&request.id);
        tracing::Span::current().record("execution_id", execution_id.as_str());
        let language = request.language.clone();

        let job = match self.prepare(&execution_id, request) {
            Ok(job) => job,
            Err(err) => {
                debug!(error = %err, "Request rejected");
                let result = ExecutionResult::rejected(
                    &execution_id,
                    &language,
                    err.status(),
                    err.to_string(),
                    started.elapsed(),
                );
                return self.finish(result);
            }
        };
        let language = job.profile.id.clone();

        self.emit(&ExecutionEvent::Queued {
            execution_id: execution_id.clone(),
            language: language.clone(),
        });
        let slot = tokio::select! {
            slot = self.limiter.acquire() => slot.map_err(|e| (e.status(), e.to_string())),
            () = cancel.cancelled() => Err((
                ExecutionStatus::Cancelled,
                "cancelled while queued".to_string(),
            )),
        };
        let slot = match slot {
            Ok(slot) => slot,
            Err((status, message)) => {
                let result = ExecutionResult::rejected(
                    &execution_id,
                    &language,
                    status,
                    message,
                    started.elapsed(),
                );
                return self.finish(result);
            }
        };

        self.ensure_reaper();

        self.emit(&ExecutionEvent::Started {
            execution_id: execution_id.clone(),
            language: language.clone(),
        });

        // The task hands the slot back with the result so that it is held
        // until `Completed` has been emitted. If the task panics or this
        // future is dropped, the slot is released with the task.
        let task_cancel = cancel.child_token();
        let _cancel_on_drop = task_cancel.clone().drop_guard();
        let executor = self.executor.clone();
        let task = tokio::spawn(async move {
            let result = executor.run(job, &task_cancel).await;
            (result, slot)
        });

        let (mut result, slot) = match task.await {
            Ok((result, slot)) => (result, Some(slot)),
            Err(e) => {
                error!(error = %e, "Execution task failed");
                let result = ExecutionResult::rejected(
                    &execution_id,
                    &language,
                    ExecutionStatus::InternalError,
                    format!("execution task failed: {e}"),
                    started.elapsed(),
                );
                (result, None)
            }
        };
        result.duration_ms = millis(started.elapsed());
        let result = self.finish(result);
        drop(slot);
        result
    }

    /// Close admission, stop the reaper and delete every workspace still
    /// pending.
    pub async fn shutdown(&self) {
        self.limiter.close();
        let reaper = self.lock_reaper().take();
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        let removed = self.executor.workspaces.drain().await;
        self.executor.workspaces.release_instance_dir().await;
        debug!(removed, "Orchestrator shut down");
    }

    /// Whether the workspace reaper is running.
    pub fn reaper_running(&self) -> bool {
        self.lock_reaper()
            .as_ref()
            .is_some_and(|reaper| !reaper.is_finished())
    }

    /// Start the reaper on first use; `new` may run outside a runtime.
    fn ensure_reaper(&self) {
        let mut reaper = self.lock_reaper();
        if reaper.is_none() {
            *reaper = Some(self.executor.workspaces.start_reaper());
        }
    }

    fn lock_reaper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reaper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prepare(&self, execution_id: &str, request: ExecutionRequest) -> Result<Job, EngineError> {
        if request.source_code.trim().is_empty() {
            return Err(EngineError::Validation("source code is empty".to_string()));
        }
        if request.source_code.len() > self.limits.max_source_bytes {
            return Err(EngineError::Validation(format!(
                "source code exceeds {} bytes",
                self.limits.max_source_bytes
            )));
        }
        if request
            .stdin
            .as_ref()
            .is_some_and(|s| s.len() > self.limits.max_stdin_bytes)
        {
            return Err(EngineError::Validation(format!(
                "stdin exceeds {} bytes",
                self.limits.max_stdin_bytes
            )));
        }

        let profile = self.registry.resolve(&request.language)?;

        let filename = match request.filename {
            Some(name) => {
                validate_filename(&name, &profile.file_extension)?;
                name
            }
            None => profile.default_filename.clone(),
        };

        let timeout_ms = match request.timeout_ms {
            Some(0) => {
                return Err(EngineError::Validation(
                    "timeout must be positive".to_string(),
                ))
            }
            Some(ms) => ms,
            None => profile.default_timeout_ms,
        }
        .min(self.limits.max_timeout_ms);

        let max_output_bytes = match request.max_output_bytes {
            Some(0) => {
                return Err(EngineError::Validation(
                    "output limit must be positive".to_string(),
                ))
            }
            Some(n) => n.min(self.limits.default_max_output_bytes),
            None => self.limits.default_max_output_bytes,
        };

        Ok(Job {
            execution_id: execution_id.to_string(),
            profile,
            source: request.source_code,
            stdin: request.stdin,
            filename,
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes,
        })
    }

    fn emit(&self, event: &ExecutionEvent) {
        for observer in &self.observers {
            observer.notify(event);
        }
    }

    fn finish(&self, result: ExecutionResult) -> ExecutionResult {
        self.emit(&ExecutionEvent::completed(&result));
        result
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let reaper = self.reaper.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(reaper) = reaper.take() {
            reaper.abort();
        }
    }
}

/// Schedules the workspace for deletion on every exit path.
struct CleanupGuard<'a> {
    manager: &'a WorkspaceManager,
    workspace: &'a Workspace,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.manager.schedule_destroy(self.workspace);
    }
}

impl Executor {
    async fn run(&self, job: Job, cancel: &CancellationToken) -> ExecutionResult {
        let mut result = ExecutionResult::pending(&job.execution_id, &job.profile.id);

        let workspace = match self.workspaces.allocate(&job.execution_id).await {
            Ok(workspace) => workspace,
            Err(err) => {
                error!(error = %err, "Failed to allocate workspace");
                result.message = Some(err.to_string());
                return result;
            }
        };
        let _cleanup = CleanupGuard {
            manager: &self.workspaces,
            workspace: &workspace,
        };

        if let Err(err) = self
            .workspaces
            .write(&workspace, &job.filename, &job.source)
            .await
        {
            result.status = err.status();
            result.message = Some(err.to_string());
            return result;
        }

        let profile: &LanguageProfile = &job.profile;
        if let Some(argv) = profile.compile_argv(&job.filename) {
            let invocation = Invocation {
                execution_id: &job.execution_id,
                workspace: &workspace,
                profile,
                argv: &argv,
                source: &job.source,
                stdin: None,
                timeout: Duration::from_millis(profile.compile_timeout_ms),
                max_output_bytes: job.max_output_bytes,
            };
            match self.process.execute(&invocation, cancel).await {
                Ok(outcome) => {
                    result.compile_ms = Some(millis(outcome.elapsed));
                    if !outcome.succeeded() {
                        apply_outcome(&mut result, Stage::Compile, invocation.timeout, outcome);
                        return result;
                    }
                }
                Err(err) => {
                    apply_backend_error(&mut result, Stage::Compile, &err);
                    return result;
                }
            }
        }

        let (backend, argv) = if profile.sandboxed {
            (&self.sandbox, Vec::new())
        } else {
            (&self.process, profile.run_argv(&job.filename))
        };
        let invocation = Invocation {
            execution_id: &job.execution_id,
            workspace: &workspace,
            profile,
            argv: &argv,
            source: &job.source,
            stdin: job.stdin.as_deref(),
            timeout: job.timeout,
            max_output_bytes: job.max_output_bytes,
        };
        match backend.execute(&invocation, cancel).await {
            Ok(outcome) => {
                result.run_ms = Some(millis(outcome.elapsed));
                apply_outcome(&mut result, Stage::Execution, job.timeout, outcome);
            }
            Err(err) => apply_backend_error(&mut result, Stage::Execution, &err),
        }
        result
    }
}

fn apply_outcome(
    result: &mut ExecutionResult,
    stage: Stage,
    timeout: Duration,
    outcome: StepOutcome,
) {
    let step = match stage {
        Stage::Compile => "compilation",
        Stage::Execution => "execution",
    };
    let (status, message) = match outcome.termination {
        Termination::Exited if outcome.exit_code == Some(0) => (ExecutionStatus::Succeeded, None),
        Termination::Exited => {
            let status = match stage {
                Stage::Compile => ExecutionStatus::CompileError,
                Stage::Execution => ExecutionStatus::RuntimeError,
            };
            let message = outcome.exit_code.map_or_else(
                || format!("{step} terminated abnormally"),
                |code| format!("{step} exited with code {code}"),
            );
            (status, Some(message))
        }
        Termination::TimedOut => (
            ExecutionStatus::TimedOut,
            Some(format!("{step} timed out after {}ms", timeout.as_millis())),
        ),
        Termination::Cancelled => (
            ExecutionStatus::Cancelled,
            Some(format!("{step} cancelled")),
        ),
        Termination::CapabilityDenied { capability } => (
            ExecutionStatus::CapabilityDenied,
            Some(format!("capability denied: {capability}")),
        ),
    };

    result.status = status;
    result.stage = stage;
    result.message = message;
    result.stdout = outcome.stdout;
    result.stderr = outcome.stderr;
    result.exit_code = outcome.exit_code;
    result.truncated |= outcome.truncated;
}

fn apply_backend_error(result: &mut ExecutionResult, stage: Stage, err: &BackendError) {
    result.stage = stage;
    result.message = Some(err.to_string());
    result.status = match err {
        BackendError::Spawn { .. } => {
            warn!(error = %err, "Toolchain could not be started");
            ExecutionStatus::SpawnError
        }
        _ => {
            error!(error = %err, "Backend failed");
            ExecutionStatus::InternalError
        }
    };
}

/// Caller ids are kept only if they are safe to log and embed in paths.
fn normalize_id(id: &str) -> String {
    let valid = (1..=MAX_EXECUTION_ID_LEN).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        id.to_string()
    } else {
        let generated = Uuid::new_v4().to_string();
        warn!(generated = %generated, "Replacing malformed execution id");
        generated
    }
}
