//! Child-process backend.
//!
//! Runs the rendered toolchain argv inside the workspace directory, in its
//! own process group so that everything the program forks can be killed
//! together. Output is pumped in chunks to a collector that enforces the
//! per-stream cap while continuing to drain the pipes.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{BackendError, CappedBuffer, Invocation, IsolationBackend, StepOutcome, Termination};

const CHUNK_SIZE: usize = 8 * 1024;
const CHUNK_CHANNEL_CAPACITY: usize = 32;
/// How long pipes may stay open after the group was killed.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Backend that spawns the language toolchain as a child process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    path: String,
    passthrough: Vec<(String, String)>,
}

impl ProcessRunner {
    /// `path` becomes the child's `PATH`; nothing else is inherited unless
    /// added with [`with_passthrough`](Self::with_passthrough).
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passthrough: Vec::new(),
        }
    }

    /// Host variables toolchains need to locate themselves, such as
    /// `RUSTUP_HOME`. Profile variables still take precedence.
    #[must_use]
    pub fn with_passthrough(mut self, vars: Vec<(String, String)>) -> Self {
        self.passthrough = vars;
        self
    }

    fn command(&self, program: &Path, args: &[String], invocation: &Invocation<'_>) -> Command {
        let dir = invocation.workspace.path();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(dir)
            .env_clear()
            .env("PATH", &self.path)
            .env("HOME", dir)
            .env("TMPDIR", dir)
            .env("LANG", "C.UTF-8")
            .envs(self.passthrough.iter().map(|(k, v)| (k, v)))
            .envs(invocation.profile.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

struct Chunk {
    stream: Stream,
    bytes: Vec<u8>,
}

struct Captured {
    stdout: CappedBuffer,
    stderr: CappedBuffer,
}

enum Finish {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl IsolationBackend for ProcessRunner {
    #[instrument(
        skip_all,
        fields(
            execution_id = %invocation.execution_id,
            language = %invocation.profile.id,
            timeout_ms = u64::try_from(invocation.timeout.as_millis()).unwrap_or(u64::MAX),
        )
    )]
    async fn execute(
        &self,
        invocation: &Invocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, BackendError> {
        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or(BackendError::EmptyCommand)?;
        let program_path = resolve_program(program, invocation.workspace.path());
        debug!(
            program = %program_path.display(),
            memory_limit_bytes = invocation.profile.memory_limit_bytes,
            "Spawning process"
        );

        let started = Instant::now();
        let mut child = self
            .command(&program_path, args, invocation)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: program.clone(),
                source,
            })?;
        // process_group(0) makes the child's pid its group id.
        let group = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw);

        if let Some(mut pipe) = child.stdin.take() {
            let input = invocation.stdin.unwrap_or_default().as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    debug!(error = %e, "Stdin not fully consumed");
                }
            });
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(out, Stream::Stdout, tx.clone())));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(err, Stream::Stderr, tx.clone())));
        }
        drop(tx);
        let mut collector = tokio::spawn(collect(rx, invocation.max_output_bytes));

        let finish = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Finish::Exited(status),
                Err(e) => {
                    kill_group(group);
                    return Err(e.into());
                }
            },
            () = tokio::time::sleep(invocation.timeout) => Finish::TimedOut,
            () = cancel.cancelled() => Finish::Cancelled,
        };
        let elapsed = started.elapsed();

        // Also after a normal exit: background children must not outlive the run.
        kill_group(group);
        if !matches!(finish, Finish::Exited(_)) {
            if let Err(e) = child.wait().await {
                warn!(error = %e, "Failed to reap killed process");
            }
        }

        let captured = match tokio::time::timeout(DRAIN_GRACE, &mut collector).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Output pipes still open after kill, abandoning them");
                for pump in &pumps {
                    pump.abort();
                }
                collector.await
            }
        }
        .map_err(|e| BackendError::Worker(e.to_string()))?;

        let mut stderr = captured.stderr.to_string_lossy();
        let truncated = captured.stdout.truncated() || captured.stderr.truncated();
        let (termination, exit_code) = match finish {
            Finish::Exited(status) => {
                if let Some(signal) = status.signal() {
                    append_line(&mut stderr, &signal_message(signal));
                }
                (Termination::Exited, status.code())
            }
            Finish::TimedOut => (Termination::TimedOut, None),
            Finish::Cancelled => (Termination::Cancelled, None),
        };

        debug!(?exit_code, ?termination, elapsed_ms = elapsed.as_millis(), "Process finished");

        Ok(StepOutcome {
            termination,
            exit_code,
            stdout: captured.stdout.to_string_lossy(),
            stderr,
            truncated,
            elapsed,
        })
    }
}

/// `./name` refers to a file produced inside the workspace.
fn resolve_program(program: &str, workspace: &Path) -> PathBuf {
    program
        .strip_prefix("./")
        .map_or_else(|| PathBuf::from(program), |local| workspace.join(local))
}

fn kill_group(group: Option<Pid>) {
    let Some(pgid) = group else {
        return;
    };
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "Failed to kill process group"),
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, stream: Stream, tx: mpsc::Sender<Chunk>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Chunk {
                    stream,
                    bytes: buf[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(?stream, error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

/// Keeps draining after the cap is hit so the child never blocks on a full pipe.
async fn collect(mut rx: mpsc::Receiver<Chunk>, limit: usize) -> Captured {
    let mut captured = Captured {
        stdout: CappedBuffer::new(limit),
        stderr: CappedBuffer::new(limit),
    };
    while let Some(chunk) = rx.recv().await {
        match chunk.stream {
            Stream::Stdout => captured.stdout.push(&chunk.bytes),
            Stream::Stderr => captured.stderr.push(&chunk.bytes),
        }
    }
    captured
}

fn signal_message(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => format!("process terminated by signal {signal} ({})", sig.as_str()),
        Err(_) => format!("process terminated by signal {signal}"),
    }
}

fn append_line(buf: &mut String, line: &str) {
    if !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(line);
    buf.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::{profile, workspace_in};
    use crate::workspace::Workspace;

    fn runner() -> ProcessRunner {
        ProcessRunner::new("/usr/local/bin:/usr/bin:/bin")
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn run(
        workspace: &Workspace,
        argv: &[String],
        stdin: Option<&str>,
        timeout: Duration,
        max_output_bytes: usize,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, BackendError> {
        let profile = profile("sh");
        let invocation = Invocation {
            execution_id: "test",
            workspace,
            profile: &profile,
            argv,
            source: "",
            stdin,
            timeout,
            max_output_bytes,
        };
        runner().execute(&invocation, cancel).await
    }

    async fn run_sh(workspace: &Workspace, script: &str, timeout: Duration) -> StepOutcome {
        run(workspace, &sh(script), None, timeout, 1 << 20, &CancellationToken::new())
            .await
            .unwrap()
    }

    /// Alive and not a zombie, according to procfs.
    fn process_alive(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
            !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z'))
        })
    }

    async fn assert_dies(pid: i32) {
        for _ in 0..100 {
            if !process_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process {pid} survived its group being killed");
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;

        let outcome = run_sh(&ws, "echo out; echo err >&2; exit 3", Duration::from_secs(5)).await;

        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn stdin_is_delivered_then_closed() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;
        let argv = vec!["cat".to_string()];

        let outcome = run(
            &ws,
            &argv,
            Some("line one\nline two\n"),
            Duration::from_secs(5),
            1024,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "line one\nline two\n");
    }

    #[tokio::test]
    async fn environment_is_scrubbed_and_points_at_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;

        let outcome = run_sh(
            &ws,
            "echo \"$HOME\"; pwd; echo \"${CARGO_PKG_NAME:-unset}\"",
            Duration::from_secs(5),
        )
        .await;

        let expected = ws.path().display().to_string();
        let lines: Vec<&str> = outcome.stdout.lines().collect();
        assert_eq!(lines[0], expected);
        assert_eq!(lines[1], expected);
        assert_eq!(lines[2], "unset");
    }

    #[tokio::test]
    async fn passthrough_variables_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;
        let profile = profile("sh");
        let argv = sh("echo \"$RUSTUP_HOME\"; echo \"$HOME\"");
        let invocation = Invocation {
            execution_id: "test",
            workspace: &ws,
            profile: &profile,
            argv: &argv,
            source: "",
            stdin: None,
            timeout: Duration::from_secs(5),
            max_output_bytes: 1 << 20,
        };

        let outcome = runner()
            .with_passthrough(vec![("RUSTUP_HOME".to_string(), "/opt/rustup".to_string())])
            .execute(&invocation, &CancellationToken::new())
            .await
            .unwrap();

        let lines: Vec<&str> = outcome.stdout.lines().collect();
        assert_eq!(lines[0], "/opt/rustup");
        assert_eq!(lines[1], ws.path().display().to_string());
    }

    #[tokio::test]
    async fn timeout_kills_runaway_loop() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;

        let started = Instant::now();
        let outcome = run_sh(&ws, "while :; do :; done", Duration::from_millis(200)).await;

        assert_eq!(outcome.termination, Termination::TimedOut);
        assert_eq!(outcome.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_process_group() {
        if !Path::new("/proc/self/stat").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;

        let outcome = run_sh(&ws, "sleep 30 & echo $!; wait", Duration::from_millis(300)).await;

        assert_eq!(outcome.termination, Termination::TimedOut);
        let pid: i32 = outcome.stdout.trim().parse().unwrap();
        assert_dies(pid).await;
    }

    #[tokio::test]
    async fn background_children_do_not_outlive_normal_exit() {
        if !Path::new("/proc/self/stat").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;

        let started = Instant::now();
        let outcome = run_sh(&ws, "sleep 30 & echo $!", Duration::from_secs(10)).await;

        assert!(outcome.succeeded());
        assert!(started.elapsed() < Duration::from_secs(5));
        let pid: i32 = outcome.stdout.trim().parse().unwrap();
        assert_dies(pid).await;
    }

    #[tokio::test]
    async fn output_is_capped_and_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;

        let outcome = run(
            &ws,
            &sh("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done"),
            None,
            Duration::from_secs(10),
            1000,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.succeeded());
        assert!(outcome.truncated);
        assert_eq!(outcome.stdout.len(), 1000);
    }

    #[tokio::test]
    async fn capped_output_does_not_end_in_a_broken_character() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;

        let outcome = run(
            &ws,
            &sh("printf 'a\\303\\251'"),
            None,
            Duration::from_secs(5),
            2,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.truncated);
        assert_eq!(outcome.stdout, "a");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;
        let argv = vec!["definitely-not-a-real-toolchain".to_string()];

        let err = run(
            &ws,
            &argv,
            None,
            Duration::from_secs(1),
            1024,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BackendError::Spawn { .. }));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;

        let err = run(&ws, &[], None, Duration::from_secs(1), 1024, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::EmptyCommand));
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = run(&ws, &sh("sleep 30"), None, Duration::from_secs(30), 1024, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn signal_death_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_in(dir.path()).await;

        let outcome = run_sh(&ws, "kill -SEGV $$", Duration::from_secs(5)).await;

        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.stderr.contains("signal 11"));
    }

    #[test]
    fn local_programs_resolve_inside_workspace() {
        let ws = Path::new("/tmp/ws-1");
        assert_eq!(resolve_program("./main", ws), ws.join("main"));
        assert_eq!(resolve_program("python3", ws), PathBuf::from("python3"));
    }
}
