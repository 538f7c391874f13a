//! Ephemeral per-execution workspaces.
//!
//! Each execution gets a fresh directory owned by that execution alone.
//! Workspaces live in a per-daemon instance directory
//! (`<root>/daemon-<pid>-<suffix>`) so that several daemons can share one
//! root. Deletion is deferred by a grace period so that processes killed a
//! moment ago cannot race the removal; a background reaper performs the
//! deferred deletions. Removing a workspace that is already gone is a no-op.

use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkspaceConfig;
use crate::error::EngineError;

/// Prefix of every workspace directory name.
const WORKSPACE_PREFIX: &str = "ws-";

/// Prefix of per-daemon instance directories under the shared root.
const INSTANCE_PREFIX: &str = "daemon-";

const MAX_FILENAME_LEN: usize = 128;

/// A directory exclusively owned by one execution.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    execution_id: String,
    created_at: Instant,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub const fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[derive(Debug)]
struct PendingDeletion {
    path: PathBuf,
    due: Instant,
}

/// Allocates, populates and removes workspaces.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    instance_dir: PathBuf,
    grace: Duration,
    reaper_interval: Duration,
    pending: Mutex<Vec<PendingDeletion>>,
}

impl WorkspaceManager {
    /// Create the manager, creating the root and this daemon's instance
    /// directory.
    pub fn new(config: &WorkspaceConfig) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.root).map_err(|source| EngineError::Workspace {
            path: config.root.clone(),
            source,
        })?;

        let suffix = Uuid::new_v4().simple().to_string();
        let instance_dir = config.root.join(format!(
            "{INSTANCE_PREFIX}{}-{}",
            getpid().as_raw(),
            &suffix[..8]
        ));
        std::fs::DirBuilder::new()
            .mode(0o700)
            .create(&instance_dir)
            .map_err(|source| EngineError::Workspace {
                path: instance_dir.clone(),
                source,
            })?;

        Ok(Self {
            root: config.root.clone(),
            instance_dir,
            grace: config.cleanup_grace(),
            reaper_interval: config.reaper_interval(),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding this daemon's workspaces.
    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    /// Create a fresh, empty workspace for `execution_id`.
    ///
    /// The directory name carries a random suffix and creation fails rather
    /// than reusing an existing directory.
    pub async fn allocate(&self, execution_id: &str) -> Result<Workspace, EngineError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{WORKSPACE_PREFIX}{}-{}",
            sanitize_id(execution_id),
            &suffix[..12]
        );
        let path = self.instance_dir.join(name);

        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(0o700);
        builder
            .create(&path)
            .await
            .map_err(|source| EngineError::Workspace {
                path: path.clone(),
                source,
            })?;

        debug!(execution_id = %execution_id, path = %path.display(), "Allocated workspace");
        Ok(Workspace {
            path,
            execution_id: execution_id.to_string(),
            created_at: Instant::now(),
        })
    }

    /// Write a new file into the workspace.
    ///
    /// `filename` must be a single plain path component; the file must not
    /// already exist.
    pub async fn write(
        &self,
        workspace: &Workspace,
        filename: &str,
        content: &str,
    ) -> Result<PathBuf, EngineError> {
        if !is_plain_filename(filename) {
            return Err(EngineError::Validation(format!(
                "filename '{filename}' is not a plain file name"
            )));
        }
        let path = workspace.path.join(filename);
        let as_workspace_error = |source| EngineError::Workspace {
            path: path.clone(),
            source,
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .await
            .map_err(as_workspace_error)?;
        file.write_all(content.as_bytes())
            .await
            .map_err(as_workspace_error)?;
        file.flush().await.map_err(as_workspace_error)?;

        Ok(path)
    }

    /// Remove a workspace immediately.
    ///
    /// Returns `Ok(false)` if it was already gone.
    pub async fn destroy(&self, workspace: &Workspace) -> io::Result<bool> {
        remove_dir(&workspace.path).await
    }

    /// Queue a workspace for deletion once the grace period has elapsed.
    ///
    /// Synchronous so it can run from `Drop` on every exit path.
    pub fn schedule_destroy(&self, workspace: &Workspace) {
        let due = Instant::now() + self.grace;
        self.lock_pending().push(PendingDeletion {
            path: workspace.path.clone(),
            due,
        });
        debug!(path = %workspace.path.display(), grace_ms = self.grace.as_millis(), "Workspace deletion scheduled");
    }

    /// Number of workspaces waiting for deletion.
    pub fn pending(&self) -> usize {
        self.lock_pending().len()
    }

    /// Delete every workspace whose grace period has elapsed.
    ///
    /// Returns the number of entries processed. Failures are logged only.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let due: Vec<PendingDeletion> = {
            let mut pending = self.lock_pending();
            let (due, waiting): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|p| p.due <= now);
            *pending = waiting;
            due
        };
        remove_all(due).await
    }

    /// Delete every pending workspace regardless of grace (shutdown path).
    pub async fn drain(&self) -> usize {
        let all: Vec<PendingDeletion> = std::mem::take(&mut *self.lock_pending());
        remove_all(all).await
    }

    /// Remove instance directories left behind by daemons that are no
    /// longer running.
    ///
    /// Directories of live daemons, including this one, are never touched.
    /// Returns the number of instance directories removed.
    pub async fn reclaim_stale(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.root.display(), error = %e, "Cannot read workspace root");
                return 0;
            }
        };

        let mut reclaimed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Error reading workspace root entry");
                    break;
                }
            };
            let path = entry.path();
            if path == self.instance_dir {
                continue;
            }
            let Some(owner) = instance_owner(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if owner_alive(owner) {
                continue;
            }
            match remove_dir(&path).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to reclaim workspace"),
            }
        }

        if reclaimed > 0 {
            info!(count = reclaimed, "Reclaimed stale workspaces");
        }
        reclaimed
    }

    /// Remove this daemon's instance directory if nothing is left in it.
    pub async fn release_instance_dir(&self) {
        if let Err(e) = tokio::fs::remove_dir(&self.instance_dir).await {
            debug!(path = %self.instance_dir.display(), error = %e, "Instance directory kept");
        }
    }

    /// Start the background reaper task.
    ///
    /// Returns a `JoinHandle` that runs until aborted. The reaper sweeps
    /// due deletions every `reaper_interval`.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.reaper_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                let removed = manager.sweep().await;
                if removed > 0 {
                    debug!(count = removed, "Reaper sweep");
                }
            }
        })
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<PendingDeletion>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pid encoded in an instance directory name.
fn instance_owner(name: &str) -> Option<Pid> {
    let pid: i32 = name
        .strip_prefix(INSTANCE_PREFIX)?
        .split('-')
        .next()?
        .parse()
        .ok()?;
    (pid > 0).then_some(Pid::from_raw(pid))
}

/// Sending no signal only checks the pid; `EPERM` still means it exists.
fn owner_alive(pid: Pid) -> bool {
    !matches!(kill(pid, None::<Signal>), Err(Errno::ESRCH))
}

async fn remove_all(entries: Vec<PendingDeletion>) -> usize {
    let count = entries.len();
    for entry in entries {
        if let Err(e) = remove_dir(&entry.path).await {
            warn!(path = %entry.path.display(), error = %e, "Failed to remove workspace");
        }
    }
    count
}

async fn remove_dir(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed workspace");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Validate a caller-influenced source filename against `extension`.
///
/// Accepts a single path component of `[A-Za-z0-9_.-]`, not starting with a
/// dot, ending in `.{extension}`.
pub fn validate_filename(filename: &str, extension: &str) -> Result<(), EngineError> {
    let reject = |reason: &str| -> Result<(), EngineError> {
        Err(EngineError::Validation(format!(
            "invalid filename '{filename}': {reason}"
        )))
    };

    if filename.is_empty() || filename.len() > MAX_FILENAME_LEN {
        return reject("length must be 1-128 characters");
    }
    if filename.starts_with('.') {
        return reject("must not start with '.'");
    }
    if !filename
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return reject("only letters, digits, '_', '-' and '.' are allowed");
    }
    if !is_plain_filename(filename) {
        return reject("must be a single path component");
    }
    let stem_len = filename
        .strip_suffix(extension)
        .and_then(|rest| rest.strip_suffix('.'))
        .map(str::len);
    match stem_len {
        Some(len) if len > 0 => Ok(()),
        _ => reject(format!("must end with '.{extension}'").as_str()),
    }
}

fn is_plain_filename(filename: &str) -> bool {
    let mut components = Path::new(filename).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !filename.contains('/')
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .take(64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(dir: &Path, grace_ms: u64) -> WorkspaceManager {
        let config = WorkspaceConfig {
            root: dir.to_path_buf(),
            cleanup_grace_ms: grace_ms,
            reaper_interval_ms: 10,
            reclaim_stale: true,
        };
        WorkspaceManager::new(&config).unwrap()
    }

    #[tokio::test]
    async fn allocate_creates_unique_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), 0);

        let a = manager.allocate("same-id").await.unwrap();
        let b = manager.allocate("same-id").await.unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(manager.instance_dir()));
        assert!(manager.instance_dir().starts_with(dir.path()));
        assert_eq!(a.execution_id(), "same-id");
        assert_eq!(std::fs::read_dir(a.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn allocate_sanitizes_hostile_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), 0);
        let ws = manager.allocate("../../etc").await.unwrap();
        assert_eq!(ws.path().parent(), Some(manager.instance_dir()));
    }

    #[tokio::test]
    async fn same_filename_in_two_workspaces_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), 0);
        let a = manager.allocate("a").await.unwrap();
        let b = manager.allocate("b").await.unwrap();

        let pa = manager.write(&a, "main.py", "print('a')").await.unwrap();
        let pb = manager.write(&b, "main.py", "print('b')").await.unwrap();

        assert_eq!(std::fs::read_to_string(pa).unwrap(), "print('a')");
        assert_eq!(std::fs::read_to_string(pb).unwrap(), "print('b')");
    }

    #[tokio::test]
    async fn write_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), 0);
        let ws = manager.allocate("x").await.unwrap();

        for name in ["../escape.py", "/etc/passwd", "sub/dir.py", "..", ""] {
            let err = manager.write(&ws, name, "x").await.unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)), "{name} should be rejected");
        }
    }

    #[tokio::test]
    async fn write_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), 0);
        let ws = manager.allocate("x").await.unwrap();
        manager.write(&ws, "main.c", "int main(){}").await.unwrap();
        let err = manager.write(&ws, "main.c", "again").await.unwrap_err();
        assert!(matches!(err, EngineError::Workspace { .. }));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), 0);
        let ws = manager.allocate("gone").await.unwrap();
        manager.write(&ws, "main.sh", "echo hi").await.unwrap();

        assert!(manager.destroy(&ws).await.unwrap());
        assert!(!ws.path().exists());
        // Second destroy is a no-op, not an error
        assert!(!manager.destroy(&ws).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_respects_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), 60_000);
        let ws = manager.allocate("slow").await.unwrap();

        manager.schedule_destroy(&ws);
        assert_eq!(manager.sweep().await, 0);
        assert!(ws.path().exists());
        assert_eq!(manager.pending(), 1);

        assert_eq!(manager.drain().await, 1);
        assert!(!ws.path().exists());
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn sweep_removes_due_and_tolerates_already_removed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), 0);
        let a = manager.allocate("a").await.unwrap();
        let b = manager.allocate("b").await.unwrap();

        manager.destroy(&b).await.unwrap();
        manager.schedule_destroy(&a);
        manager.schedule_destroy(&b);

        assert_eq!(manager.sweep().await, 2);
        assert!(!a.path().exists());
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn reaper_removes_scheduled_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager_in(dir.path(), 0));
        let ws = manager.allocate("reaped").await.unwrap();
        manager.schedule_destroy(&ws);

        let reaper = manager.start_reaper();
        for _ in 0..100 {
            if !ws.path().exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        reaper.abort();
        assert!(!ws.path().exists());
    }

    /// A pid that is not running: spawn a short-lived child and reap it.
    fn dead_pid() -> i32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        child.wait().unwrap();
        pid
    }

    #[tokio::test]
    async fn reclaim_stale_removes_only_dead_daemons_directories() {
        let dir = tempfile::tempdir().unwrap();
        let dead = dir.path().join(format!("daemon-{}-deadbeef", dead_pid()));
        std::fs::create_dir_all(dead.join("ws-old-123")).unwrap();
        std::fs::create_dir(dir.path().join("unrelated")).unwrap();
        std::fs::create_dir(dir.path().join("daemon-garbage")).unwrap();
        let manager = manager_in(dir.path(), 0);

        assert_eq!(manager.reclaim_stale().await, 1);
        assert!(!dead.exists());
        assert!(dir.path().join("unrelated").exists());
        assert!(dir.path().join("daemon-garbage").exists());
        assert!(manager.instance_dir().exists());
    }

    #[tokio::test]
    async fn daemons_sharing_a_root_keep_each_others_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager_in(dir.path(), 0);
        let live = first.allocate("busy").await.unwrap();
        first.write(&live, "main.sh", "sleep 60").await.unwrap();

        // A second daemon (same pid here, so certainly alive) starts up.
        let second = manager_in(dir.path(), 0);
        assert_ne!(first.instance_dir(), second.instance_dir());
        assert_eq!(second.reclaim_stale().await, 0);
        assert!(live.path().join("main.sh").exists());
    }

    #[tokio::test]
    async fn release_instance_dir_keeps_busy_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), 0);
        let ws = manager.allocate("late").await.unwrap();

        manager.release_instance_dir().await;
        assert!(manager.instance_dir().exists());

        manager.destroy(&ws).await.unwrap();
        manager.release_instance_dir().await;
        assert!(!manager.instance_dir().exists());
    }

    #[test]
    fn instance_owner_parses_pid() {
        assert_eq!(instance_owner("daemon-4242-ab12cd34"), Some(Pid::from_raw(4242)));
        assert_eq!(instance_owner("daemon-0-ab12cd34"), None);
        assert_eq!(instance_owner("daemon-x-1"), None);
        assert_eq!(instance_owner("ws-4242"), None);
    }

    #[test]
    fn filename_validation() {
        assert!(validate_filename("main.py", "py").is_ok());
        assert!(validate_filename("Main.java", "java").is_ok());
        assert!(validate_filename("solution_2.cpp", "cpp").is_ok());

        assert!(validate_filename("main.js", "py").is_err());
        assert!(validate_filename(".py", "py").is_err());
        assert!(validate_filename("py", "py").is_err());
        assert!(validate_filename("../main.py", "py").is_err());
        assert!(validate_filename("a/main.py", "py").is_err());
        assert!(validate_filename("main .py", "py").is_err());
        assert!(validate_filename(".hidden.py", "py").is_err());
        assert!(validate_filename(&format!("{}.py", "a".repeat(200)), "py").is_err());
    }
}
