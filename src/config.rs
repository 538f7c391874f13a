//! Daemon configuration.
//!
//! Configuration is read from a JSON file (named by `--config` or the
//! `RUNNER_CONFIG` environment variable) and then adjusted by a small set of
//! `RUNNER_*` environment overrides. Every section is optional.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Environment variable naming the JSON configuration file.
pub const CONFIG_ENV: &str = "RUNNER_CONFIG";

/// Host variables passed to toolchain processes when `passthrough_env` is
/// not configured.
pub const DEFAULT_PASSTHROUGH_ENV: &[&str] = &[
    "RUSTUP_HOME",
    "RUSTUP_TOOLCHAIN",
    "CARGO_HOME",
    "GOROOT",
    "JAVA_HOME",
];

/// Locations rustup and cargo use when their variable is unset. They are
/// relative to the daemon's `HOME`, which children do not see.
const HOME_RELATIVE_DEFAULTS: &[(&str, &str)] =
    &[("RUSTUP_HOME", ".rustup"), ("CARGO_HOME", ".cargo")];

/// Variables the process runner sets itself.
const RESERVED_ENV: &[&str] = &["PATH", "HOME", "TMPDIR"];

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Admission and request limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Workspace placement and cleanup.
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Bounds for the in-process script sandbox.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Per-language overrides and operator-defined languages, keyed by id.
    #[serde(default)]
    pub languages: HashMap<String, LanguageOverride>,

    /// Built-in languages to remove from the allow-list.
    #[serde(default)]
    pub disabled_languages: Vec<String>,

    /// `PATH` handed to toolchain processes. Defaults to the daemon's own.
    #[serde(default)]
    pub path: Option<String>,

    /// Host variables copied into toolchain processes.
    /// Defaults to [`DEFAULT_PASSTHROUGH_ENV`].
    #[serde(default)]
    pub passthrough_env: Option<Vec<String>>,
}

/// Admission and request limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum simultaneously running executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of requests waiting for a slot.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Upper bound for any caller-supplied timeout.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// Maximum accepted source size.
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,

    /// Maximum accepted stdin size.
    #[serde(default = "default_max_stdin_bytes")]
    pub max_stdin_bytes: usize,

    /// Per-stream output cap when the request does not set one.
    #[serde(default = "default_max_output_bytes")]
    pub default_max_output_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_depth: default_max_queue_depth(),
            max_timeout_ms: default_max_timeout_ms(),
            max_source_bytes: default_max_source_bytes(),
            max_stdin_bytes: default_max_stdin_bytes(),
            default_max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// Workspace placement and cleanup.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory under which per-execution workspaces are created.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,

    /// Delay between result finalization and workspace deletion.
    #[serde(default = "default_cleanup_grace_ms")]
    pub cleanup_grace_ms: u64,

    /// Interval between reaper sweeps.
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// Remove leftover workspaces from a previous run at startup.
    #[serde(default = "default_true")]
    pub reclaim_stale: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            cleanup_grace_ms: default_cleanup_grace_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            reclaim_stale: true,
        }
    }
}

impl WorkspaceConfig {
    pub const fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

/// Bounds applied to every sandbox engine instance.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Operation budget per run; 0 leaves only the wall-clock bound.
    #[serde(default)]
    pub max_operations: u64,

    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,

    #[serde(default = "default_max_expr_depth")]
    pub max_expr_depth: usize,

    #[serde(default = "default_max_string_bytes")]
    pub max_string_bytes: usize,

    #[serde(default = "default_max_collection_len")]
    pub max_array_len: usize,

    #[serde(default = "default_max_collection_len")]
    pub max_map_len: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_call_levels: default_max_call_levels(),
            max_expr_depth: default_max_expr_depth(),
            max_string_bytes: default_max_string_bytes(),
            max_array_len: default_max_collection_len(),
            max_map_len: default_max_collection_len(),
        }
    }
}

/// Operator override for a built-in language, or a full definition of a new
/// one. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LanguageOverride {
    #[serde(default)]
    pub aliases: Option<Vec<String>>,

    #[serde(default)]
    pub file_extension: Option<String>,

    #[serde(default)]
    pub default_filename: Option<String>,

    #[serde(default)]
    pub sandboxed: Option<bool>,

    /// Compile argv template. An empty list removes the compile step.
    #[serde(default)]
    pub compile: Option<Vec<String>>,

    /// Run argv template.
    #[serde(default)]
    pub run: Option<Vec<String>>,

    #[serde(default)]
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub compile_timeout_seconds: Option<u64>,

    /// Extra environment for the toolchain process.
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

impl Config {
    /// Load configuration, preferring an explicit path over `RUNNER_CONFIG`,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var(CONFIG_ENV) {
                Ok(path) => Self::from_file(Path::new(&path))?,
                Err(_) => {
                    debug!("No configuration file given, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Apply `RUNNER_*` overrides using `lookup` to read variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_var(&lookup, "RUNNER_MAX_CONCURRENT") {
            self.limits.max_concurrent = v;
        }
        if let Some(v) = parse_var(&lookup, "RUNNER_MAX_QUEUE") {
            self.limits.max_queue_depth = v;
        }
        if let Some(v) = parse_var(&lookup, "RUNNER_CLEANUP_GRACE_MS") {
            self.workspace.cleanup_grace_ms = v;
        }
        if let Some(root) = lookup("RUNNER_WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(root);
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.limits.max_concurrent > 0,
            "limits.max_concurrent must be at least 1"
        );
        anyhow::ensure!(
            self.limits.max_timeout_ms > 0,
            "limits.max_timeout_ms must be positive"
        );
        anyhow::ensure!(
            self.limits.default_max_output_bytes > 0,
            "limits.default_max_output_bytes must be positive"
        );
        anyhow::ensure!(
            self.workspace.reaper_interval_ms > 0,
            "workspace.reaper_interval_ms must be positive"
        );
        for name in self.passthrough_env.iter().flatten() {
            anyhow::ensure!(
                !name.is_empty() && !name.contains('=') && !RESERVED_ENV.contains(&name.as_str()),
                "passthrough_env cannot contain '{name}'"
            );
        }
        Ok(())
    }

    /// `PATH` for toolchain processes.
    pub fn toolchain_path(&self) -> String {
        self.path
            .clone()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".to_string())
    }

    /// Passthrough variables with their values from the daemon environment.
    pub fn toolchain_env(&self) -> Vec<(String, String)> {
        self.resolve_toolchain_env(|key| std::env::var(key).ok(), Path::is_dir)
    }

    fn resolve_toolchain_env(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
        exists: impl Fn(&Path) -> bool,
    ) -> Vec<(String, String)> {
        let names: Vec<&str> = self.passthrough_env.as_ref().map_or_else(
            || DEFAULT_PASSTHROUGH_ENV.to_vec(),
            |names| names.iter().map(String::as_str).collect(),
        );
        let home = lookup("HOME");

        names
            .into_iter()
            .filter_map(|name| {
                let value = lookup(name).or_else(|| {
                    let (_, dir) = HOME_RELATIVE_DEFAULTS.iter().find(|(var, _)| *var == name)?;
                    let path = Path::new(home.as_deref()?).join(dir);
                    exists(&path).then(|| path.to_string_lossy().into_owned())
                })?;
                Some((name.to_string(), value))
            })
            .collect()
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = %key, value = %raw, "Ignoring unparseable override");
            None
        }
    }
}

const fn default_max_concurrent() -> usize {
    4
}

const fn default_max_queue_depth() -> usize {
    32
}

const fn default_max_timeout_ms() -> u64 {
    60_000
}

const fn default_max_source_bytes() -> usize {
    1024 * 1024
}

const fn default_max_stdin_bytes() -> usize {
    1024 * 1024
}

const fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("code-exec-workspaces")
}

const fn default_cleanup_grace_ms() -> u64 {
    2_000
}

const fn default_reaper_interval_ms() -> u64 {
    1_000
}

const fn default_true() -> bool {
    true
}

const fn default_max_call_levels() -> usize {
    64
}

const fn default_max_expr_depth() -> usize {
    64
}

const fn default_max_string_bytes() -> usize {
    1024 * 1024
}

const fn default_max_collection_len() -> usize {
    100_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.limits.max_concurrent, 4);
        assert_eq!(config.limits.max_queue_depth, 32);
        assert_eq!(config.limits.max_timeout_ms, 60_000);
        assert_eq!(config.workspace.cleanup_grace(), Duration::from_secs(2));
        assert!(config.workspace.reclaim_stale);
        assert_eq!(config.sandbox.max_operations, 0);
        assert!(config.languages.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "limits": { "max_concurrent": 3, "max_queue_depth": 2 },
            "workspace": { "root": "/var/lib/runner", "cleanup_grace_ms": 500 },
            "sandbox": { "max_operations": 1000000 },
            "languages": {
                "python": { "timeout_seconds": 5 },
                "lua": {
                    "file_extension": "lua",
                    "run": ["lua", "{file}"],
                    "aliases": ["luajit"]
                }
            },
            "disabled_languages": ["go"],
            "path": "/opt/toolchains/bin:/usr/bin"
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.limits.max_concurrent, 3);
        assert_eq!(config.limits.max_queue_depth, 2);
        // Unset fields in a present section still get defaults
        assert_eq!(config.limits.max_timeout_ms, 60_000);
        assert_eq!(config.workspace.root, PathBuf::from("/var/lib/runner"));
        assert_eq!(config.workspace.cleanup_grace_ms, 500);
        assert_eq!(config.sandbox.max_operations, 1_000_000);

        let python = &config.languages["python"];
        assert_eq!(python.timeout_seconds, Some(5));
        assert!(python.run.is_none());

        let lua = &config.languages["lua"];
        assert_eq!(lua.run.as_deref(), Some(&["lua".to_string(), "{file}".to_string()][..]));
        assert_eq!(config.disabled_languages, vec!["go"]);
        assert_eq!(config.toolchain_path(), "/opt/toolchains/bin:/usr/bin");
    }

    #[test]
    fn overrides_take_priority() {
        let mut config = Config::from_json(r#"{"limits": {"max_concurrent": 8}}"#).unwrap();
        config.apply_overrides(|key| match key {
            "RUNNER_MAX_CONCURRENT" => Some("2".to_string()),
            "RUNNER_WORKSPACE_ROOT" => Some("/srv/ws".to_string()),
            _ => None,
        });
        assert_eq!(config.limits.max_concurrent, 2);
        assert_eq!(config.workspace.root, PathBuf::from("/srv/ws"));
        assert_eq!(config.limits.max_queue_depth, 32);
    }

    #[test]
    fn unparseable_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| (key == "RUNNER_MAX_QUEUE").then(|| "lots".to_string()));
        assert_eq!(config.limits.max_queue_depth, 32);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = Config::from_json(r#"{"limits": {"max_concurrent": 0}}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn toolchain_env_copies_set_variables_only() {
        let config = Config::default();
        let env = config.resolve_toolchain_env(
            |key| match key {
                "RUSTUP_HOME" => Some("/opt/rustup".to_string()),
                "GOROOT" => Some("/usr/lib/go".to_string()),
                "SECRET_TOKEN" => Some("hunter2".to_string()),
                _ => None,
            },
            |_| false,
        );
        assert_eq!(
            env,
            vec![
                ("RUSTUP_HOME".to_string(), "/opt/rustup".to_string()),
                ("GOROOT".to_string(), "/usr/lib/go".to_string()),
            ]
        );
    }

    #[test]
    fn toolchain_env_falls_back_to_rustup_under_host_home() {
        let config = Config::default();
        let env = config.resolve_toolchain_env(
            |key| (key == "HOME").then(|| "/home/dev".to_string()),
            |path| path == Path::new("/home/dev/.rustup") || path == Path::new("/home/dev/.cargo"),
        );
        assert_eq!(
            env,
            vec![
                ("RUSTUP_HOME".to_string(), "/home/dev/.rustup".to_string()),
                ("CARGO_HOME".to_string(), "/home/dev/.cargo".to_string()),
            ]
        );

        // Nothing is invented when the directories do not exist.
        let env = config.resolve_toolchain_env(
            |key| (key == "HOME").then(|| "/home/dev".to_string()),
            |_| false,
        );
        assert!(env.is_empty());
    }

    #[test]
    fn configured_passthrough_replaces_defaults() {
        let config =
            Config::from_json(r#"{"passthrough_env": ["NODE_PATH"]}"#).unwrap();
        assert!(config.validate().is_ok());
        let env = config.resolve_toolchain_env(
            |key| match key {
                "NODE_PATH" => Some("/usr/lib/node".to_string()),
                "RUSTUP_HOME" => Some("/opt/rustup".to_string()),
                _ => None,
            },
            |_| true,
        );
        assert_eq!(env, vec![("NODE_PATH".to_string(), "/usr/lib/node".to_string())]);
    }

    #[test]
    fn reserved_passthrough_names_are_rejected() {
        let config = Config::from_json(r#"{"passthrough_env": ["HOME"]}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        std::fs::write(&path, r#"{"limits": {"max_queue_depth": 7}}"#).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.limits.max_queue_depth, 7);
    }

    #[test]
    fn from_file_missing_is_error() {
        assert!(Config::from_file(Path::new("/nonexistent/runner.json")).is_err());
    }
}
