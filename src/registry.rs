//! Language profile registry.
//!
//! The registry is an allow-list built once at startup from the built-in
//! catalogue plus operator configuration. It is never mutated afterwards and
//! is shared read-only between executions. Toolchain commands are fixed argv
//! templates; the only values substituted into them are the validated source
//! filename (`{file}`) and its stem (`{stem}`).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::{Config, LanguageOverride};
use crate::error::EngineError;
use crate::workspace::validate_filename;

const FILE_PLACEHOLDER: &str = "{file}";
const STEM_PLACEHOLDER: &str = "{stem}";

const MIB: u64 = 1024 * 1024;

/// How a language is compiled and run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    /// Canonical language id.
    pub id: String,
    /// Alternative ids accepted from callers.
    pub aliases: Vec<String>,
    /// Source file extension without the dot.
    pub file_extension: String,
    /// Filename used when the request does not name one.
    pub default_filename: String,
    /// Run in the in-process sandbox instead of a child process.
    pub sandboxed: bool,
    /// Compile argv template, if the language has a compile step.
    pub compile_command: Option<Vec<String>>,
    /// Run argv template. Empty for sandboxed languages.
    pub run_command: Vec<String>,
    pub memory_limit_bytes: u64,
    pub default_timeout_ms: u64,
    /// Budget for the compile step, independent of the run timeout.
    pub compile_timeout_ms: u64,
    /// Extra environment for the toolchain process.
    pub env: Vec<(String, String)>,
}

impl LanguageProfile {
    fn process(id: &str, extension: &str, run: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            aliases: Vec::new(),
            file_extension: extension.to_string(),
            default_filename: format!("main.{extension}"),
            sandboxed: false,
            compile_command: None,
            run_command: owned(run),
            memory_limit_bytes: 256 * MIB,
            default_timeout_ms: 10_000,
            compile_timeout_ms: 30_000,
            env: Vec::new(),
        }
    }

    fn compiled(id: &str, extension: &str, compile: &[&str], run: &[&str]) -> Self {
        Self {
            compile_command: Some(owned(compile)),
            ..Self::process(id, extension, run)
        }
    }

    fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = owned(aliases);
        self
    }

    fn with_env(mut self, env: &[(&str, &str)]) -> Self {
        self.env = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self
    }

    /// Render the compile argv for `filename`, if this language compiles.
    pub fn compile_argv(&self, filename: &str) -> Option<Vec<String>> {
        self.compile_command
            .as_deref()
            .map(|template| render(template, filename))
    }

    /// Render the run argv for `filename`.
    pub fn run_argv(&self, filename: &str) -> Vec<String> {
        render(&self.run_command, filename)
    }

    fn invalid(&self, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidProfile {
            language: self.id.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if !is_language_id(&self.id) {
            return Err(self.invalid("id must be lowercase alphanumerics, '-', '+' or '_'"));
        }
        if self.file_extension.is_empty()
            || !self.file_extension.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(self.invalid("file extension must be alphanumeric"));
        }
        validate_filename(&self.default_filename, &self.file_extension)
            .map_err(|e| self.invalid(e.to_string()))?;
        if self.default_timeout_ms == 0 || self.compile_timeout_ms == 0 {
            return Err(self.invalid("timeouts must be positive"));
        }
        if self.sandboxed {
            if self.compile_command.is_some() {
                return Err(self.invalid("sandboxed languages cannot have a compile step"));
            }
        } else if self.run_command.is_empty() {
            return Err(self.invalid("run command is empty"));
        }
        if self.compile_command.as_ref().is_some_and(Vec::is_empty) {
            return Err(self.invalid("compile command is empty"));
        }
        Ok(())
    }

    fn apply(&mut self, ov: &LanguageOverride) {
        if let Some(aliases) = &ov.aliases {
            self.aliases.clone_from(aliases);
        }
        if let Some(ext) = &ov.file_extension {
            self.file_extension.clone_from(ext);
            if ov.default_filename.is_none() {
                self.default_filename = format!("main.{ext}");
            }
        }
        if let Some(name) = &ov.default_filename {
            self.default_filename.clone_from(name);
        }
        if let Some(sandboxed) = ov.sandboxed {
            self.sandboxed = sandboxed;
        }
        if let Some(compile) = &ov.compile {
            self.compile_command = (!compile.is_empty()).then(|| compile.clone());
        }
        if let Some(run) = &ov.run {
            self.run_command.clone_from(run);
        }
        if let Some(mb) = ov.memory_mb {
            self.memory_limit_bytes = mb.saturating_mul(MIB);
        }
        if let Some(secs) = ov.timeout_seconds {
            self.default_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(secs) = ov.compile_timeout_seconds {
            self.compile_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(env) = &ov.env {
            let mut env: Vec<_> = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            env.sort();
            self.env = env;
        }
    }
}

/// Summary of a language for listing to callers.
#[derive(Debug, Clone, Serialize)]
pub struct LanguageSummary {
    pub id: String,
    pub aliases: Vec<String>,
    pub sandboxed: bool,
    pub compiled: bool,
    pub default_timeout_ms: u64,
}

/// Immutable lookup table from language id to profile.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: BTreeMap<String, Arc<LanguageProfile>>,
    aliases: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Registry containing only the built-in catalogue.
    pub fn builtin() -> Self {
        // The built-in table is statically valid; see `builtin_profiles_validate`.
        Self::build(builtin_profiles()).unwrap_or_else(|_| Self {
            profiles: BTreeMap::new(),
            aliases: HashMap::new(),
        })
    }

    /// Registry from the built-in catalogue adjusted by `config`.
    ///
    /// Disabled languages are removed, overrides are applied over built-ins,
    /// and entries with unknown ids define new languages.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let mut profiles: BTreeMap<String, LanguageProfile> = builtin_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        for id in &config.disabled_languages {
            if profiles.remove(&id.to_ascii_lowercase()).is_some() {
                info!(language = %id, "Language disabled by configuration");
            }
        }

        let mut ids: Vec<_> = config.languages.keys().collect();
        ids.sort();
        for id in ids {
            let ov = &config.languages[id];
            let key = id.to_ascii_lowercase();
            if let Some(profile) = profiles.get_mut(&key) {
                info!(language = %key, "Configuration overrides built-in language");
                profile.apply(ov);
            } else {
                let extension = ov.file_extension.clone().unwrap_or_default();
                let mut profile = LanguageProfile::process(&key, &extension, &[]);
                profile.apply(ov);
                info!(language = %key, "Configuration defines language");
                profiles.insert(key, profile);
            }
        }

        Self::build(profiles.into_values().collect())
    }

    fn build(list: Vec<LanguageProfile>) -> Result<Self, EngineError> {
        let mut profiles = BTreeMap::new();
        let mut aliases = HashMap::new();

        for profile in list {
            profile.validate()?;
            if profiles.contains_key(&profile.id) || aliases.contains_key(&profile.id) {
                return Err(profile.invalid("duplicate language id"));
            }
            for alias in &profile.aliases {
                let alias = alias.to_ascii_lowercase();
                if profiles.contains_key(&alias) || aliases.contains_key(&alias) {
                    return Err(profile.invalid(format!("alias '{alias}' is already taken")));
                }
                aliases.insert(alias, profile.id.clone());
            }
            profiles.insert(profile.id.clone(), Arc::new(profile));
        }

        Ok(Self { profiles, aliases })
    }

    /// Look up a profile by id or alias, case-insensitively.
    pub fn resolve(&self, language: &str) -> Result<Arc<LanguageProfile>, EngineError> {
        let key = language.trim().to_ascii_lowercase();
        let id = self.aliases.get(&key).unwrap_or(&key);
        self.profiles
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }

    /// All profiles in id order.
    pub fn profiles(&self) -> impl Iterator<Item = &Arc<LanguageProfile>> {
        self.profiles.values()
    }

    pub fn summaries(&self) -> Vec<LanguageSummary> {
        self.profiles()
            .map(|p| LanguageSummary {
                id: p.id.clone(),
                aliases: p.aliases.clone(),
                sandboxed: p.sandboxed,
                compiled: p.compile_command.is_some(),
                default_timeout_ms: p.default_timeout_ms,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn builtin_profiles() -> Vec<LanguageProfile> {
    vec![
        LanguageProfile::process("javascript", "js", &["node", FILE_PLACEHOLDER])
            .with_aliases(&["js", "node"]),
        LanguageProfile::process("python", "py", &["python3", "-u", FILE_PLACEHOLDER])
            .with_aliases(&["py", "python3"])
            .with_env(&[("PYTHONDONTWRITEBYTECODE", "1"), ("PYTHONUNBUFFERED", "1")]),
        LanguageProfile::process("bash", "sh", &["bash", FILE_PLACEHOLDER]),
        LanguageProfile::process("sh", "sh", &["sh", FILE_PLACEHOLDER]).with_aliases(&["shell"]),
        LanguageProfile::process("ruby", "rb", &["ruby", FILE_PLACEHOLDER]).with_aliases(&["rb"]),
        LanguageProfile::compiled(
            "c",
            "c",
            &["gcc", "-O2", "-std=c17", "-o", "main", FILE_PLACEHOLDER, "-lm"],
            &["./main"],
        ),
        LanguageProfile::compiled(
            "cpp",
            "cpp",
            &["g++", "-O2", "-std=c++17", "-o", "main", FILE_PLACEHOLDER],
            &["./main"],
        )
        .with_aliases(&["c++", "cxx"]),
        LanguageProfile {
            default_filename: "Main.java".to_string(),
            memory_limit_bytes: 512 * MIB,
            default_timeout_ms: 15_000,
            ..LanguageProfile::compiled(
                "java",
                "java",
                &["javac", FILE_PLACEHOLDER],
                &["java", "-cp", ".", STEM_PLACEHOLDER],
            )
        },
        LanguageProfile {
            compile_timeout_ms: 60_000,
            ..LanguageProfile::compiled(
                "go",
                "go",
                &["go", "build", "-o", "main", FILE_PLACEHOLDER],
                &["./main"],
            )
            .with_aliases(&["golang"])
            .with_env(&[("CGO_ENABLED", "0")])
        },
        LanguageProfile {
            compile_timeout_ms: 60_000,
            ..LanguageProfile::compiled(
                "rust",
                "rs",
                &["rustc", "-O", "-o", "main", FILE_PLACEHOLDER],
                &["./main"],
            )
            .with_aliases(&["rs"])
        },
        LanguageProfile {
            sandboxed: true,
            memory_limit_bytes: 64 * MIB,
            default_timeout_ms: 5_000,
            ..LanguageProfile::process("rhai", "rhai", &[])
        },
    ]
}

fn render(template: &[String], filename: &str) -> Vec<String> {
    let stem = Path::new(filename)
        .file_stem()
        .map_or_else(|| filename.to_string(), |s| s.to_string_lossy().into_owned());
    template
        .iter()
        .map(|arg| {
            arg.replace(FILE_PLACEHOLDER, filename)
                .replace(STEM_PLACEHOLDER, &stem)
        })
        .collect()
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn is_language_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '+' | '_'))
}
