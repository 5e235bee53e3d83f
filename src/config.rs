//! Harness configuration.
//!
//! Loaded from `devcheck.json` under the run root. Every field has a
//! default, so a missing file means "discover interpreted projects and use
//! the default native build layout".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Default configuration file name, relative to the run root.
pub const DEFAULT_CONFIG_FILE: &str = "devcheck.json";

/// Top-level configuration for one harness run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Interpreted projects to verify. Entries may be bare paths.
    #[serde(
        default,
        alias = "python_projects",
        deserialize_with = "deserialize_projects"
    )]
    pub projects: Vec<ProjectSpec>,

    /// The native (CMake) project.
    #[serde(default, alias = "cpp")]
    pub native: NativeBuildSpec,
}

/// One interpreted project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProjectSpec {
    /// Project directory relative to the run root.
    pub path: String,

    /// Entry script, relative to the project directory.
    #[serde(default = "default_entry")]
    pub entry: String,

    /// Token that must appear (case-insensitively) in the output.
    #[serde(default = "default_expect")]
    pub expect: String,

    /// Package manifest override (defaults to `requirements.txt`).
    #[serde(default)]
    pub requirements: Option<String>,

    /// Interpreter version hint, e.g. "3.11".
    #[serde(default)]
    pub python_version: Option<String>,

    /// Deadline for the entry-point run.
    #[serde(default = "default_project_timeout", alias = "timeout")]
    pub timeout_seconds: u64,
}

impl ProjectSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entry: default_entry(),
            expect: default_expect(),
            requirements: None,
            python_version: None,
            timeout_seconds: default_project_timeout(),
        }
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Manifest file name inside the project directory.
    pub fn manifest_name(&self) -> &str {
        self.requirements.as_deref().unwrap_or("requirements.txt")
    }
}

/// The native project built through CMake.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NativeBuildSpec {
    /// Directory holding `CMakeLists.txt`, relative to the run root.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Build output directory, relative to the run root.
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,

    /// Executable target name, without platform suffix.
    #[serde(default = "default_target")]
    pub target: String,

    /// Extra arguments passed to the built executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Logical compiler name: "gcc", "clang" or "msvc".
    #[serde(default)]
    pub force_compiler: Option<String>,

    /// Explicit path to the cmake binary.
    #[serde(default, alias = "cmake_path")]
    pub tool_path: Option<PathBuf>,

    /// Report SKIP instead of FAIL when cmake or `CMakeLists.txt` is missing.
    #[serde(default)]
    pub allow_skip: bool,

    /// Deadline applied to configure, build and run individually.
    #[serde(default = "default_native_timeout", alias = "timeout")]
    pub timeout_seconds: u64,

    /// CMake build configuration ("Debug", "Release", ...).
    #[serde(default = "default_build_type")]
    pub build_type: String,
}

impl Default for NativeBuildSpec {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            build_dir: default_build_dir(),
            target: default_target(),
            args: Vec::new(),
            force_compiler: None,
            tool_path: None,
            allow_skip: false,
            timeout_seconds: default_native_timeout(),
            build_type: default_build_type(),
        }
    }
}

impl NativeBuildSpec {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl HarnessConfig {
    /// Load configuration from `path`.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("Invalid configuration file {}", path.display()))?;
        info!(
            path = %path.display(),
            projects = config.projects.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Like [`load`](Self::load), but a broken file is logged and the run
    /// continues with defaults and project discovery.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            error!(path = %path.display(), error = %format!("{e:#}"), "Ignoring unreadable configuration");
            Self::default()
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Apply the global timeout: it replaces the native timeout and caps
    /// each project's own timeout.
    pub fn apply_timeout_cap(&mut self, seconds: u64) {
        self.native.timeout_seconds = seconds;
        for project in &mut self.projects {
            project.timeout_seconds = project.timeout_seconds.min(seconds);
        }
    }

    /// Configured projects, or the discovered ones when none are configured.
    pub fn resolved_projects(&self, root: &Path) -> Vec<ProjectSpec> {
        if self.projects.is_empty() {
            let found = discover_projects(root);
            info!(count = found.len(), "Discovered interpreted projects");
            found
        } else {
            self.projects.clone()
        }
    }
}

const SEARCH_DIRS: &[&str] = &["src", "scripts", "python", ""];
const ENTRY_NAMES: &[&str] = &["main.py", "app.py", "run.py", "__main__.py", "cli.py"];
const ENTRY_MARKERS: &[&str] = &["if __name__", "def main"];
const SKIP_MARKERS: &[&str] = &[".git", "venv", ".venv"];
const PRUNED_DIRS: &[&str] = &["venv", "node_modules", "__pycache__", "site-packages"];

/// Scan the well-known directories under `root` for interpreted projects.
///
/// A directory qualifies when it holds one of the conventional entry
/// scripts and that script looks runnable. Hidden and environment
/// directories are not descended into; directories carrying a repository
/// or environment marker are skipped. Results are sorted by path.
pub fn discover_projects(root: &Path) -> Vec<ProjectSpec> {
    let mut found: BTreeMap<String, ProjectSpec> = BTreeMap::new();

    for sub in SEARCH_DIRS {
        let base = if sub.is_empty() {
            root.to_path_buf()
        } else {
            root.join(sub)
        };
        if !base.is_dir() {
            continue;
        }

        let walker = WalkDir::new(&base)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_pruned(e));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Error walking project directory");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            if SKIP_MARKERS.iter().any(|m| dir.join(m).exists()) {
                continue;
            }
            let Some(entry_name) = runnable_entry(dir) else {
                continue;
            };
            let Ok(relative) = dir.strip_prefix(root) else {
                continue;
            };
            let rel = relative.to_string_lossy().replace('\\', "/");
            found.entry(rel.clone()).or_insert_with(|| {
                debug!(path = %rel, entry = entry_name, "Discovered project");
                ProjectSpec {
                    entry: entry_name.to_string(),
                    ..ProjectSpec::new(rel)
                }
            });
        }
    }

    found.into_values().collect()
}

fn is_pruned(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || PRUNED_DIRS.contains(&name.as_ref())
}

fn runnable_entry(dir: &Path) -> Option<&'static str> {
    ENTRY_NAMES.iter().copied().find(|name| {
        let path = dir.join(name);
        if !path.is_file() {
            return false;
        }
        std::fs::read(&path).is_ok_and(|bytes| {
            let content = String::from_utf8_lossy(&bytes);
            ENTRY_MARKERS.iter().any(|m| content.contains(m))
        })
    })
}

fn deserialize_projects<'de, D>(deserializer: D) -> Result<Vec<ProjectSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        Path(String),
        Spec(ProjectSpec),
    }

    let entries = Vec::<Entry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .map(|e| match e {
            Entry::Path(path) => ProjectSpec::new(path),
            Entry::Spec(spec) => spec,
        })
        .collect())
}

fn default_entry() -> String {
    "main.py".into()
}

fn default_expect() -> String {
    "working".into()
}

const fn default_project_timeout() -> u64 {
    60
}

fn default_source_dir() -> PathBuf {
    "scripts".into()
}

fn default_build_dir() -> PathBuf {
    ".devcheck/build".into()
}

fn default_target() -> String {
    "app".into()
}

const fn default_native_timeout() -> u64 {
    300
}

fn default_build_type() -> String {
    "Debug".into()
}
