//! Error taxonomy for the harness.
//!
//! Stage-local faults are typed so the orchestrator and runner can map them
//! to a terminal status. Nothing in this module escapes the core: every
//! `CheckError` ends up as the message of a SKIP or FAIL result.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of a single subprocess invocation.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("I/O error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Faults raised by the harness components.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("CMake not found")]
    ToolUnavailable,

    #[error("no CMakeLists.txt found in expected locations ({})", display_paths(.searched))]
    BuildDescriptorMissing { searched: Vec<PathBuf> },

    #[error("CMake configure failed (exit code {code})")]
    ConfigureFailure { code: i32 },

    #[error("build failed (exit code {code})")]
    BuildFailure { code: i32 },

    #[error("executable '{name}' not found under {}", .build_dir.display())]
    ArtifactNotFound { name: String, build_dir: PathBuf },

    #[error("timed out after {}s", .0.as_secs())]
    ExecutionTimeout(Duration),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("entry script not found: {}", .0.display())]
    EntryNotFound(PathBuf),

    #[error("failed to bootstrap build tools: {0}")]
    EnvironmentBootstrapFailure(String),

    #[error("no usable Python interpreter found (wanted {wanted})")]
    InterpreterNotFound { wanted: String },

    #[error("failed to create virtual environment at {}: {reason}", .path.display())]
    EnvironmentCreation { path: PathBuf, reason: String },

    #[error("pip install failed: {0}")]
    DependencyInstallFailure(String),

    #[error("developer shell capture failed: {0}")]
    EnvironmentCaptureFailure(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Process(ProcessError),
}

impl CheckError {
    /// Whether this fault is a missing prerequisite that a skip policy may
    /// downgrade to SKIP. Anything raised after the tool was found is not.
    pub const fn is_missing_prerequisite(&self) -> bool {
        matches!(self, Self::ToolUnavailable | Self::BuildDescriptorMissing { .. })
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Watchdog expiry becomes `ExecutionTimeout`; other process faults pass through.
impl From<ProcessError> for CheckError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Timeout(limit) => Self::ExecutionTimeout(limit),
            other => Self::Process(other),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
