//! Subprocess execution.
//!
//! Every external command the harness runs (interpreters, pip, cmake, the
//! built artifact) goes through the [`Executor`] trait. The production
//! implementation is [`ProcessExecutor`]; tests substitute a scripted one.

mod process;

#[cfg(test)]
pub(crate) mod mock;

pub use process::ProcessExecutor;

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProcessError;

/// Default deadline for housekeeping commands (venv creation, pip, bootstrap).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// A fully described command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Complete environment for the child. `None` inherits the parent's.
    pub env: Option<BTreeMap<String, String>>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command as one shell-ish line, for logs and test matching.
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code of the process (-1 when terminated by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands to completion under their deadline.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `cmd`, returning its output once it exits.
    ///
    /// A non-zero exit is not an error; only spawn failures, I/O failures and
    /// watchdog expiry are.
    async fn run(&self, cmd: &CommandSpec) -> Result<ProcessOutput, ProcessError>;
}
