//! Host platform facts: executable naming, virtual-environment layout and
//! PATH search.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Platform family the harness runs on.
///
/// Windows is the only family whose layouts and toolchains differ enough to
/// matter (`.exe` suffix, `Scripts/` venv layout, developer shell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Host {
    Windows,
    Unix,
}

impl Default for Host {
    fn default() -> Self {
        Self::current()
    }
}

impl Host {
    pub const fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    pub const fn is_windows(self) -> bool {
        matches!(self, Self::Windows)
    }

    pub const fn exe_suffix(self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            Self::Unix => "",
        }
    }

    /// `name` with the platform executable suffix, unless already present.
    pub fn executable_name(self, name: &str) -> String {
        let suffix = self.exe_suffix();
        if suffix.is_empty() || name.to_ascii_lowercase().ends_with(suffix) {
            name.to_string()
        } else {
            format!("{name}{suffix}")
        }
    }

    pub fn venv_bin_dir(self, venv: &Path) -> PathBuf {
        match self {
            Self::Windows => venv.join("Scripts"),
            Self::Unix => venv.join("bin"),
        }
    }

    /// Path of an executable installed inside a virtual environment.
    pub fn venv_tool(self, venv: &Path, name: &str) -> PathBuf {
        self.venv_bin_dir(venv).join(self.executable_name(name))
    }

    pub fn venv_interpreter(self, venv: &Path) -> PathBuf {
        self.venv_tool(venv, "python")
    }

    pub fn venv_installer(self, venv: &Path) -> PathBuf {
        self.venv_tool(venv, "pip")
    }
}

/// Executable lookup over `PATH` (or an explicit search path).
#[derive(Debug, Clone, Default)]
pub struct PathSearch {
    paths: Option<OsString>,
    host: Host,
}

impl PathSearch {
    /// Search the process `PATH`.
    pub fn system() -> Self {
        Self::default()
    }

    /// Search only the given `PATH`-style list.
    pub fn within(paths: impl Into<OsString>) -> Self {
        Self {
            paths: Some(paths.into()),
            host: Host::current(),
        }
    }

    /// Find `name`, retrying with the platform executable suffix.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        self.lookup(name).or_else(|| {
            let suffixed = self.host.executable_name(name);
            if suffixed == name {
                None
            } else {
                self.lookup(&suffixed)
            }
        })
    }

    fn lookup(&self, name: &str) -> Option<PathBuf> {
        match &self.paths {
            Some(paths) => {
                let cwd = std::env::current_dir().unwrap_or_default();
                which::which_in(name, Some(paths), cwd).ok()
            }
            None => which::which(name).ok(),
        }
    }
}

/// Host description recorded in the run session.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub os: String,
    pub family: Host,
    pub arch: String,
    pub cpus: usize,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            family: Host::current(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: cpu_count(),
        }
    }
}

/// Logical CPUs available to this process (at least 1).
pub fn cpu_count() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}
