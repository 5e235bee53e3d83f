//! CMake discovery and bootstrap.
//!
//! Resolution order, first hit wins:
//! 1. `tool_path` from the native build configuration
//! 2. the `CMAKE_BIN` environment variable
//! 3. `cmake` on `PATH`
//! 4. the CMake bundled with a Visual Studio 2022 install (Windows)
//! 5. a private tool environment with `cmake` and `ninja` installed by pip
//!
//! The resolver owns the per-run caches: the first successful handle is
//! returned verbatim to every later caller, and the bootstrap is attempted
//! at most once whether it succeeds or not.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NativeBuildSpec;
use crate::error::CheckError;
use crate::exec::{CommandSpec, Executor, DEFAULT_TIMEOUT};
use crate::host::{Host, PathSearch};
use crate::result::{tail, OUTPUT_TAIL_CHARS};
use crate::venv::{venv_command, venv_complete, DEFAULT_INTERPRETERS};

/// Environment variable naming an explicit cmake binary.
pub const TOOL_ENV_VAR: &str = "CMAKE_BIN";

/// Bootstrap tool environment, relative to the run root.
pub const TOOL_VENV_DIR: &str = ".devcheck/toolvenv";

const BOOTSTRAP_PACKAGES: &[&str] = &["cmake>=3.26", "ninja"];

const VS_ROOTS: &[&str] = &[
    r"C:\Program Files\Microsoft Visual Studio\2022",
    r"C:\Program Files (x86)\Microsoft Visual Studio\2022",
];
const VS_EDITIONS: &[&str] = &["Community", "Professional", "Enterprise", "BuildTools"];
const VS_CMAKE: &str = "Common7/IDE/CommonExtensions/Microsoft/CMake/CMake/bin/cmake.exe";

/// Where a toolchain handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    Override,
    EnvVar,
    Path,
    Ide,
    Bootstrap,
}

/// A usable cmake binary and what is needed to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainHandle {
    pub binary: PathBuf,
    /// Variables to layer over the inherited environment.
    pub overlay: BTreeMap<String, String>,
    /// The bootstrap installed `ninja` next to `cmake`.
    pub generator_available: bool,
    pub source: ToolSource,
}

impl ToolchainHandle {
    fn found(binary: PathBuf, source: ToolSource) -> Self {
        Self {
            binary,
            overlay: BTreeMap::new(),
            generator_available: false,
            source,
        }
    }
}

/// Locates cmake for one run.
pub struct ToolchainResolver {
    root: PathBuf,
    host: Host,
    search: PathSearch,
    env_override: Option<PathBuf>,
    ide_roots: Vec<PathBuf>,
    executor: Arc<dyn Executor>,
    resolved: OnceCell<ToolchainHandle>,
    bootstrapped: OnceCell<Option<ToolchainHandle>>,
}

impl ToolchainResolver {
    /// Resolver for `root`, reading `CMAKE_BIN` from the process environment.
    pub fn new(root: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        Self {
            root: root.into(),
            host: Host::current(),
            search: PathSearch::system(),
            env_override: std::env::var_os(TOOL_ENV_VAR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            ide_roots: VS_ROOTS.iter().map(PathBuf::from).collect(),
            executor,
            resolved: OnceCell::new(),
            bootstrapped: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_search(mut self, search: PathSearch) -> Self {
        self.search = search;
        self
    }

    #[must_use]
    pub fn with_env_override(mut self, path: Option<PathBuf>) -> Self {
        self.env_override = path;
        self
    }

    #[must_use]
    pub const fn with_host(mut self, host: Host) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub fn with_ide_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.ide_roots = roots;
        self
    }

    pub const fn host(&self) -> Host {
        self.host
    }

    pub const fn search(&self) -> &PathSearch {
        &self.search
    }

    /// Resolve cmake, or `None` when every step fails.
    ///
    /// The first successful result is cached for the rest of the run.
    #[instrument(skip_all)]
    pub async fn resolve(&self, spec: &NativeBuildSpec) -> Option<ToolchainHandle> {
        self.resolved
            .get_or_try_init(|| async {
                if let Some(handle) = self.locate(spec) {
                    return Ok(handle);
                }
                self.bootstrap().await.ok_or(())
            })
            .await
            .ok()
            .cloned()
    }

    /// Steps 1–4: everything that does not install anything.
    fn locate(&self, spec: &NativeBuildSpec) -> Option<ToolchainHandle> {
        if let Some(path) = spec.tool_path.as_deref() {
            match self.usable(path) {
                Some(binary) => return Some(ToolchainHandle::found(binary, ToolSource::Override)),
                None => warn!(path = %path.display(), "Configured cmake path is not usable"),
            }
        }

        if let Some(path) = self.env_override.as_deref() {
            match self.usable(path) {
                Some(binary) => return Some(ToolchainHandle::found(binary, ToolSource::EnvVar)),
                None => warn!(path = %path.display(), var = TOOL_ENV_VAR, "cmake override is not usable"),
            }
        }

        if let Some(binary) = self.search.find("cmake") {
            debug!(path = %binary.display(), "Found cmake on PATH");
            return Some(ToolchainHandle::found(binary, ToolSource::Path));
        }

        if self.host.is_windows() {
            if let Some(binary) = self.ide_cmake() {
                debug!(path = %binary.display(), "Found Visual Studio bundled cmake");
                return Some(ToolchainHandle::found(binary, ToolSource::Ide));
            }
        }

        None
    }

    /// An explicit path that exists, or a bare name found on the search path.
    fn usable(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        if path.components().count() == 1 {
            return self.search.find(&path.to_string_lossy());
        }
        None
    }

    fn ide_cmake(&self) -> Option<PathBuf> {
        self.ide_roots
            .iter()
            .flat_map(|root| VS_EDITIONS.iter().map(move |edition| root.join(edition).join(VS_CMAKE)))
            .find(|candidate| candidate.is_file())
    }

    /// Step 5, run at most once per resolver.
    async fn bootstrap(&self) -> Option<ToolchainHandle> {
        self.bootstrapped
            .get_or_init(|| async {
                match self.install_portable_tools().await {
                    Ok(handle) => {
                        info!(path = %handle.binary.display(), ninja = handle.generator_available, "Bootstrapped portable CMake & Ninja");
                        Some(handle)
                    }
                    Err(e) => {
                        error!(error = %e, "CMake bootstrap failed");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn install_portable_tools(&self) -> Result<ToolchainHandle, CheckError> {
        let venv = self.root.join(TOOL_VENV_DIR);
        let bin_dir = self.host.venv_bin_dir(&venv);
        let binary = self.host.venv_tool(&venv, "cmake");
        let ninja = self.host.venv_tool(&venv, "ninja");

        if !venv_complete(self.host, &venv) {
            self.create_tool_venv(&venv).await?;
        }

        if binary.is_file() {
            debug!(path = %binary.display(), "Tool environment already provisioned");
        } else {
            let cmd = CommandSpec::new(self.host.venv_installer(&venv))
                .args(["install", "-q"])
                .args(BOOTSTRAP_PACKAGES)
                .timeout(DEFAULT_TIMEOUT);
            let output = self
                .executor
                .run(&cmd)
                .await
                .map_err(|e| CheckError::EnvironmentBootstrapFailure(e.to_string()))?;
            if !output.success() {
                return Err(CheckError::EnvironmentBootstrapFailure(format!(
                    "failed to install tools: {}",
                    tail(output.stderr.trim(), OUTPUT_TAIL_CHARS)
                )));
            }
            if !binary.is_file() {
                return Err(CheckError::EnvironmentBootstrapFailure(format!(
                    "cmake not found at {} after install",
                    binary.display()
                )));
            }
        }

        Ok(ToolchainHandle {
            binary,
            overlay: path_overlay(&bin_dir),
            generator_available: ninja.is_file(),
            source: ToolSource::Bootstrap,
        })
    }

    async fn create_tool_venv(&self, venv: &Path) -> Result<(), CheckError> {
        let python = DEFAULT_INTERPRETERS
            .iter()
            .find_map(|name| self.search.find(name))
            .ok_or_else(|| {
                CheckError::EnvironmentBootstrapFailure(
                    "no Python interpreter available to host the tool environment".into(),
                )
            })?;

        if let Some(parent) = venv.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CheckError::io(format!("create {}", parent.display()), e))?;
        }

        let output = self
            .executor
            .run(&venv_command(&python, venv))
            .await
            .map_err(|e| CheckError::EnvironmentBootstrapFailure(e.to_string()))?;
        if venv_complete(self.host, venv) {
            return Ok(());
        }
        if output.success() {
            return Err(CheckError::EnvironmentBootstrapFailure(format!(
                "tool venv at {} has no installer",
                venv.display()
            )));
        }
        Err(CheckError::EnvironmentBootstrapFailure(format!(
            "failed to create tool venv: {}",
            tail(output.stderr.trim(), OUTPUT_TAIL_CHARS)
        )))
    }
}

/// `PATH` with `dir` prepended to the inherited value.
fn path_overlay(dir: &Path) -> BTreeMap<String, String> {
    let inherited = std::env::var_os("PATH").unwrap_or_default();
    let paths = std::iter::once(dir.to_path_buf()).chain(std::env::split_paths(&inherited));
    let joined = std::env::join_paths(paths).map_or_else(
        |_| dir.to_string_lossy().into_owned(),
        |p| p.to_string_lossy().into_owned(),
    );
    BTreeMap::from([("PATH".to_string(), joined)])
}
