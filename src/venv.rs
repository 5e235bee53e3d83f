//! Per-project Python virtual environments.
//!
//! Each project gets an environment under `<root>/.devcheck/venvs`, named
//! after a stable hash of the project directory so later runs find and reuse
//! it. Dependency installation is skipped while the manifest content hash
//! matches the sentinel left by the last successful install.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::ProjectSpec;
use crate::error::CheckError;
use crate::exec::{CommandSpec, Executor, DEFAULT_TIMEOUT};
use crate::host::{Host, PathSearch};
use crate::result::{tail, OUTPUT_TAIL_CHARS};

/// Directory holding all project environments, relative to the run root.
pub const VENV_BUCKET: &str = ".devcheck/venvs";

/// Prefix of every environment directory name.
pub const VENV_PREFIX: &str = ".venv_devcheck_";

/// Per-project file recording the hash of the last installed manifest.
pub const SENTINEL_FILE: &str = ".devcheck_req_hash";

pub(crate) const DEFAULT_INTERPRETERS: &[&str] = &["python3", "python"];

/// A virtual environment and the binaries inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedEnvironment {
    pub dir: PathBuf,
    pub interpreter: PathBuf,
    pub installer: PathBuf,
}

impl IsolatedEnvironment {
    /// Both binaries are present. An interrupted `-m venv` can leave the
    /// interpreter without the installer.
    pub fn is_complete(&self) -> bool {
        self.interpreter.exists() && self.installer.exists()
    }
}

/// What `install_dependencies` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The project declares no manifest (or it does not exist).
    NoManifest,
    /// Manifest unchanged since the last successful install.
    UpToDate,
    Installed,
}

/// Creates, caches and provisions project environments for one run.
///
/// The in-memory cache lives exactly as long as the manager, which is built
/// once per harness invocation.
pub struct EnvironmentManager {
    root: PathBuf,
    host: Host,
    search: PathSearch,
    executor: Arc<dyn Executor>,
    cache: RwLock<HashMap<PathBuf, IsolatedEnvironment>>,
}

impl EnvironmentManager {
    pub fn new(root: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        Self {
            root: root.into(),
            host: Host::current(),
            search: PathSearch::system(),
            executor,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Use `search` to locate base interpreters instead of the process `PATH`.
    #[must_use]
    pub fn with_search(mut self, search: PathSearch) -> Self {
        self.search = search;
        self
    }

    pub fn project_dir(&self, project: &ProjectSpec) -> PathBuf {
        self.root.join(&project.path)
    }

    /// Deterministic environment location for a project directory.
    pub fn environment_dir(&self, project_dir: &Path) -> PathBuf {
        self.root
            .join(VENV_BUCKET)
            .join(format!("{VENV_PREFIX}{}", stable_hash(project_dir)))
    }

    /// Return the project's environment, creating it on first use.
    ///
    /// Checks the in-memory cache, then the disk, and only then runs
    /// `python -m venv`. Failures affect this project only.
    #[instrument(skip_all, fields(project = %project.path))]
    pub async fn ensure_environment(
        &self,
        project: &ProjectSpec,
    ) -> Result<IsolatedEnvironment, CheckError> {
        let dir = self.environment_dir(&self.project_dir(project));

        // Fast path: read lock
        {
            let cache = self.cache.read().await;
            if let Some(env) = cache.get(&dir) {
                return Ok(env.clone());
            }
        }

        let env = IsolatedEnvironment {
            interpreter: self.host.venv_interpreter(&dir),
            installer: self.host.venv_installer(&dir),
            dir: dir.clone(),
        };

        if env.is_complete() {
            debug!(path = %dir.display(), "Reusing virtual environment");
        } else {
            self.create(&dir, project.python_version.as_deref()).await?;
            if !env.is_complete() {
                return Err(CheckError::EnvironmentCreation {
                    path: dir,
                    reason: format!(
                        "interpreter or installer missing under {}",
                        self.host.venv_bin_dir(&env.dir).display()
                    ),
                });
            }
        }

        let mut cache = self.cache.write().await;
        Ok(cache.entry(dir).or_insert(env).clone())
    }

    async fn create(&self, dir: &Path, version: Option<&str>) -> Result<(), CheckError> {
        let interpreter = self.select_interpreter(version)?;
        info!(
            path = %dir.display(),
            interpreter = %interpreter.display(),
            "Creating virtual environment"
        );

        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CheckError::io(format!("create {}", parent.display()), e))?;
        }

        let output = self.executor.run(&venv_command(&interpreter, dir)).await?;
        if output.success() {
            return Ok(());
        }

        // Another task may have won a creation race for the same directory.
        if venv_complete(self.host, dir) {
            debug!(path = %dir.display(), "Environment appeared concurrently, reusing it");
            return Ok(());
        }
        Err(CheckError::EnvironmentCreation {
            path: dir.to_path_buf(),
            reason: tail(output.stderr.trim(), OUTPUT_TAIL_CHARS),
        })
    }

    /// Pick a base interpreter honouring the optional version hint.
    ///
    /// Tries `python<hint>` and `python<major>`, then the default
    /// interpreter names with a warning.
    fn select_interpreter(&self, version: Option<&str>) -> Result<PathBuf, CheckError> {
        if let Some(version) = version {
            let major = version.split('.').next().unwrap_or(version);
            for candidate in [format!("python{version}"), format!("python{major}")] {
                if let Some(path) = self.search.find(&candidate) {
                    return Ok(path);
                }
            }
        }

        let fallback = DEFAULT_INTERPRETERS
            .iter()
            .find_map(|name| self.search.find(name));

        match fallback {
            Some(path) => {
                if let Some(version) = version {
                    warn!(
                        wanted = %version,
                        using = %path.display(),
                        "Requested Python version not found, using default interpreter"
                    );
                }
                Ok(path)
            }
            None => Err(CheckError::InterpreterNotFound {
                wanted: version.map_or_else(|| "python3".to_string(), |v| format!("python{v}")),
            }),
        }
    }

    /// Install the project's manifest into `env` unless already current.
    #[instrument(skip_all, fields(project = %project.path))]
    pub async fn install_dependencies(
        &self,
        env: &IsolatedEnvironment,
        project: &ProjectSpec,
    ) -> Result<InstallOutcome, CheckError> {
        let project_dir = self.project_dir(project);
        let manifest = project_dir.join(project.manifest_name());
        if !manifest.is_file() {
            return Ok(InstallOutcome::NoManifest);
        }

        let content = tokio::fs::read(&manifest)
            .await
            .map_err(|e| CheckError::io(format!("read {}", manifest.display()), e))?;
        let digest = content_hash(&content);
        let sentinel = project_dir.join(SENTINEL_FILE);

        if let Ok(previous) = tokio::fs::read_to_string(&sentinel).await {
            if previous.trim() == digest {
                debug!("Requirements already installed (hash match)");
                return Ok(InstallOutcome::UpToDate);
            }
        }

        info!(manifest = %project.manifest_name(), "Installing requirements");
        let cmd = CommandSpec::new(&env.installer)
            .args(["install", "-r"])
            .arg(&manifest)
            .args(["--quiet", "--disable-pip-version-check"])
            .cwd(&project_dir)
            .timeout(DEFAULT_TIMEOUT);
        let output = self
            .executor
            .run(&cmd)
            .await
            .map_err(|e| CheckError::DependencyInstallFailure(e.to_string()))?;
        if !output.success() {
            return Err(CheckError::DependencyInstallFailure(tail(
                output.stderr.trim(),
                OUTPUT_TAIL_CHARS,
            )));
        }

        tokio::fs::write(&sentinel, &digest)
            .await
            .map_err(|e| CheckError::io(format!("write {}", sentinel.display()), e))?;
        Ok(InstallOutcome::Installed)
    }
}

pub(crate) fn venv_complete(host: Host, dir: &Path) -> bool {
    host.venv_interpreter(dir).exists() && host.venv_installer(dir).exists()
}

/// `python -m venv <dir>`, clearing whatever a previous attempt left behind.
pub(crate) fn venv_command(python: &Path, dir: &Path) -> CommandSpec {
    let mut cmd = CommandSpec::new(python).args(["-m", "venv"]);
    if dir.exists() {
        cmd = cmd.arg("--clear");
    }
    cmd.arg(dir).timeout(DEFAULT_TIMEOUT)
}

/// Short stable identifier for a path.
pub fn stable_hash(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    hex::encode(&digest[..6])
}

/// Hex SHA-256 of file content.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
