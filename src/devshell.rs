//! Visual Studio developer-shell environment capture.
//!
//! On Windows the MSVC compiler only works inside the environment that
//! `vcvars64.bat` sets up. We ask `vswhere` for the newest install with the
//! x64 VC tools, run its setup script followed by `set`, and parse the dump.
//! Every failure here is advisory; callers get `None` and carry on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::CheckError;
use crate::exec::{CommandSpec, Executor, DEFAULT_TIMEOUT};

pub const VSWHERE: &str = r"C:\Program Files (x86)\Microsoft Visual Studio\Installer\vswhere.exe";

const VSWHERE_ARGS: &[&str] = &[
    "-latest",
    "-products",
    "*",
    "-requires",
    "Microsoft.VisualStudio.Component.VC.Tools.x86.x64",
    "-property",
    "installationPath",
];

const SETUP_SCRIPTS: &[&str] = &["VC/Auxiliary/Build/vcvars64.bat", "Common7/Tools/VsDevCmd.bat"];

/// Name of the wrapper script written into the work directory.
const WRAPPER: &str = "devshell_env.cmd";

/// Parse `KEY=VALUE` lines from a `set` dump.
///
/// Lines without `=` and lines starting with `=` (the per-drive cwd entries
/// `cmd.exe` prints) are ignored. Values keep any further `=` characters.
pub fn parse_env_dump(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.starts_with('='))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .collect()
}

/// Captures the developer-shell environment of the latest VS install.
pub struct DevShellCapture {
    vswhere: PathBuf,
    work_dir: PathBuf,
    executor: Arc<dyn Executor>,
}

impl DevShellCapture {
    /// `work_dir` receives the small wrapper script that runs the capture.
    pub fn new(work_dir: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        Self {
            vswhere: PathBuf::from(VSWHERE),
            work_dir: work_dir.into(),
            executor,
        }
    }

    #[must_use]
    pub fn with_vswhere(mut self, path: impl Into<PathBuf>) -> Self {
        self.vswhere = path.into();
        self
    }

    /// Overlay of the developer shell, or `None` on any failure.
    pub async fn capture(&self) -> Option<BTreeMap<String, String>> {
        match self.try_capture().await {
            Ok(env) => {
                info!(vars = env.len(), "Captured MSVC developer environment");
                Some(env)
            }
            Err(e) => {
                warn!(error = %e, "Continuing without MSVC developer environment");
                None
            }
        }
    }

    async fn try_capture(&self) -> Result<BTreeMap<String, String>, CheckError> {
        if !self.vswhere.is_file() {
            return Err(CheckError::EnvironmentCaptureFailure(format!(
                "vswhere not found at {}",
                self.vswhere.display()
            )));
        }

        let install = self.installation_path().await?;
        let script = SETUP_SCRIPTS
            .iter()
            .map(|rel| install.join(rel))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                CheckError::EnvironmentCaptureFailure(format!(
                    "no developer shell script under {}",
                    install.display()
                ))
            })?;
        debug!(script = %script.display(), "Running developer shell script");

        let wrapper = self.write_wrapper(&script).await?;
        let output = self
            .executor
            .run(&CommandSpec::new(&wrapper).timeout(DEFAULT_TIMEOUT))
            .await
            .map_err(|e| CheckError::EnvironmentCaptureFailure(e.to_string()))?;
        if !output.success() {
            return Err(CheckError::EnvironmentCaptureFailure(format!(
                "{} exited with code {}",
                script.display(),
                output.exit_code
            )));
        }

        let env = parse_env_dump(&output.stdout);
        if env.is_empty() {
            return Err(CheckError::EnvironmentCaptureFailure(
                "environment dump was empty".into(),
            ));
        }
        Ok(env)
    }

    async fn installation_path(&self) -> Result<PathBuf, CheckError> {
        let cmd = CommandSpec::new(&self.vswhere)
            .args(VSWHERE_ARGS)
            .timeout(DEFAULT_TIMEOUT);
        let output = self
            .executor
            .run(&cmd)
            .await
            .map_err(|e| CheckError::EnvironmentCaptureFailure(e.to_string()))?;

        let path = output.stdout.lines().map(str::trim).find(|l| !l.is_empty());
        match path {
            Some(path) if output.success() => Ok(PathBuf::from(path)),
            _ => Err(CheckError::EnvironmentCaptureFailure(
                "vswhere reported no install with the VC x64 tools".into(),
            )),
        }
    }

    /// Batch file that runs `script` quietly and then dumps the environment.
    async fn write_wrapper(&self, script: &Path) -> Result<PathBuf, CheckError> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| CheckError::io(format!("create {}", self.work_dir.display()), e))?;
        let wrapper = self.work_dir.join(WRAPPER);
        let body = format!(
            "@echo off\r\ncall \"{}\" -no_logo >nul\r\nif errorlevel 1 exit /b %errorlevel%\r\nset\r\n",
            script.display()
        );
        tokio::fs::write(&wrapper, body)
            .await
            .map_err(|e| CheckError::io(format!("write {}", wrapper.display()), e))?;
        Ok(wrapper)
    }
}
