//! CMake configure, build, and run pipeline.
//!
//! The stages run strictly in order and stop at the first failure:
//! resolve tool, locate source, prepare env, configure, build, locate
//! artifact, execute, evaluate. Only a missing tool or a missing
//! `CMakeLists.txt` may end in SKIP, and only when the build spec allows it.
//! Nothing raised by a stage escapes [`NativeBuildOrchestrator::run`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::NativeBuildSpec;
use crate::devshell::DevShellCapture;
use crate::error::CheckError;
use crate::exec::{CommandSpec, Executor, ProcessOutput};
use crate::host::{cpu_count, Host};
use crate::result::ExecutionResult;
use crate::toolchain::{ToolchainHandle, ToolchainResolver};

/// File that marks a CMake source tree.
pub const BUILD_DESCRIPTOR: &str = "CMakeLists.txt";

/// Token the built artifact must print to pass.
pub const SUCCESS_TOKEN: &str = "working";

const NINJA_GENERATOR: &str = "Ninja";
const VS_GENERATOR: &str = "Visual Studio 17 2022";

/// Concrete C++ compiler binary for a logical compiler name.
pub fn compiler_binary(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "gcc" => Some("g++"),
        "clang" => Some("clang++"),
        "msvc" => Some("cl.exe"),
        _ => None,
    }
}

/// Layer `overlays` over `base`, later layers winning.
///
/// Windows variable names are case-insensitive, so there an overlay key
/// replaces any base key that differs only in case.
pub fn merge_env(
    host: Host,
    base: &BTreeMap<String, String>,
    overlays: &[&BTreeMap<String, String>],
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    for overlay in overlays {
        for (key, value) in *overlay {
            if host.is_windows() {
                merged.retain(|existing, _| !existing.eq_ignore_ascii_case(key));
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// A stage failure plus the output of the command that failed, if any.
struct StageFailure {
    error: CheckError,
    output: Option<ProcessOutput>,
}

impl From<CheckError> for StageFailure {
    fn from(error: CheckError) -> Self {
        Self { error, output: None }
    }
}

/// Runs the native build pipeline once per invocation of [`run`](Self::run).
pub struct NativeBuildOrchestrator {
    root: PathBuf,
    resolver: ToolchainResolver,
    capture: DevShellCapture,
    executor: Arc<dyn Executor>,
    base_env: BTreeMap<String, String>,
}

impl NativeBuildOrchestrator {
    pub fn new(
        root: impl Into<PathBuf>,
        resolver: ToolchainResolver,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let root = root.into();
        let capture = DevShellCapture::new(root.join(".devcheck"), executor.clone());
        Self {
            root,
            resolver,
            capture,
            executor,
            base_env: inherited_env(),
        }
    }

    #[must_use]
    pub fn with_capture(mut self, capture: DevShellCapture) -> Self {
        self.capture = capture;
        self
    }

    /// Replace the inherited process environment used as the merge base.
    #[must_use]
    pub fn with_base_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    const fn host(&self) -> Host {
        self.resolver.host()
    }

    /// Result name for a native build of `spec`.
    pub fn check_name(spec: &NativeBuildSpec) -> String {
        format!("native:{}", spec.target)
    }

    /// Run every stage and turn the outcome into a verdict.
    #[instrument(skip_all, fields(target = %spec.target))]
    pub async fn run(&self, spec: &NativeBuildSpec) -> ExecutionResult {
        let started = Instant::now();
        let name = Self::check_name(spec);

        match self.stages(spec).await {
            Ok((artifact, output)) => {
                let result = ExecutionResult::from_run(&name, started.elapsed(), &output, SUCCESS_TOKEN)
                    .with_entry(artifact.display().to_string());
                info!(status = %result.status(), exit_code = output.exit_code, "Native build finished");
                result
            }
            Err(StageFailure { error, .. }) if error.is_missing_prerequisite() && spec.allow_skip => {
                warn!(reason = %error, "Skipping native build");
                ExecutionResult::skipped(name, started.elapsed(), error.to_string())
            }
            Err(StageFailure { error, output }) => {
                let message = if matches!(error, CheckError::ToolUnavailable) {
                    format!("{error} and skip not allowed")
                } else {
                    error.to_string()
                };
                error!(reason = %message, "Native build failed");
                match output {
                    Some(output) => ExecutionResult::failed_with_output(name, started.elapsed(), message, &output),
                    None => ExecutionResult::failed(name, started.elapsed(), message),
                }
            }
        }
    }

    async fn stages(&self, spec: &NativeBuildSpec) -> Result<(PathBuf, ProcessOutput), StageFailure> {
        let tool = self
            .resolver
            .resolve(spec)
            .await
            .ok_or(CheckError::ToolUnavailable)?;
        let source = self.locate_source(spec)?;
        debug!(cmake = %tool.binary.display(), source = %source.display(), "Resolved toolchain and sources");

        let build_dir = self.root.join(&spec.build_dir);
        tokio::fs::create_dir_all(&build_dir)
            .await
            .map_err(|e| CheckError::io(format!("create {}", build_dir.display()), e))?;

        let env = self.prepare_env(spec, &tool).await;

        info!("Configuring CMake project");
        let configure = self.configure_command(&tool, &source, &build_dir, spec).env(env.clone());
        self.checked(&configure, |code| CheckError::ConfigureFailure { code })
            .await?;

        info!("Building project");
        let build = self.build_command(&tool, &build_dir, spec).env(env.clone());
        self.checked(&build, |code| CheckError::BuildFailure { code }).await?;

        let artifact = self.locate_artifact(&build_dir, spec)?;
        info!(artifact = %artifact.display(), "Running artifact");
        let cwd = artifact.parent().unwrap_or(&build_dir);
        let run = CommandSpec::new(&artifact)
            .args(&spec.args)
            .cwd(cwd)
            .env(env)
            .timeout(spec.timeout());
        let output = self.executor.run(&run).await.map_err(CheckError::from)?;
        Ok((artifact, output))
    }

    /// Run `cmd`, mapping a non-zero exit through `on_exit`.
    async fn checked(
        &self,
        cmd: &CommandSpec,
        on_exit: impl FnOnce(i32) -> CheckError,
    ) -> Result<ProcessOutput, StageFailure> {
        let output = self.executor.run(cmd).await.map_err(CheckError::from)?;
        if output.success() {
            return Ok(output);
        }
        let error = on_exit(output.exit_code);
        debug!(stderr = %output.stderr, "{error}");
        Err(StageFailure {
            error,
            output: Some(output),
        })
    }

    fn locate_source(&self, spec: &NativeBuildSpec) -> Result<PathBuf, CheckError> {
        let candidates = [self.root.join(&spec.source_dir), self.root.clone()];
        candidates
            .iter()
            .find(|dir| dir.join(BUILD_DESCRIPTOR).is_file())
            .cloned()
            .ok_or_else(|| CheckError::BuildDescriptorMissing {
                searched: candidates.to_vec(),
            })
    }

    async fn prepare_env(
        &self,
        spec: &NativeBuildSpec,
        tool: &ToolchainHandle,
    ) -> BTreeMap<String, String> {
        let captured = if self.host().is_windows() && spec.force_compiler.is_none() {
            self.capture.capture().await
        } else {
            None
        };
        let mut layers = vec![&tool.overlay];
        if let Some(captured) = captured.as_ref() {
            layers.push(captured);
        }
        merge_env(self.host(), &self.base_env, &layers)
    }

    fn configure_command(
        &self,
        tool: &ToolchainHandle,
        source: &Path,
        build_dir: &Path,
        spec: &NativeBuildSpec,
    ) -> CommandSpec {
        let mut cmd = CommandSpec::new(&tool.binary)
            .arg("-S")
            .arg(source)
            .arg("-B")
            .arg(build_dir)
            .timeout(spec.timeout());

        if tool.generator_available || self.resolver.search().find("ninja").is_some() {
            cmd = cmd.args(["-G", NINJA_GENERATOR]);
        } else if self.host().is_windows() {
            cmd = cmd.args(["-G", VS_GENERATOR]);
        }
        cmd = cmd.arg(format!("-DCMAKE_BUILD_TYPE={}", spec.build_type));

        if let Some(forced) = spec.force_compiler.as_deref() {
            match compiler_binary(forced).and_then(|bin| self.resolver.search().find(bin)) {
                Some(compiler) => {
                    cmd = cmd.arg(format!("-DCMAKE_CXX_COMPILER={}", compiler.display()));
                }
                None => debug!(compiler = forced, "Forced compiler not available; using default"),
            }
        }
        cmd
    }

    fn build_command(
        &self,
        tool: &ToolchainHandle,
        build_dir: &Path,
        spec: &NativeBuildSpec,
    ) -> CommandSpec {
        let cmd = CommandSpec::new(&tool.binary)
            .arg("--build")
            .arg(build_dir)
            .args(["--config", spec.build_type.as_str()])
            .timeout(spec.timeout());
        if self.host().is_windows() {
            cmd
        } else {
            cmd.args(["--parallel".to_string(), cpu_count().to_string()])
        }
    }

    fn locate_artifact(&self, build_dir: &Path, spec: &NativeBuildSpec) -> Result<PathBuf, CheckError> {
        let name = self.host().executable_name(&spec.target);
        let fixed = [
            build_dir.join(&name),
            build_dir.join(&spec.build_type).join(&name),
            build_dir.join("Debug").join(&name),
            build_dir.join("Release").join(&name),
        ];
        if let Some(found) = fixed.into_iter().find(|p| p.is_file()) {
            return Ok(found);
        }

        WalkDir::new(build_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == name)
            .map(walkdir::DirEntry::into_path)
            .ok_or_else(|| CheckError::ArtifactNotFound {
                name: spec.target.clone(),
                build_dir: build_dir.to_path_buf(),
            })
    }
}

fn inherited_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::exec::mock::{self, MockExecutor};
    use crate::host::PathSearch;
    use crate::result::Status;

    struct Fixture {
        root: tempfile::TempDir,
        bin: tempfile::TempDir,
        executor: Arc<MockExecutor>,
    }

    impl Fixture {
        fn new(executor: MockExecutor) -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                bin: tempfile::tempdir().unwrap(),
                executor: Arc::new(executor),
            }
        }

        fn with_cmake(executor: MockExecutor) -> Self {
            let fx = Self::new(executor);
            mock::fake_tool(fx.bin.path(), "cmake");
            fx
        }

        fn descriptor(&self, rel: &str) {
            let dir = self.root.path().join(rel);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(BUILD_DESCRIPTOR), "project(app)\n").unwrap();
        }

        fn orchestrator(&self) -> NativeBuildOrchestrator {
            let resolver = ToolchainResolver::new(self.root.path(), self.executor.clone())
                .with_search(PathSearch::within(self.bin.path()))
                .with_env_override(None)
                .with_ide_roots(Vec::new());
            NativeBuildOrchestrator::new(self.root.path(), resolver, self.executor.clone())
                .with_base_env(BTreeMap::from([("HOME".to_string(), "/home/dev".to_string())]))
        }

        fn commands(&self, pattern: &str) -> Vec<CommandSpec> {
            self.executor
                .calls()
                .into_iter()
                .filter(|c| c.display_line().contains(pattern))
                .collect()
        }
    }

    /// cmake succeeds, `--build` lays down the artifact in `<build>/<subdir>`,
    /// and the artifact answers with `stdout`/`code`.
    fn building(subdir: &'static str, code: i32, stdout: &'static str) -> MockExecutor {
        MockExecutor::new(move |cmd| {
            let args: Vec<_> = cmd.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
            if args.first().map(String::as_str) == Some("--build") {
                let dir = PathBuf::from(&args[1]).join(subdir);
                std::fs::create_dir_all(&dir).unwrap();
                mock::fake_tool(&dir, "app");
            }
            if cmd.program.file_stem().is_some_and(|s| s == "app") {
                return Ok(ProcessOutput {
                    exit_code: code,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                });
            }
            Ok(mock::ok(""))
        })
    }

    #[tokio::test]
    async fn artifact_printing_working_passes() {
        let fx = Fixture::with_cmake(building("", 0, "System is Working\n"));
        fx.descriptor("scripts");
        let spec = NativeBuildSpec {
            args: vec!["--selftest".into()],
            ..NativeBuildSpec::default()
        };

        let result = fx.orchestrator().run(&spec).await;
        assert_eq!(result.status(), Status::Pass, "{result:?}");
        assert_eq!(result.name(), "native:app");

        let build_dir = fx.root.path().join(".devcheck/build");
        let configure = &fx.commands("-S")[0];
        let line = configure.display_line();
        assert!(line.contains(&format!("-S {}", fx.root.path().join("scripts").display())));
        assert!(line.contains(&format!("-B {}", build_dir.display())));
        assert!(line.contains("-DCMAKE_BUILD_TYPE=Debug"));
        assert!(!line.contains("-G"), "no generator available: {line}");
        assert_eq!(configure.env.as_ref().unwrap()["HOME"], "/home/dev");

        let build = fx.commands("--build")[0].display_line();
        assert!(build.contains("--config Debug"));
        assert!(build.contains(&format!("--parallel {}", cpu_count())));

        let run = &fx.commands("--selftest")[0];
        assert_eq!(run.cwd.as_deref(), Some(build_dir.as_path()));
        assert_eq!(run.timeout, spec.timeout());
    }

    #[tokio::test]
    async fn missing_tool_skips_or_fails_by_policy() {
        let fx = Fixture::new(MockExecutor::succeeding());
        fx.descriptor("scripts");

        let strict = NativeBuildSpec::default();
        let result = fx.orchestrator().run(&strict).await;
        assert_eq!(result.status(), Status::Fail);
        assert_eq!(result.error_message(), Some("CMake not found and skip not allowed"));

        let lenient = NativeBuildSpec {
            allow_skip: true,
            ..NativeBuildSpec::default()
        };
        let result = fx.orchestrator().run(&lenient).await;
        assert_eq!(result.status(), Status::Skip);
        assert_eq!(result.error_message(), Some("CMake not found"));
        assert!(fx.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_descriptor_never_passes() {
        let fx = Fixture::with_cmake(building("", 0, "working"));

        for (allow_skip, expected) in [(true, Status::Skip), (false, Status::Fail)] {
            let spec = NativeBuildSpec {
                allow_skip,
                ..NativeBuildSpec::default()
            };
            let result = fx.orchestrator().run(&spec).await;
            assert_eq!(result.status(), expected);
            assert!(result.error_message().unwrap().contains(BUILD_DESCRIPTOR));
        }
        assert!(fx.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn root_descriptor_is_the_fallback_source() {
        let fx = Fixture::with_cmake(building("Debug", 0, "working"));
        fx.descriptor("");

        let result = fx.orchestrator().run(&NativeBuildSpec::default()).await;
        assert_eq!(result.status(), Status::Pass);
        let line = fx.commands("-S")[0].display_line();
        assert!(line.contains(&format!("-S {} ", fx.root.path().display())));
    }

    #[tokio::test]
    async fn ninja_on_path_selects_ninja_generator() {
        let fx = Fixture::with_cmake(building("", 0, "working"));
        mock::fake_tool(fx.bin.path(), "ninja");
        fx.descriptor("scripts");

        fx.orchestrator().run(&NativeBuildSpec::default()).await;
        assert!(fx.commands("-S")[0].display_line().contains("-G Ninja"));
    }

    #[tokio::test]
    async fn unresolvable_forced_compiler_is_omitted() {
        let fx = Fixture::with_cmake(building("", 0, "working"));
        fx.descriptor("scripts");
        let spec = NativeBuildSpec {
            force_compiler: Some("clang".into()),
            ..NativeBuildSpec::default()
        };

        let result = fx.orchestrator().run(&spec).await;
        assert_eq!(result.status(), Status::Pass);
        assert!(!fx.commands("-S")[0].display_line().contains("CMAKE_CXX_COMPILER"));
    }

    #[tokio::test]
    async fn resolvable_forced_compiler_is_passed() {
        let fx = Fixture::with_cmake(building("", 0, "working"));
        let gxx = mock::fake_tool(fx.bin.path(), "g++");
        fx.descriptor("scripts");
        let spec = NativeBuildSpec {
            force_compiler: Some("GCC".into()),
            ..NativeBuildSpec::default()
        };

        fx.orchestrator().run(&spec).await;
        let line = fx.commands("-S")[0].display_line();
        assert!(line.contains(&format!("-DCMAKE_CXX_COMPILER={}", gxx.display())));
    }

    #[tokio::test]
    async fn configure_failure_stops_the_pipeline() {
        let fx = Fixture::with_cmake(MockExecutor::new(|cmd| {
            if cmd.display_line().contains("-S") {
                Ok(mock::exit(1, "CMake Error: bad project"))
            } else {
                Ok(mock::ok(""))
            }
        }));
        fx.descriptor("scripts");

        let result = fx.orchestrator().run(&NativeBuildSpec::default()).await;
        assert_eq!(result.status(), Status::Fail);
        assert_eq!(result.error_message(), Some("CMake configure failed (exit code 1)"));
        assert!(result.stderr().contains("bad project"));
        assert!(fx.commands("--build").is_empty());
    }

    #[tokio::test]
    async fn build_failure_is_not_skipped_even_when_allowed() {
        let fx = Fixture::with_cmake(MockExecutor::new(|cmd| {
            if cmd.display_line().contains("--build") {
                Ok(mock::exit(2, "undefined reference"))
            } else {
                Ok(mock::ok(""))
            }
        }));
        fx.descriptor("scripts");
        let spec = NativeBuildSpec {
            allow_skip: true,
            ..NativeBuildSpec::default()
        };

        let result = fx.orchestrator().run(&spec).await;
        assert_eq!(result.status(), Status::Fail);
        assert_eq!(result.return_code(), 2);
    }

    #[tokio::test]
    async fn missing_artifact_fails() {
        let fx = Fixture::with_cmake(MockExecutor::succeeding());
        fx.descriptor("scripts");

        let result = fx.orchestrator().run(&NativeBuildSpec::default()).await;
        assert_eq!(result.status(), Status::Fail);
        assert!(result.error_message().unwrap().contains("executable 'app' not found"));
    }

    #[tokio::test]
    async fn artifact_found_by_recursive_scan() {
        let fx = Fixture::with_cmake(building("nested/bin", 0, "working"));
        fx.descriptor("scripts");

        let result = fx.orchestrator().run(&NativeBuildSpec::default()).await;
        assert_eq!(result.status(), Status::Pass);
        assert!(result.entry().unwrap().contains("nested"));
    }

    #[tokio::test]
    async fn evaluation_needs_both_exit_code_and_token() {
        for (code, stdout) in [(0, "all good"), (3, "working")] {
            let fx = Fixture::with_cmake(building("", code, stdout));
            fx.descriptor("scripts");
            let result = fx.orchestrator().run(&NativeBuildSpec::default()).await;
            assert_eq!(result.status(), Status::Fail, "rc={code} stdout={stdout}");
            assert_eq!(result.return_code(), code);
        }
    }

    #[tokio::test]
    async fn hung_artifact_times_out() {
        let fx = Fixture::with_cmake(
            building("", 0, "working").with_delay("--hang", Duration::from_secs(30)),
        );
        fx.descriptor("scripts");
        let spec = NativeBuildSpec {
            args: vec!["--hang".into()],
            timeout_seconds: 1,
            ..NativeBuildSpec::default()
        };

        let started = Instant::now();
        let result = fx.orchestrator().run(&spec).await;
        assert_eq!(result.status(), Status::Fail);
        assert_eq!(result.error_message(), Some("timed out after 1s"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn developer_shell_overlay_wins_on_windows_without_forced_compiler() {
        let fx = Fixture::new(MockExecutor::new(|cmd| {
            if cmd.display_line().contains("-latest") {
                let install = cmd.program.parent().unwrap().join("VS");
                Ok(mock::ok(&install.to_string_lossy()))
            } else {
                Ok(mock::ok("PATH=C:\\msvc\r\nINCLUDE=C:\\inc\r\n"))
            }
        }));
        let tools = fx.root.path().join("tools");
        let script = tools.join("VS/VC/Auxiliary/Build/vcvars64.bat");
        std::fs::create_dir_all(script.parent().unwrap()).unwrap();
        std::fs::write(&script, "").unwrap();
        std::fs::write(tools.join("vswhere.exe"), "").unwrap();

        let resolver = ToolchainResolver::new(fx.root.path(), fx.executor.clone())
            .with_host(Host::Windows)
            .with_search(PathSearch::within(fx.bin.path()));
        let orchestrator = NativeBuildOrchestrator::new(fx.root.path(), resolver, fx.executor.clone())
            .with_base_env(BTreeMap::from([("Path".to_string(), "C:\\Windows".to_string())]))
            .with_capture(
                DevShellCapture::new(fx.root.path().join("work"), fx.executor.clone())
                    .with_vswhere(tools.join("vswhere.exe")),
            );
        let tool = ToolchainHandle {
            binary: PathBuf::from("cmake.exe"),
            overlay: BTreeMap::from([("PATH".to_string(), "C:\\toolvenv".to_string())]),
            generator_available: true,
            source: crate::toolchain::ToolSource::Bootstrap,
        };

        let env = orchestrator.prepare_env(&NativeBuildSpec::default(), &tool).await;
        assert_eq!(env["PATH"], "C:\\msvc");
        assert_eq!(env["INCLUDE"], "C:\\inc");
        assert!(!env.contains_key("Path"));

        let forced = NativeBuildSpec {
            force_compiler: Some("gcc".into()),
            ..NativeBuildSpec::default()
        };
        let calls_before = fx.executor.calls().len();
        let env = orchestrator.prepare_env(&forced, &tool).await;
        assert_eq!(env["PATH"], "C:\\toolvenv");
        assert_eq!(fx.executor.calls().len(), calls_before);
    }

    #[test]
    fn merge_env_precedence() {
        let base = BTreeMap::from([("A".to_string(), "base".to_string()), ("path".to_string(), "/usr/bin".to_string())]);
        let tool = BTreeMap::from([("A".to_string(), "tool".to_string()), ("PATH".to_string(), "/tool".to_string())]);
        let shell = BTreeMap::from([("A".to_string(), "shell".to_string())]);

        let unix = merge_env(Host::Unix, &base, &[&tool, &shell]);
        assert_eq!(unix["A"], "shell");
        assert_eq!(unix["PATH"], "/tool");
        assert_eq!(unix["path"], "/usr/bin");

        let windows = merge_env(Host::Windows, &base, &[&tool]);
        assert_eq!(windows["PATH"], "/tool");
        assert!(!windows.contains_key("path"));
    }

    #[test]
    fn compiler_names_map_to_binaries() {
        assert_eq!(compiler_binary("gcc"), Some("g++"));
        assert_eq!(compiler_binary("Clang"), Some("clang++"));
        assert_eq!(compiler_binary("msvc"), Some("cl.exe"));
        assert_eq!(compiler_binary("icc"), None);
    }
}
