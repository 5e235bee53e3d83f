//! Watchdog-backed process executor.
//!
//! Spawns the child in its own process group, drains stdout and stderr
//! concurrently with the wait, and enforces the deadline with
//! `tokio::time::timeout`. On expiry the whole group is killed so that
//! grandchildren holding the pipes open cannot keep the caller blocked.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

use super::{CommandSpec, Executor, ProcessOutput};
use crate::error::ProcessError;

/// Executor that runs real processes on the host.
#[derive(Debug, Default, Clone)]
pub struct ProcessExecutor {}

impl ProcessExecutor {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    #[instrument(skip(self, cmd), fields(program = %cmd.program.display(), timeout = cmd.timeout.as_secs()))]
    async fn run(&self, cmd: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        let program = cmd.program.display().to_string();
        debug!(command = %cmd.display_line(), cwd = ?cmd.cwd, "Running command");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        if let Some(env) = &cmd.env {
            command.env_clear().envs(env);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // `child` is only borrowed by this future, so it can be killed after
        // the timeout drops it.
        let collect = async {
            let (out, err, status) = tokio::join!(drain(stdout), drain(stderr), child.wait());
            Ok::<_, std::io::Error>((out?, err?, status?))
        };
        let outcome = tokio::time::timeout(cmd.timeout, collect).await;

        match outcome {
            Ok(Ok((stdout, stderr, status))) => {
                let output = ProcessOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                };
                debug!(exit_code = output.exit_code, "Command completed");
                Ok(output)
            }
            Ok(Err(source)) => Err(ProcessError::Io { program, source }),
            Err(_) => {
                warn!(command = %cmd.display_line(), "Command exceeded its deadline, terminating");
                terminate(&mut child, pid).await;
                Err(ProcessError::Timeout(cmd.timeout))
            }
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        kill_group(pid).await;
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Child already gone");
    }
}

#[cfg(unix)]
#[allow(clippy::unused_async)]
async fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed");
    }
}

#[cfg(windows)]
async fn kill_group(pid: u32) {
    let result = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!(pid, error = %e, "taskkill failed");
    }
}

#[cfg(not(any(unix, windows)))]
#[allow(clippy::unused_async)]
async fn kill_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let output = assert_ok!(ProcessExecutor::new().run(&sh("echo out; echo err >&2; exit 3")).await);
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn honours_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::from([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("DEVCHECK_PROBE".to_string(), "probe-value".to_string()),
        ]);
        let output = assert_ok!(
            ProcessExecutor::new()
                .run(&sh("pwd; echo $DEVCHECK_PROBE").cwd(dir.path()).env(env))
                .await
        );
        let canonical = dir.path().canonicalize().unwrap();
        assert!(output.stdout.contains(&*canonical.to_string_lossy()));
        assert!(output.stdout.contains("probe-value"));
    }

    #[tokio::test]
    async fn timeout_kills_process_and_reports() {
        let started = Instant::now();
        let result = ProcessExecutor::new()
            .run(&sh("sleep 30").timeout(Duration::from_millis(300)))
            .await;
        assert!(matches!(result, Err(ProcessError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_kills_grandchildren_holding_pipes() {
        let started = Instant::now();
        let result = ProcessExecutor::new()
            .run(&sh("sleep 30 & sleep 30; wait").timeout(Duration::from_millis(300)))
            .await;
        assert!(matches!(result, Err(ProcessError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let result = ProcessExecutor::new()
            .run(&CommandSpec::new("/nonexistent/devcheck-binary"))
            .await;
        let err = assert_err!(result);
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/devcheck-binary"));
    }
}
