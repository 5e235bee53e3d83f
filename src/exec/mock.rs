//! Scripted executor for tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandSpec, Executor, ProcessOutput};
use crate::error::ProcessError;
use crate::host::Host;

type Handler = Box<dyn Fn(&CommandSpec) -> Result<ProcessOutput, ProcessError> + Send + Sync>;

/// Records every invocation and answers through a handler closure.
///
/// Commands whose line contains a registered pattern sleep first; when the
/// sleep exceeds the command's own deadline the mock behaves like the
/// watchdog and returns `ProcessError::Timeout`.
pub struct MockExecutor {
    calls: Mutex<Vec<CommandSpec>>,
    handler: Handler,
    delays: Vec<(String, Duration)>,
}

impl MockExecutor {
    pub fn new(
        handler: impl Fn(&CommandSpec) -> Result<ProcessOutput, ProcessError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
            delays: Vec::new(),
        }
    }

    /// Every command exits 0 with empty output.
    pub fn succeeding() -> Self {
        Self::new(|_| Ok(ok("")))
    }

    pub fn with_delay(mut self, pattern: &str, delay: Duration) -> Self {
        self.delays.push((pattern.to_string(), delay));
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.display_line().contains(pattern))
            .count()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn run(&self, cmd: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        self.calls.lock().unwrap().push(cmd.clone());
        let line = cmd.display_line();
        if let Some((_, delay)) = self.delays.iter().find(|(p, _)| line.contains(p.as_str())) {
            if *delay > cmd.timeout {
                tokio::time::sleep(cmd.timeout).await;
                return Err(ProcessError::Timeout(cmd.timeout));
            }
            tokio::time::sleep(*delay).await;
        }
        (self.handler)(cmd)
    }
}

pub fn ok(stdout: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn exit(code: i32, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Lay out a fake virtual environment when `cmd` is a
/// `-m venv [--clear] <dir>` call.
pub fn materialize_venv(cmd: &CommandSpec) {
    let args: Vec<_> = cmd.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
    let dir = match args.as_slice() {
        [m, venv, dir] | [m, venv, _, dir] if m == "-m" && venv == "venv" => dir,
        _ => return,
    };
    let dir = std::path::PathBuf::from(dir);
    let host = Host::current();
    std::fs::create_dir_all(host.venv_bin_dir(&dir)).unwrap();
    std::fs::write(host.venv_interpreter(&dir), "").unwrap();
    std::fs::write(host.venv_installer(&dir), "").unwrap();
}

/// Create an executable stub named `name` in `dir` for PATH searches.
pub fn fake_tool(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(Host::current().executable_name(name));
    std::fs::write(&path, "#!/bin/sh\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}
