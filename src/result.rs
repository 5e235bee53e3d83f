//! Verdict records and their aggregation into a run session.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::exec::ProcessOutput;
use crate::host::HostInfo;

/// Captured output is truncated to its last this-many characters.
pub const OUTPUT_TAIL_CHARS: usize = 4000;

/// Terminal status of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
    Skip,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skip => "SKIP",
        })
    }
}

/// Success heuristic shared by the native and interpreted paths: exit code
/// zero and `token` somewhere in stdout+stderr, ignoring case.
pub fn output_passes(exit_code: i32, stdout: &str, stderr: &str, token: &str) -> bool {
    if exit_code != 0 {
        return false;
    }
    let combined = format!("{stdout}{stderr}").to_lowercase();
    combined.contains(&token.to_lowercase())
}

/// Last `max_chars` characters of `text`.
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Outcome of one check. Built once, then only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<String>,
    status: Status,
    #[serde(serialize_with = "serialize_secs")]
    duration: Duration,
    return_code: i32,
    stdout: String,
    stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl ExecutionResult {
    /// Evaluate a finished run against the expected token.
    pub fn from_run(
        name: impl Into<String>,
        duration: Duration,
        output: &ProcessOutput,
        token: &str,
    ) -> Self {
        let passed = output_passes(output.exit_code, &output.stdout, &output.stderr, token);
        let error_message = if passed {
            None
        } else if output.exit_code == 0 {
            Some(format!("expected output '{token}' not found"))
        } else {
            Some(format!("exited with code {}", output.exit_code))
        };
        Self {
            name: name.into(),
            entry: None,
            status: if passed { Status::Pass } else { Status::Fail },
            duration,
            return_code: output.exit_code,
            stdout: tail(&output.stdout, OUTPUT_TAIL_CHARS),
            stderr: tail(&output.stderr, OUTPUT_TAIL_CHARS),
            error_message,
        }
    }

    pub fn failed(name: impl Into<String>, duration: Duration, message: impl Into<String>) -> Self {
        Self::terminal(name, Status::Fail, -1, duration, message)
    }

    /// A failure that still carries the output of the stage that failed.
    pub fn failed_with_output(
        name: impl Into<String>,
        duration: Duration,
        message: impl Into<String>,
        output: &ProcessOutput,
    ) -> Self {
        Self {
            return_code: output.exit_code,
            stdout: tail(&output.stdout, OUTPUT_TAIL_CHARS),
            stderr: tail(&output.stderr, OUTPUT_TAIL_CHARS),
            ..Self::failed(name, duration, message)
        }
    }

    pub fn skipped(name: impl Into<String>, duration: Duration, message: impl Into<String>) -> Self {
        Self::terminal(name, Status::Skip, 0, duration, message)
    }

    fn terminal(
        name: impl Into<String>,
        status: Status,
        return_code: i32,
        duration: Duration,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entry: None,
            status,
            duration,
            return_code,
            stdout: String::new(),
            stderr: String::new(),
            error_message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    pub const fn status(&self) -> Status {
        self.status
    }

    pub const fn duration(&self) -> Duration {
        self.duration
    }

    pub const fn return_code(&self) -> i32 {
        self.return_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

/// All verdicts of one harness invocation plus session metadata.
#[derive(Debug, Clone, Serialize)]
pub struct RunSession {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub host: HostInfo,
    /// Interpreted-project results, sorted by project path.
    pub interpreted: Vec<ExecutionResult>,
    pub native: Option<ExecutionResult>,
}

impl RunSession {
    pub fn results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.interpreted.iter().chain(self.native.iter())
    }

    pub fn count(&self, status: Status) -> usize {
        self.results().filter(|r| r.status() == status).count()
    }

    pub fn has_failures(&self) -> bool {
        self.count(Status::Fail) > 0
    }

    /// Sum of individual check durations.
    pub fn total_duration(&self) -> Duration {
        self.results().map(ExecutionResult::duration).sum()
    }
}

/// Collects results as they arrive and produces the final, sorted session.
#[derive(Debug)]
pub struct ResultAggregator {
    started_at: DateTime<Utc>,
    host: HostInfo,
    interpreted: Vec<ExecutionResult>,
    native: Option<ExecutionResult>,
}

impl ResultAggregator {
    pub fn new(host: HostInfo) -> Self {
        Self {
            started_at: Utc::now(),
            host,
            interpreted: Vec::new(),
            native: None,
        }
    }

    pub fn record(&mut self, result: ExecutionResult) {
        self.interpreted.push(result);
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = ExecutionResult>) {
        self.interpreted.extend(results);
    }

    pub fn record_native(&mut self, result: ExecutionResult) {
        self.native = Some(result);
    }

    /// Sort by project path, independent of completion order, and stamp the
    /// finish time.
    pub fn finalize(mut self) -> RunSession {
        self.interpreted.sort_by(|a, b| a.name.cmp(&b.name));
        RunSession {
            started_at: self.started_at,
            finished_at: Utc::now(),
            host: self.host,
            interpreted: self.interpreted,
            native: self.native,
        }
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
