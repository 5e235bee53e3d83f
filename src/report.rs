//! Run report: JSON file under `.devcheck/` plus a console summary.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::result::{ExecutionResult, RunSession, Status};

/// Report location, relative to the run root.
pub const REPORT_FILE: &str = ".devcheck/test_report.json";

const RULE_WIDTH: usize = 80;

/// Invocation settings recorded alongside the results.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub root: PathBuf,
    pub parallel: bool,
    pub max_workers: usize,
    pub timeout_seconds: u64,
    pub clean: bool,
}

/// Per-status counts over a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_duration_secs: f64,
    pub success: bool,
}

impl Summary {
    pub fn of(session: &RunSession) -> Self {
        Self {
            passed: session.count(Status::Pass),
            failed: session.count(Status::Fail),
            skipped: session.count(Status::Skip),
            total_duration_secs: session.total_duration().as_secs_f64(),
            success: !session.has_failures(),
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    config: &'a RunConfig,
    summary: Summary,
    #[serde(flatten)]
    session: &'a RunSession,
}

/// Serialize the session to `<root>/.devcheck/test_report.json`.
pub fn write_json(root: &Path, session: &RunSession, config: &RunConfig) -> Result<PathBuf> {
    let path = root.join(REPORT_FILE);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
    }
    let report = Report {
        config,
        summary: Summary::of(session),
        session,
    };
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    Ok(path)
}

/// Human-readable summary for the terminal.
pub fn render_summary(session: &RunSession) -> String {
    let mut out = String::new();
    let rule = "=".repeat(RULE_WIDTH);
    let summary = Summary::of(session);

    let _ = writeln!(out, "{rule}\n{:^width$}\n{rule}", "SUMMARY", width = RULE_WIDTH);
    let _ = writeln!(out, "Total execution time: {:.2} seconds", summary.total_duration_secs);
    let _ = writeln!(
        out,
        "System: {} ({}, {} CPUs)",
        session.host.os, session.host.arch, session.host.cpus
    );

    if !session.interpreted.is_empty() {
        let _ = writeln!(out, "\nPython projects:");
        for result in &session.interpreted {
            let _ = writeln!(out, "  {}", result_line(result));
        }
    }

    if let Some(native) = &session.native {
        let _ = writeln!(out, "\nNative build:");
        let _ = writeln!(out, "  {}", result_line(native));
    }

    let _ = writeln!(
        out,
        "\n{} passed, {} failed, {} skipped",
        summary.passed, summary.failed, summary.skipped
    );
    let _ = write!(
        out,
        "{}",
        if summary.success { "All checks passed!" } else { "Some checks failed!" }
    );
    out
}

fn result_line(result: &ExecutionResult) -> String {
    let icon = match result.status() {
        Status::Pass => "✓",
        Status::Fail => "✗",
        Status::Skip => "⚠",
    };
    let mut line = format!("{icon} {}", result.name());
    if let Some(entry) = result.entry() {
        let _ = write!(line, " :: {entry}");
    }
    let _ = write!(
        line,
        " -> {} ({:.1}s)",
        result.status(),
        result.duration().as_secs_f64()
    );
    if result.status() != Status::Pass {
        if let Some(message) = result.error_message() {
            let _ = write!(line, "\n      {message}");
        }
    }
    line
}
