//! Bounded concurrent verification of interpreted projects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{error, info, instrument};

use crate::config::ProjectSpec;
use crate::error::CheckError;
use crate::exec::{CommandSpec, Executor, ProcessOutput};
use crate::result::ExecutionResult;
use crate::venv::EnvironmentManager;

/// Runs project checks on a pool of at most `max_workers` tasks.
///
/// Every project yields exactly one result. Faults, timeouts and even a
/// panicking task are converted to FAIL for that project alone.
pub struct ConcurrentRunner {
    manager: Arc<EnvironmentManager>,
    executor: Arc<dyn Executor>,
    max_workers: usize,
}

impl ConcurrentRunner {
    pub fn new(manager: Arc<EnvironmentManager>, executor: Arc<dyn Executor>, max_workers: usize) -> Self {
        Self {
            manager,
            executor,
            max_workers: max_workers.max(1),
        }
    }

    /// Check every project and return the results sorted by project path.
    #[instrument(skip_all, fields(projects = projects.len(), workers = self.max_workers))]
    pub async fn run_all(&self, projects: Vec<ProjectSpec>) -> Vec<ExecutionResult> {
        if projects.is_empty() {
            return Vec::new();
        }

        let permits = Arc::new(Semaphore::new(self.max_workers.min(projects.len())));
        let mut handles = Vec::with_capacity(projects.len());

        for project in projects {
            let permits = Arc::clone(&permits);
            let manager = Arc::clone(&self.manager);
            let executor = Arc::clone(&self.executor);
            let label = (project.path.clone(), project.entry.clone());

            let handle = tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return ExecutionResult::failed(&project.path, Duration::ZERO, "worker pool closed")
                        .with_entry(&project.entry);
                };
                check_project(&manager, executor.as_ref(), &project).await
            });
            handles.push((label, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for ((path, entry), handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(project = %path, error = %e, "Project task aborted");
                    results.push(
                        ExecutionResult::failed(path, Duration::ZERO, format!("task aborted: {e}"))
                            .with_entry(entry),
                    );
                }
            }
        }

        results.sort_by(|a, b| a.name().cmp(b.name()));
        results
    }
}

/// Prepare, run and evaluate one project.
pub async fn check_project(
    manager: &EnvironmentManager,
    executor: &dyn Executor,
    project: &ProjectSpec,
) -> ExecutionResult {
    let started = Instant::now();
    info!(project = %project.path, "Testing project");

    let result = match run_entry(manager, executor, project).await {
        Ok(output) => ExecutionResult::from_run(&project.path, started.elapsed(), &output, &project.expect),
        Err(e) => {
            error!(project = %project.path, error = %e, "Project failed");
            ExecutionResult::failed(&project.path, started.elapsed(), e.to_string())
        }
    }
    .with_entry(&project.entry);

    info!(
        project = %project.path,
        status = %result.status(),
        duration_secs = result.duration().as_secs_f64(),
        "Project finished"
    );
    result
}

async fn run_entry(
    manager: &EnvironmentManager,
    executor: &dyn Executor,
    project: &ProjectSpec,
) -> Result<ProcessOutput, CheckError> {
    let env = manager.ensure_environment(project).await?;
    manager.install_dependencies(&env, project).await?;

    let dir = manager.project_dir(project);
    let entry = dir.join(&project.entry);
    if !entry.is_file() {
        return Err(CheckError::EntryNotFound(entry));
    }

    let cmd = CommandSpec::new(&env.interpreter)
        .arg(&entry)
        .cwd(&dir)
        .timeout(project.timeout());
    Ok(executor.run(&cmd).await?)
}
