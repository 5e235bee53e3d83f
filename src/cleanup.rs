//! `--clean`: remove build output and cached environments before a run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{NativeBuildSpec, ProjectSpec};
use crate::venv::{SENTINEL_FILE, VENV_BUCKET, VENV_PREFIX};

const REMOVE_ATTEMPTS: u32 = 3;

/// What a cleanup pass did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Remove the native build directory, the environment bucket, any legacy
/// `.venv_devcheck*` directory under `root`, and the projects' install
/// sentinels. Paths outside `root` are never touched.
pub async fn clean_workspace(
    root: &Path,
    native: &NativeBuildSpec,
    projects: &[ProjectSpec],
) -> CleanupReport {
    let mut report = CleanupReport::default();

    for target in cleanup_targets(root, native, projects) {
        if !target.starts_with(root) {
            warn!(path = %target.display(), "Refusing to clean outside the run root");
            continue;
        }
        if tokio::fs::symlink_metadata(&target).await.is_err() {
            debug!(path = %target.display(), "Not found (skip)");
            continue;
        }
        info!(path = %target.display(), "Cleaning");
        match remove_with_retry(&target).await {
            Ok(()) => report.removed.push(target),
            Err(e) => {
                warn!(path = %target.display(), error = %e, "Failed to clean");
                report.failed.push((target, e.to_string()));
            }
        }
    }
    report
}

/// Sorted, with paths nested under another target dropped.
fn cleanup_targets(root: &Path, native: &NativeBuildSpec, projects: &[ProjectSpec]) -> Vec<PathBuf> {
    let bucket = root.join(VENV_BUCKET);
    let mut targets = vec![root.join(&native.build_dir), bucket.clone()];

    let legacy_prefix = VENV_PREFIX.trim_end_matches('_');
    let legacy = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git" && !e.path().starts_with(&bucket))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir() && e.file_name().to_string_lossy().starts_with(legacy_prefix))
        .map(walkdir::DirEntry::into_path);
    targets.extend(legacy);

    targets.extend(projects.iter().map(|p| root.join(&p.path).join(SENTINEL_FILE)));

    targets.sort();
    targets.dedup();
    let mut kept: Vec<PathBuf> = Vec::with_capacity(targets.len());
    for target in targets {
        if !kept.iter().any(|k| target.starts_with(k)) {
            kept.push(target);
        }
    }
    kept
}

async fn remove_with_retry(path: &Path) -> std::io::Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = if path.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt < REMOVE_ATTEMPTS => {
                debug!(path = %path.display(), attempt, error = %e, "Retrying delete");
                clear_readonly(path);
                tokio::time::sleep(Duration::from_millis(500) * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Windows refuses to delete read-only files; unix permissions are left alone.
#[cfg(windows)]
fn clear_readonly(path: &Path) {
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if let Ok(meta) = entry.metadata() {
            let mut perms = meta.permissions();
            if perms.readonly() {
                perms.set_readonly(false);
                let _ = std::fs::set_permissions(entry.path(), perms);
            }
        }
    }
}

#[cfg(not(windows))]
const fn clear_readonly(_path: &Path) {}
