//! Copy task generation from a walk of the configured source folders

use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::BackupConfig;
use crate::error::{BackupError, Result};
use crate::filter::ExclusionFilter;

/// One pending source to destination copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyTask {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Size in bytes at walk time
    pub size: u64,
    /// Source modification time at walk time
    pub modified: DateTime<Utc>,
}

/// Output of a walk: the flat task list and its totals
#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    pub tasks: Vec<CopyTask>,
    pub total_files: usize,
    pub total_bytes: u64,
}

impl TaskPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Walk every configured folder and emit one task per non-directory entry.
///
/// Entries whose base name matches an exclusion pattern are skipped; matched
/// directories are pruned so nothing beneath them is visited. The folder root
/// itself is never tested against the patterns. Any traversal error aborts the
/// whole walk.
pub fn build_tasks(config: &BackupConfig, filter: &ExclusionFilter) -> Result<TaskPlan> {
    let mut plan = TaskPlan::default();

    for folder in &config.folders_to_backup {
        let source_root = config.source_directory.join(folder);
        let target_root = config.target_directory.join(folder);
        let before = plan.tasks.len();

        let walker = WalkDir::new(&source_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !filter.is_excluded(entry.file_name()));

        for entry in walker {
            let entry = entry.map_err(|e| walk_error(&source_root, e))?;

            if entry.file_type().is_dir() {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| walk_error(&source_root, e))?;
            let relative = entry
                .path()
                .strip_prefix(&source_root)
                .map_err(|e| BackupError::validation(format!(
                    "entry '{}' is outside '{}': {}",
                    entry.path().display(),
                    source_root.display(),
                    e
                )))?;

            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            plan.total_bytes += metadata.len();
            plan.tasks.push(CopyTask {
                source: entry.path().to_path_buf(),
                destination: target_root.join(relative),
                size: metadata.len(),
                modified,
            });
        }

        debug!(
            folder = %folder,
            files = plan.tasks.len() - before,
            "Scanned backup folder"
        );
    }

    plan.total_files = plan.tasks.len();

    info!(
        files = plan.total_files,
        bytes = plan.total_bytes,
        "Built copy task list"
    );

    Ok(plan)
}

fn walk_error(root: &std::path::Path, source: walkdir::Error) -> BackupError {
    let path = source
        .path()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| root.to_path_buf());

    BackupError::Walk { path, source }
}
