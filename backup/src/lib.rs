//! Backup Engine Library
//!
//! An async directory-tree backup engine providing:
//! - Copy task generation with glob exclusions
//! - Size and checksum based duplicate detection
//! - A bounded worker pool with retry, backoff and jitter
//! - Queue-fed metrics and console progress
//! - A versioned history of every run
//! - Dry-run analysis

pub mod checksum;
pub mod config;
pub mod copier;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod progress;
pub mod service;
pub mod task;
pub mod version;

// Re-export main types and functions
pub use checksum::{compute_checksum, ChecksumAlgorithm};
pub use config::{BackupConfig, RunOptions};
pub use copier::{CopyOutcome, CopyStrategy, FileCopier};
pub use error::{BackupError, Result, TaskFailure};
pub use filter::ExclusionFilter;
pub use metrics::{MetricsAggregator, MetricsHandle, MetricsReader, MetricsSnapshot};
pub use policy::{CopyReason, Decision, DuplicatePolicy};
pub use pool::{RetryPolicy, TaskOutcome, WorkerPool};
pub use service::{BackupReport, BackupService, DryRunEntry, DryRunReport, RunState, TaskAction};
pub use task::{build_tasks, CopyTask, TaskPlan};
pub use version::{BackupStats, BackupVersion, FileMetadata, VersionManager, VersionStatus};

/// Validate `config` and run one backup to completion
pub async fn run_backup(config: BackupConfig) -> Result<BackupReport> {
    let service = BackupService::new(config)?;
    service.backup().await
}

/// Validate `config` and classify every task without touching the target
pub async fn dry_run(config: BackupConfig) -> Result<DryRunReport> {
    let service = BackupService::new(config)?;
    service.dry_run().await
}

// Test modules
#[cfg(test)]
mod pool_tests;
