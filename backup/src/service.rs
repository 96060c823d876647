//! Backup orchestration: wires task building, the worker pool, metrics
//! and version history into `backup` and `dry_run` runs

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BackupConfig;
use crate::copier::CopyStrategy;
use crate::error::{BackupError, Result, TaskFailure};
use crate::filter::ExclusionFilter;
use crate::metrics::{MetricsAggregator, MetricsReader};
use crate::policy::{Decision, DuplicatePolicy};
use crate::pool::{TaskOutcome, WorkerPool};
use crate::progress::{format_bytes, ProgressDisplay, DISPLAY_INTERVAL};
use crate::task::{build_tasks, CopyTask, TaskPlan};
use crate::version::{BackupStats, BackupVersion, FileMetadata, VersionManager, VersionStatus};

/// Lifecycle of the most recent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Validating,
    BuildingTasks,
    Copying,
    Finalizing,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Validating => "validating",
            RunState::BuildingTasks => "building tasks",
            RunState::Copying => "copying",
            RunState::Finalizing => "finalizing",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// What happened (or would happen) to one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskAction {
    Copy,
    Skip,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskAction::Copy => write!(f, "COPY"),
            TaskAction::Skip => write!(f, "SKIP"),
        }
    }
}

/// Result of a completed backup run
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub version_id: String,
    pub status: VersionStatus,
    pub stats: BackupStats,
    pub duration: Duration,
    /// Tasks that exhausted their retries
    pub failures: Vec<TaskFailure>,
    /// Rendered end-of-run summary
    pub summary: String,
}

impl BackupReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// One classified task of a dry run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub action: TaskAction,
    pub size: u64,
}

/// Would-copy / would-skip analysis of a run that never touches the target
#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub entries: Vec<DryRunEntry>,
    pub stats: BackupStats,
    pub failures: Vec<TaskFailure>,
    pub duration: Duration,
}

impl DryRunReport {
    pub fn files_to_copy(&self) -> usize {
        self.count(TaskAction::Copy)
    }

    pub fn files_to_skip(&self) -> usize {
        self.count(TaskAction::Skip)
    }

    pub fn bytes_to_copy(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.action == TaskAction::Copy)
            .map(|e| e.size)
            .sum()
    }

    fn count(&self, action: TaskAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Text form of the analysis: one line per task, then totals
    pub fn render(&self) -> String {
        let mut out = String::from("Dry run analysis\n================\n\n");

        for entry in &self.entries {
            match entry.action {
                TaskAction::Copy => out.push_str(&format!(
                    "COPY: {} -> {} ({})\n",
                    entry.source.display(),
                    entry.destination.display(),
                    format_bytes(entry.size)
                )),
                TaskAction::Skip => out.push_str(&format!(
                    "SKIP: {} ({})\n",
                    entry.source.display(),
                    format_bytes(entry.size)
                )),
            }
        }

        for failure in &self.failures {
            out.push_str(&format!("ERROR: {}: {}\n", failure.source.display(), failure.error));
        }

        out.push_str(&format!(
            "\nSummary\n-------\n\
             Total files: {}\n\
             Files to copy: {} ({})\n\
             Files to skip: {}\n\
             Files with errors: {}\n\
             Analysis took {:.2?}\n",
            self.stats.total_files,
            self.files_to_copy(),
            format_bytes(self.bytes_to_copy()),
            self.files_to_skip(),
            self.failures.len(),
            self.duration,
        ));

        out
    }

    pub async fn write_log<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.render()).await?;
        info!(path = %path.display(), "Dry run log written");
        Ok(())
    }
}

/// Successful task result handed from workers to the orchestrator
struct TaskRecord {
    task: CopyTask,
    action: TaskAction,
    bytes: u64,
    checksum: Option<String>,
}

impl TaskRecord {
    fn into_metadata(self) -> (String, FileMetadata) {
        let key = self.task.source.to_string_lossy().into_owned();
        let metadata = FileMetadata {
            path: self.task.source,
            size: self.bytes,
            modified: self.task.modified,
            checksum: self.checksum,
        };
        (key, metadata)
    }

    fn into_dry_run_entry(self) -> DryRunEntry {
        DryRunEntry {
            source: self.task.source,
            destination: self.task.destination,
            action: self.action,
            size: self.bytes,
        }
    }
}

/// Per-task work run inside the pool: duplicate policy, then the copy strategy
#[derive(Clone)]
struct TaskRunner {
    policy: DuplicatePolicy,
    strategy: CopyStrategy,
    records: mpsc::UnboundedSender<TaskRecord>,
}

impl TaskRunner {
    async fn run(self, task: CopyTask) -> Result<TaskOutcome> {
        match self.policy.decide(&task).await? {
            Decision::Skip { checksum } => {
                let bytes = task.size;
                debug!(source = %task.source.display(), "Destination is current, skipping");
                self.record(TaskRecord {
                    task,
                    action: TaskAction::Skip,
                    bytes,
                    checksum,
                });
                Ok(TaskOutcome::Skipped { bytes })
            }
            Decision::Copy { reason } => {
                debug!(source = %task.source.display(), %reason, "Copying");
                let outcome = self.strategy.execute(&task).await?;
                let bytes = outcome.bytes;
                self.record(TaskRecord {
                    task,
                    action: TaskAction::Copy,
                    bytes,
                    checksum: outcome.checksum,
                });
                Ok(TaskOutcome::Copied { bytes })
            }
        }
    }

    fn record(&self, record: TaskRecord) {
        if self.records.send(record).is_err() {
            warn!("Task record receiver closed");
        }
    }
}

/// Entry point for backup and dry runs over one configuration
pub struct BackupService {
    config: BackupConfig,
    filter: ExclusionFilter,
    versions: Mutex<Option<VersionManager>>,
    state: RwLock<RunState>,
    active_metrics: RwLock<Option<MetricsReader>>,
}

impl BackupService {
    /// Validate the configuration and compile its exclusion patterns
    pub fn new(config: BackupConfig) -> Result<Self> {
        config.validate()?;
        let filter = ExclusionFilter::new(&config.exclude_patterns)?;

        Ok(Self {
            config,
            filter,
            versions: Mutex::new(None),
            state: RwLock::new(RunState::Idle),
            active_metrics: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    fn set_state(&self, state: RunState) {
        debug!(%state, "Run state changed");
        *self.state.write() = state;
    }

    fn fail<T>(&self, error: BackupError) -> Result<T> {
        error!(error = %error, "Run failed");
        self.set_state(RunState::Failed);
        Err(error)
    }

    /// Check a replacement configuration against the running one
    pub fn validate_config_change(&self, new_config: &BackupConfig) -> Result<()> {
        new_config.validate()?;

        let in_progress = self
            .active_metrics
            .read()
            .as_ref()
            .is_some_and(|metrics| metrics.is_backup_in_progress());

        if in_progress && new_config.concurrency < self.config.concurrency {
            return Err(BackupError::validation(
                "cannot reduce concurrency while a backup is in progress",
            ));
        }

        Ok(())
    }

    /// Run a backup that can only end by itself
    pub async fn backup(&self) -> Result<BackupReport> {
        self.backup_with_cancel(CancellationToken::new()).await
    }

    /// Run a backup, stopping early when `cancel` fires.
    ///
    /// Per-file failures still produce a completed version; a cancelled run
    /// is recorded as failed and returns `Cancelled`.
    #[instrument(skip_all, fields(source = %self.config.source_directory.display(), target = %self.config.target_directory.display()))]
    pub async fn backup_with_cancel(&self, cancel: CancellationToken) -> Result<BackupReport> {
        let started = Instant::now();
        info!("Starting backup");

        self.set_state(RunState::Validating);
        if let Err(e) = self.validate_paths(true).await {
            return self.fail(e);
        }

        self.set_state(RunState::BuildingTasks);
        let plan = match build_tasks(&self.config, &self.filter) {
            Ok(plan) => plan,
            Err(e) => return self.fail(e),
        };

        let mut versions = self.versions.lock().await;
        if versions.is_none() {
            match VersionManager::open(&self.config.target_directory).await {
                Ok(manager) => *versions = Some(manager),
                Err(e) => return self.fail(e),
            }
        }
        let Some(manager) = versions.as_mut() else {
            return self.fail(BackupError::NoActiveVersion);
        };

        let version_id = manager.start_new_version(&self.config).id.clone();
        let (mut metrics, display) = self.start_metrics(plan.total_files);
        *self.active_metrics.write() = Some(metrics.reader());

        self.set_state(RunState::Copying);
        let strategy = CopyStrategy::for_run(false, self.config.buffer_size, self.config.checksum_algorithm);
        let outcome = self
            .run_tasks(plan, strategy, &metrics, &cancel, |record| {
                let (key, metadata) = record.into_metadata();
                if let Err(e) = manager.add_file(key, metadata) {
                    warn!(error = %e, "Failed to record file in version");
                }
            })
            .await;

        metrics.flush().await;
        display.stop().await;

        self.set_state(RunState::Finalizing);
        let stats = metrics.get_stats().to_stats();
        let summary = metrics.final_summary();
        metrics.shutdown().await;
        *self.active_metrics.write() = None;

        let failures = match outcome {
            Ok(()) => Vec::new(),
            Err(BackupError::TasksFailed { failures }) => {
                warn!(failed = failures.len(), "Some files could not be backed up");
                failures
            }
            Err(e) => {
                if let Err(persist) = manager.fail_version(stats).await {
                    error!(error = %persist, "Failed to record failed version");
                }
                return self.fail(e);
            }
        };

        let version = match manager.complete_version(stats).await {
            Ok(version) => version,
            Err(e) => return self.fail(e),
        };

        info!(
            version = %version_id,
            copied = version.stats.files_backed_up,
            skipped = version.stats.files_skipped,
            failed = version.stats.files_failed,
            "Backup completed"
        );
        self.set_state(RunState::Completed);

        Ok(BackupReport {
            version_id: version.id,
            status: version.status,
            stats: version.stats,
            duration: started.elapsed(),
            failures,
            summary,
        })
    }

    /// Classify every task without writing to the target
    pub async fn dry_run(&self) -> Result<DryRunReport> {
        self.dry_run_with_cancel(CancellationToken::new()).await
    }

    #[instrument(skip_all, fields(source = %self.config.source_directory.display()))]
    pub async fn dry_run_with_cancel(&self, cancel: CancellationToken) -> Result<DryRunReport> {
        let started = Instant::now();
        info!("Starting dry run");

        self.set_state(RunState::Validating);
        if let Err(e) = self.validate_paths(false).await {
            return self.fail(e);
        }

        self.set_state(RunState::BuildingTasks);
        let plan = match build_tasks(&self.config, &self.filter) {
            Ok(plan) => plan,
            Err(e) => return self.fail(e),
        };

        let (mut metrics, display) = self.start_metrics(plan.total_files);

        self.set_state(RunState::Copying);
        let mut entries = Vec::with_capacity(plan.total_files);
        let strategy = CopyStrategy::for_run(true, self.config.buffer_size, self.config.checksum_algorithm);
        let outcome = self
            .run_tasks(plan, strategy, &metrics, &cancel, |record| {
                entries.push(record.into_dry_run_entry());
            })
            .await;

        metrics.flush().await;
        display.stop().await;

        self.set_state(RunState::Finalizing);
        let stats = metrics.get_stats().to_stats();
        metrics.shutdown().await;

        let failures = match outcome {
            Ok(()) => Vec::new(),
            Err(BackupError::TasksFailed { failures }) => failures,
            Err(e) => return self.fail(e),
        };

        entries.sort_by(|a, b| a.source.cmp(&b.source));
        self.set_state(RunState::Completed);

        let report = DryRunReport {
            entries,
            stats,
            failures,
            duration: started.elapsed(),
        };

        info!(
            to_copy = report.files_to_copy(),
            to_skip = report.files_to_skip(),
            "Dry run completed"
        );

        Ok(report)
    }

    /// Drive the pool over `plan`, feeding each successful task to `on_record`
    /// from this task only, so the callback needs no locking.
    async fn run_tasks<R>(
        &self,
        plan: TaskPlan,
        strategy: CopyStrategy,
        metrics: &MetricsAggregator,
        cancel: &CancellationToken,
        mut on_record: R,
    ) -> Result<()>
    where
        R: FnMut(TaskRecord),
    {
        let (records, mut record_rx) = mpsc::unbounded_channel();
        let runner = TaskRunner {
            policy: DuplicatePolicy::new(self.config.deep_duplicate_check, self.config.checksum_algorithm),
            strategy,
            records,
        };

        let pool = WorkerPool::new(
            self.config.concurrency,
            move |task: CopyTask| {
                let runner = runner.clone();
                async move { runner.run(task).await }
            },
            self.config.retry_attempts,
            self.config.retry_delay,
        );

        let handle = metrics.handle();
        let execute = async move {
            let result = pool.execute(plan.tasks, &handle, cancel).await;
            // Dropping the pool closes the record channel
            drop(pool);
            result
        };

        let record = async {
            while let Some(record) = record_rx.recv().await {
                on_record(record);
            }
        };

        let (result, ()) = tokio::join!(execute, record);
        result
    }

    /// Metrics for one run plus its progress line, silent when quiet
    pub(crate) fn start_metrics(&self, total_files: usize) -> (MetricsAggregator, ProgressDisplay) {
        let metrics = MetricsAggregator::start(total_files, self.config.options.quiet);
        let display = ProgressDisplay::spawn(metrics.reader(), DISPLAY_INTERVAL);
        (metrics, display)
    }

        async fn validate_paths(&self, create_target: bool) -> Result<()> {
        let source = &self.config.source_directory;
        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(BackupError::validation(format!(
                    "source path is not a directory: {}",
                    source.display()
                )))
            }
            Err(e) => {
                return Err(BackupError::validation(format!(
                    "source directory does not exist: {}: {}",
                    source.display(),
                    e
                )))
            }
        }

        if create_target {
            let target = &self.config.target_directory;
            tokio::fs::create_dir_all(target).await.map_err(|e| {
                BackupError::validation(format!(
                    "cannot create target directory {}: {}",
                    target.display(),
                    e
                ))
            })?;
        }

        Ok(())
    }

    async fn with_versions<T>(&self, query: impl FnOnce(&VersionManager) -> Result<T>) -> Result<T> {
        let mut versions = self.versions.lock().await;
        if versions.is_none() {
            *versions = Some(VersionManager::open(&self.config.target_directory).await?);
        }
        match versions.as_ref() {
            Some(manager) => query(manager),
            None => Err(BackupError::NoActiveVersion),
        }
    }

    /// All recorded versions, oldest first
    pub async fn list_versions(&self) -> Result<Vec<BackupVersion>> {
        self.with_versions(|manager| Ok(manager.versions().to_vec())).await
    }

    pub async fn get_version(&self, id: &str) -> Result<BackupVersion> {
        self.with_versions(|manager| manager.version(id).cloned()).await
    }

    pub async fn latest_version(&self) -> Result<Option<BackupVersion>> {
        self.with_versions(|manager| Ok(manager.latest_version().cloned())).await
    }
}
