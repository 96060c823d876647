//! Single-writer aggregation of per-task outcomes
//!
//! Workers post updates to a bounded queue without ever blocking; one
//! background task drains the queue and owns every counter mutation.
//! Readers only ever see snapshots taken under a read lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::progress::format_bytes;
use crate::version::BackupStats;

const BAR_WIDTH: usize = 30;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

enum MetricsUpdate {
    Completed(u64),
    Skipped(u64),
    Failed,
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct MetricsState {
    files_completed: usize,
    bytes_completed: u64,
    files_skipped: usize,
    bytes_skipped: u64,
    files_failed: usize,
}

impl MetricsState {
    fn apply(&mut self, update: MetricsUpdate) {
        match update {
            MetricsUpdate::Completed(bytes) => {
                self.files_completed += 1;
                self.bytes_completed += bytes;
            }
            MetricsUpdate::Skipped(bytes) => {
                self.files_skipped += 1;
                self.bytes_skipped += bytes;
            }
            MetricsUpdate::Failed => self.files_failed += 1,
            MetricsUpdate::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// Immutable point-in-time statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_files: usize,
    pub files_completed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub bytes_completed: u64,
    pub bytes_skipped: u64,
    /// Updates lost because the queue was full
    pub dropped_updates: u64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn processed(&self) -> usize {
        self.files_completed + self.files_skipped + self.files_failed
    }

    /// Completed plus skipped over total, in percent
    pub fn percentage(&self) -> f64 {
        if self.total_files == 0 {
            return 100.0;
        }
        (self.files_completed + self.files_skipped) as f64 / self.total_files as f64 * 100.0
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_completed + self.bytes_skipped
    }

    /// Copy throughput in bytes per second
    pub fn transfer_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_completed as f64 / secs
        } else {
            0.0
        }
    }

    pub fn to_stats(&self) -> BackupStats {
        BackupStats {
            total_files: self.total_files,
            files_backed_up: self.files_completed,
            files_skipped: self.files_skipped,
            files_failed: self.files_failed,
            total_bytes: self.bytes(),
            bytes_transferred: self.bytes_completed,
        }
    }
}

/// Cloneable sender side handed to workers
#[derive(Clone)]
pub struct MetricsHandle {
    tx: mpsc::Sender<MetricsUpdate>,
    dropped: Arc<AtomicU64>,
}

impl MetricsHandle {
    pub fn increment_completed(&self, bytes: u64) {
        self.post(MetricsUpdate::Completed(bytes));
    }

    pub fn increment_skipped(&self, bytes: u64) {
        self.post(MetricsUpdate::Skipped(bytes));
    }

    pub fn increment_failed(&self) {
        self.post(MetricsUpdate::Failed);
    }

    fn post(&self, update: MetricsUpdate) {
        if self.tx.try_send(update).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(dropped, "Metrics queue full, update dropped");
        }
    }
}

/// Read-only view over the aggregated counters
#[derive(Clone)]
pub struct MetricsReader {
    state: Arc<RwLock<MetricsState>>,
    dropped: Arc<AtomicU64>,
    total_files: usize,
    start: Instant,
    quiet: bool,
}

impl MetricsReader {
    pub fn get_stats(&self) -> MetricsSnapshot {
        let state = self.state.read();
        MetricsSnapshot {
            total_files: self.total_files,
            files_completed: state.files_completed,
            files_skipped: state.files_skipped,
            files_failed: state.files_failed,
            bytes_completed: state.bytes_completed,
            bytes_skipped: state.bytes_skipped,
            dropped_updates: self.dropped.load(Ordering::Relaxed),
            elapsed: self.start.elapsed(),
        }
    }

    /// True once any outcome has been recorded
    pub fn is_backup_in_progress(&self) -> bool {
        self.get_stats().processed() > 0
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Redraw the progress line in place, unless quiet
    pub fn display_progress(&self) {
        if self.quiet {
            return;
        }

        use std::io::Write;
        let frame = progress_frame(&self.get_stats());
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{}", frame);
        let _ = stdout.flush();
    }

    /// End-of-run summary text
    pub fn final_summary(&self) -> String {
        let stats = self.get_stats();
        let mut summary = format!(
            "Backup completed in {:.2?}\n\
             Files processed: {}\n\
             Files skipped: {}\n\
             Files failed: {}\n\
             Total size: {:.2} MB",
            stats.elapsed,
            stats.files_completed,
            stats.files_skipped,
            stats.files_failed,
            stats.bytes() as f64 / BYTES_PER_MB,
        );

        if stats.dropped_updates > 0 {
            summary.push_str(&format!(
                "\nNote: {} progress update(s) were dropped; counts are approximate",
                stats.dropped_updates
            ));
        }

        summary
    }
}

/// Owns the drain task and the queue feeding it
pub struct MetricsAggregator {
    reader: MetricsReader,
    handle: MetricsHandle,
    cancel: CancellationToken,
    drain: Option<JoinHandle<()>>,
}

impl MetricsAggregator {
    /// Start aggregating for a run of `total_files` tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(total_files: usize, quiet: bool) -> Self {
        let (tx, rx) = mpsc::channel(total_files.max(1));
        let state = Arc::new(RwLock::new(MetricsState::default()));
        let dropped = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let drain = tokio::spawn(drain_updates(rx, Arc::clone(&state), cancel.clone()));

        Self {
            reader: MetricsReader {
                state,
                dropped: Arc::clone(&dropped),
                total_files,
                start: Instant::now(),
                quiet,
            },
            handle: MetricsHandle { tx, dropped },
            cancel,
            drain: Some(drain),
        }
    }

    pub fn handle(&self) -> MetricsHandle {
        self.handle.clone()
    }

    pub fn reader(&self) -> MetricsReader {
        self.reader.clone()
    }

    pub fn increment_completed(&self, bytes: u64) {
        self.handle.increment_completed(bytes);
    }

    pub fn increment_skipped(&self, bytes: u64) {
        self.handle.increment_skipped(bytes);
    }

    pub fn increment_failed(&self) {
        self.handle.increment_failed();
    }

    pub fn get_stats(&self) -> MetricsSnapshot {
        self.reader.get_stats()
    }

    pub fn is_backup_in_progress(&self) -> bool {
        self.reader.is_backup_in_progress()
    }

    pub fn display_progress(&self) {
        self.reader.display_progress();
    }

    pub fn final_summary(&self) -> String {
        self.reader.final_summary()
    }

    /// Wait until every update queued so far has been applied
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.handle.tx.send(MetricsUpdate::Flush(ack)).await.is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Apply what is queued, then stop the drain task
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(drain) = self.drain.take() {
            if let Err(e) = drain.await {
                warn!(error = %e, "Metrics drain task failed");
            }
        }
    }
}

impl Drop for MetricsAggregator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain_updates(
    mut rx: mpsc::Receiver<MetricsUpdate>,
    state: Arc<RwLock<MetricsState>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => state.write().apply(update),
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(update) = rx.try_recv() {
                    state.write().apply(update);
                }
                break;
            }
        }
    }
}

/// Render the progress bar line for a snapshot
pub fn format_progress_line(stats: &MetricsSnapshot) -> String {
    let percentage = stats.percentage().clamp(0.0, 100.0);
    let filled = ((percentage / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);
    let bar = format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled));

    format!(
        "[{}] {:.1}% | {} copied, {} skipped of {} files | {} | {}/s",
        bar,
        percentage,
        stats.files_completed,
        stats.files_skipped,
        stats.total_files,
        format_bytes(stats.bytes()),
        format_bytes(stats.transfer_rate() as u64),
    )
}

/// Progress line prefixed to return the cursor and clear the old line
fn progress_frame(stats: &MetricsSnapshot) -> String {
    format!("\r\x1b[K{}", format_progress_line(stats))
}
