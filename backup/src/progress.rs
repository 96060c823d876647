//! Periodic console progress rendering

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metrics::MetricsReader;

/// Default redraw interval for the progress line
pub const DISPLAY_INTERVAL: Duration = Duration::from_millis(200);

/// Background task redrawing the progress line until stopped
pub struct ProgressDisplay {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressDisplay {
    /// Spawn the display loop; a quiet reader yields an inert display
    pub fn spawn(reader: MetricsReader, interval: Duration) -> Self {
        let cancel = CancellationToken::new();

        if reader.is_quiet() {
            return Self { cancel, handle: None };
        }

        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => reader.display_progress(),
                    _ = token.cancelled() => {
                        reader.display_progress();
                        println!();
                        break;
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Render one last frame and join the task
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Progress display task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ProgressDisplay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
