//! Duplicate detection: decides whether a destination is already current

use std::fmt;
use std::io::ErrorKind;
use tokio::fs;
use tracing::debug;

use crate::checksum::{compute_checksum, ChecksumAlgorithm};
use crate::error::{BackupError, Result};
use crate::task::CopyTask;

/// Why a task has to be (re)written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyReason {
    Missing,
    SizeMismatch,
    ChecksumMismatch,
}

impl fmt::Display for CopyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyReason::Missing => write!(f, "destination missing"),
            CopyReason::SizeMismatch => write!(f, "size differs"),
            CopyReason::ChecksumMismatch => write!(f, "checksum differs"),
        }
    }
}

/// Outcome of the duplicate policy for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Copy { reason: CopyReason },
    /// Destination is current; carries the checksum if one was computed
    Skip { checksum: Option<String> },
}

/// Size-first comparison, optionally confirmed by checksums
#[derive(Debug, Clone, Copy)]
pub struct DuplicatePolicy {
    deep_check: bool,
    algorithm: ChecksumAlgorithm,
}

impl DuplicatePolicy {
    pub fn new(deep_check: bool, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            deep_check,
            algorithm,
        }
    }

    /// Decide Copy or Skip for a task
    pub async fn decide(&self, task: &CopyTask) -> Result<Decision> {
        let dest_meta = match fs::metadata(&task.destination).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Decision::Copy {
                    reason: CopyReason::Missing,
                });
            }
            Err(e) => return Err(BackupError::stat_error(&task.destination, e)),
        };

        // The walk-time size may be stale by the time a worker picks the task up
        let source_meta = fs::metadata(&task.source)
            .await
            .map_err(|e| BackupError::stat_error(&task.source, e))?;

        if source_meta.len() != dest_meta.len() {
            debug!(
                source = %task.source.display(),
                source_size = source_meta.len(),
                destination_size = dest_meta.len(),
                "Size mismatch"
            );
            return Ok(Decision::Copy {
                reason: CopyReason::SizeMismatch,
            });
        }

        if !self.deep_check {
            return Ok(Decision::Skip { checksum: None });
        }

        let source_hash = compute_checksum(&task.source, self.algorithm).await?;
        let dest_hash = compute_checksum(&task.destination, self.algorithm).await?;

        if source_hash != dest_hash {
            debug!(source = %task.source.display(), "Checksum mismatch");
            return Ok(Decision::Copy {
                reason: CopyReason::ChecksumMismatch,
            });
        }

        Ok(Decision::Skip {
            checksum: Some(source_hash),
        })
    }
}
