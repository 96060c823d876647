//! Single-file copy with one-pass hashing and permission preservation

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::checksum::{ChecksumAlgorithm, ChecksumHasher};
use crate::error::{BackupError, Result};
use crate::task::CopyTask;

/// Result of one completed copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub bytes: u64,
    /// Present for real copies, absent for simulated ones
    pub checksum: Option<String>,
}

/// Streams a file into place through a fixed-size buffer
#[derive(Debug, Clone, Copy)]
pub struct FileCopier {
    buffer_size: usize,
    algorithm: ChecksumAlgorithm,
}

impl FileCopier {
    pub fn new(buffer_size: usize, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            algorithm,
        }
    }

    /// Copy `task.source` to `task.destination`, hashing the bytes as they pass
    pub async fn copy(&self, task: &CopyTask) -> Result<CopyOutcome> {
        let source = &task.source;
        let destination = &task.destination;

        // Ensure parent directory exists
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                BackupError::copy_error(source, format!("Failed to create parent directory: {}", e))
            })?;
        }

        let mut reader = fs::File::open(source).await.map_err(|e| {
            BackupError::copy_error(source, format!("Failed to open source: {}", e))
        })?;

        let mut writer = fs::File::create(destination).await.map_err(|e| {
            BackupError::copy_error(source, format!("Failed to create destination: {}", e))
        })?;

        let mut hasher = ChecksumHasher::new(self.algorithm);
        let mut buffer = vec![0u8; self.buffer_size];
        let mut bytes: u64 = 0;

        loop {
            let read = reader.read(&mut buffer).await.map_err(|e| {
                BackupError::copy_error(source, format!("Failed to read source: {}", e))
            })?;

            if read == 0 {
                break;
            }

            writer.write_all(&buffer[..read]).await.map_err(|e| {
                BackupError::copy_error(source, format!("Failed to write destination: {}", e))
            })?;

            hasher.update(&buffer[..read]);
            bytes += read as u64;
        }

        writer.flush().await.map_err(|e| {
            BackupError::copy_error(source, format!("Failed to flush destination: {}", e))
        })?;
        drop(writer);

        // Content is already in place; permission failures are not fatal
        match fs::metadata(source).await {
            Ok(metadata) => {
                if let Err(e) = fs::set_permissions(destination, metadata.permissions()).await {
                    warn!(
                        destination = %destination.display(),
                        error = %e,
                        "Failed to preserve permissions"
                    );
                }
            }
            Err(e) => warn!(
                source = %source.display(),
                error = %e,
                "Failed to read source permissions"
            ),
        }

        debug!(source = %source.display(), bytes, "Copied file");

        Ok(CopyOutcome {
            bytes,
            checksum: Some(hasher.finalize_hex()),
        })
    }
}

/// Real copier for backups, a no-op simulator for dry runs
#[derive(Debug, Clone, Copy)]
pub enum CopyStrategy {
    Real(FileCopier),
    Simulated,
}

impl CopyStrategy {
    pub fn for_run(dry_run: bool, buffer_size: usize, algorithm: ChecksumAlgorithm) -> Self {
        if dry_run {
            CopyStrategy::Simulated
        } else {
            CopyStrategy::Real(FileCopier::new(buffer_size, algorithm))
        }
    }

    pub async fn execute(&self, task: &CopyTask) -> Result<CopyOutcome> {
        match self {
            CopyStrategy::Real(copier) => copier.copy(task).await,
            CopyStrategy::Simulated => Ok(CopyOutcome {
                bytes: task.size,
                checksum: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_checksum;
    use chrono::Utc;
    use tempfile::TempDir;

    fn task(temp_dir: &TempDir, size: u64) -> CopyTask {
        CopyTask {
            source: temp_dir.path().join("source/file.bin"),
            destination: temp_dir.path().join("target/a/b/file.bin"),
            size,
            modified: Utc::now(),
        }
    }

    async fn write_source(task: &CopyTask, content: &[u8]) {
        fs::create_dir_all(task.source.parent().unwrap()).await.unwrap();
        fs::write(&task.source, content).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_creates_parents_and_hashes_in_one_pass() {
        let temp_dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 7) as u8).collect();
        let task = task(&temp_dir, content.len() as u64);
        write_source(&task, &content).await;

        // Small buffer forces many read/write rounds
        let copier = FileCopier::new(4096, ChecksumAlgorithm::Sha256);
        let outcome = copier.copy(&task).await.unwrap();

        assert_eq!(outcome.bytes, content.len() as u64);
        assert_eq!(fs::read(&task.destination).await.unwrap(), content);
        assert_eq!(
            outcome.checksum.unwrap(),
            compute_checksum(&task.source, ChecksumAlgorithm::Sha256).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_copy_truncates_existing_destination() {
        let temp_dir = TempDir::new().unwrap();
        let task = task(&temp_dir, 3);
        write_source(&task, b"new").await;
        fs::create_dir_all(task.destination.parent().unwrap()).await.unwrap();
        fs::write(&task.destination, b"much longer old content").await.unwrap();

        FileCopier::new(32 * 1024, ChecksumAlgorithm::Blake3).copy(&task).await.unwrap();

        assert_eq!(fs::read(&task.destination).await.unwrap(), b"new");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_preserves_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let task = task(&temp_dir, 2);
        write_source(&task, b"#!").await;
        fs::set_permissions(&task.source, std::fs::Permissions::from_mode(0o750)).await.unwrap();

        FileCopier::new(4096, ChecksumAlgorithm::Sha256).copy(&task).await.unwrap();

        let mode = fs::metadata(&task.destination).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[tokio::test]
    async fn test_missing_source_is_copy_error() {
        let temp_dir = TempDir::new().unwrap();
        let task = task(&temp_dir, 0);

        let result = FileCopier::new(4096, ChecksumAlgorithm::Sha256).copy(&task).await;

        assert!(matches!(result, Err(BackupError::Copy { .. })));
    }

    #[tokio::test]
    async fn test_simulated_strategy_touches_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let task = task(&temp_dir, 42);

        let strategy = CopyStrategy::for_run(true, 4096, ChecksumAlgorithm::Sha256);
        let outcome = strategy.execute(&task).await.unwrap();

        assert!(matches!(strategy, CopyStrategy::Simulated));
        assert_eq!(outcome, CopyOutcome { bytes: 42, checksum: None });
        assert!(!task.destination.exists());
    }
}
