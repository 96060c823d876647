//! Error types for the backup engine

use std::path::PathBuf;

/// Result type alias for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Comprehensive error type for backup operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad or missing configuration values, missing source path
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Configuration file could not be read or parsed
    #[error("Configuration error at '{path}': {message}")]
    Config { path: PathBuf, message: String },

    /// Exclusion pattern did not compile
    #[error("Filter pattern error: {0}")]
    FilterPattern(String),

    /// Directory traversal failure while building tasks
    #[error("Directory walk error at '{path}': {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// Stat failure while probing source or destination
    #[error("Stat error at '{path}': {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checksum computation failure
    #[error("Checksum error for '{path}': {source}")]
    Checksum {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failure while transferring file content
    #[error("File copy error for '{path}': {message}")]
    Copy { path: PathBuf, message: String },

    /// A task kept failing after every retry attempt
    #[error("Failed after {attempts} attempt(s) for '{path}': {last_error}")]
    RetryExhausted {
        path: PathBuf,
        attempts: u32,
        last_error: Box<BackupError>,
    },

    /// Combined report of every task that exhausted its retries
    #[error("Backup completed with {} error(s):\n{}", .failures.len(), format_failures(.failures))]
    TasksFailed { failures: Vec<TaskFailure> },

    /// Version lifecycle misuse
    #[error("No backup version in progress")]
    NoActiveVersion,

    /// Version record could not be written
    #[error("Failed to persist version '{id}': {message}")]
    VersionPersist { id: String, message: String },

    /// Version history could not be read or parsed
    #[error("Failed to load version record '{path}': {message}")]
    VersionLoad { path: PathBuf, message: String },

    /// Version lookup miss
    #[error("Version not found: {0}")]
    VersionNotFound(String),

    /// Cancellation error
    #[error("Operation was cancelled")]
    Cancelled,
}

/// One task that failed after exhausting its retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Source path of the failed task
    pub source: PathBuf,
    /// Rendered final error
    pub error: String,
}

fn format_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .enumerate()
        .map(|(index, failure)| format!("{}. {}: {}", index + 1, failure.source.display(), failure.error))
        .collect::<Vec<_>>()
        .join("\n")
}

impl BackupError {
    /// Create a new validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new configuration file error
    pub fn config_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new stat error
    pub fn stat_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Stat {
            path: path.into(),
            source,
        }
    }

    /// Create a new checksum error
    pub fn checksum_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Checksum {
            path: path.into(),
            source,
        }
    }

    /// Create a new file copy error
    pub fn copy_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Copy {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new version persistence error
    pub fn persist_error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::VersionPersist {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create a new version load error
    pub fn load_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::VersionLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Errors that abort a whole run before any copying starts
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::Config { .. }
                | Self::FilterPattern(_)
                | Self::Walk { .. }
                | Self::VersionLoad { .. }
        )
    }

    /// Per-file errors the worker pool retries
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Stat { .. } | Self::Checksum { .. } | Self::Copy { .. } | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_failed_lists_every_failure() {
        let failures = (1..=3)
            .map(|i| TaskFailure {
                source: PathBuf::from(format!("docs/file{}.txt", i)),
                error: "disk full".to_string(),
            })
            .collect();

        let message = BackupError::TasksFailed { failures }.to_string();

        assert!(message.starts_with("Backup completed with 3 error(s)"));
        assert!(message.contains("1. docs/file1.txt: disk full"));
        assert!(message.contains("3. docs/file3.txt: disk full"));
    }

    #[test]
    fn test_error_classification() {
        let not_found = || std::io::Error::new(std::io::ErrorKind::NotFound, "gone");

        assert!(BackupError::validation("source_directory is empty").is_fatal());
        assert!(!BackupError::validation("x").is_retryable());
        assert!(BackupError::stat_error("a", not_found()).is_retryable());
        assert!(BackupError::checksum_error("a", not_found()).is_retryable());
        assert!(BackupError::copy_error("a", "short write").is_retryable());
        assert!(!BackupError::NoActiveVersion.is_retryable());
        assert!(!BackupError::Cancelled.is_fatal());
    }

    #[test]
    fn test_retry_exhausted_wraps_last_error() {
        let error = BackupError::RetryExhausted {
            path: PathBuf::from("a.txt"),
            attempts: 3,
            last_error: Box::new(BackupError::copy_error("a.txt", "permission denied")),
        };

        let message = error.to_string();
        assert!(message.contains("3 attempt(s)"));
        assert!(message.contains("permission denied"));
    }
}
