//! Backup configuration snapshot, file loading and validation

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::checksum::ChecksumAlgorithm;
use crate::error::{BackupError, Result};
use crate::filter::ExclusionFilter;

const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 32;
const MAX_RETRY_ATTEMPTS: u32 = 10;
const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);
const MIN_BUFFER_SIZE: usize = 4 * 1024;
const MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;
const MAX_TOTAL_BUFFER_SIZE: u64 = 1024 * 1024 * 1024;

/// Everything a backup run needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub source_directory: PathBuf,
    pub folders_to_backup: Vec<String>,
    pub target_directory: PathBuf,
    #[serde(default)]
    pub deep_duplicate_check: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
    #[serde(default)]
    pub options: RunOptions,
}

/// Run-mode flags, normally filled in from the command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            quiet: false,
            log_level: default_log_level(),
        }
    }
}

impl BackupConfig {
    /// Minimal configuration with defaults for everything optional
    pub fn new(
        source_directory: impl Into<PathBuf>,
        target_directory: impl Into<PathBuf>,
        folders_to_backup: Vec<String>,
    ) -> Self {
        Self {
            source_directory: source_directory.into(),
            folders_to_backup,
            target_directory: target_directory.into(),
            deep_duplicate_check: false,
            concurrency: default_concurrency(),
            buffer_size: default_buffer_size(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            exclude_patterns: Vec::new(),
            checksum_algorithm: ChecksumAlgorithm::default(),
            options: RunOptions::default(),
        }
    }

    /// Load a configuration file; the format is picked from the extension
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BackupError::config_error(path, format!("Failed to read file: {}", e)))?;

        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "json" => serde_json::from_str(content)
                .map_err(|e| BackupError::config_error(path, format!("Invalid JSON: {}", e))),
            "yaml" | "yml" => serde_yaml::from_str(content)
                .map_err(|e| BackupError::config_error(path, format!("Invalid YAML: {}", e))),
            other => Err(BackupError::config_error(
                path,
                format!("Unsupported format: '{}'", other),
            )),
        }
    }

    /// Check required values, limits and exclusion patterns
    pub fn validate(&self) -> Result<()> {
        if self.source_directory.as_os_str().is_empty() {
            return Err(BackupError::validation("source_directory is empty"));
        }
        if self.target_directory.as_os_str().is_empty() {
            return Err(BackupError::validation("target_directory is empty"));
        }
        if self.folders_to_backup.is_empty() {
            return Err(BackupError::validation("folders_to_backup is empty"));
        }
        if !self.source_directory.is_dir() {
            return Err(BackupError::validation(format!(
                "source directory does not exist: {}",
                self.source_directory.display()
            )));
        }

        self.validate_worker_settings()?;
        self.validate_resources();

        ExclusionFilter::new(&self.exclude_patterns)?;

        Ok(())
    }

    fn validate_worker_settings(&self) -> Result<()> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(BackupError::validation(format!(
                "concurrency must be between {} and {}, got {}",
                MIN_CONCURRENCY, MAX_CONCURRENCY, self.concurrency
            )));
        }

        if self.retry_attempts > MAX_RETRY_ATTEMPTS {
            return Err(BackupError::validation(format!(
                "retry attempts must be between 0 and {}, got {}",
                MAX_RETRY_ATTEMPTS, self.retry_attempts
            )));
        }

        if self.retry_delay < MIN_RETRY_DELAY || self.retry_delay > MAX_RETRY_DELAY {
            return Err(BackupError::validation(format!(
                "retry delay must be between {:?} and {:?}, got {:?}",
                MIN_RETRY_DELAY, MAX_RETRY_DELAY, self.retry_delay
            )));
        }

        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(BackupError::validation(format!(
                "buffer size must be between {} and {} bytes, got {}",
                MIN_BUFFER_SIZE, MAX_BUFFER_SIZE, self.buffer_size
            )));
        }

        let total_buffer = self.buffer_size as u64 * self.concurrency as u64;
        if total_buffer > MAX_TOTAL_BUFFER_SIZE {
            return Err(BackupError::validation(format!(
                "total buffer size ({} bytes) exceeds maximum allowed ({} bytes)",
                total_buffer, MAX_TOTAL_BUFFER_SIZE
            )));
        }

        Ok(())
    }

    fn validate_resources(&self) {
        let cpus = num_cpus::get();
        if self.concurrency > cpus * 2 {
            warn!(
                concurrency = self.concurrency,
                cpus,
                "Requested concurrency exceeds the recommended maximum of 2x CPU cores"
            );
        }
    }
}

// Default value functions
fn default_concurrency() -> usize { 4 }
fn default_buffer_size() -> usize { 32 * 1024 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_delay() -> Duration { Duration::from_secs(1) }
fn default_log_level() -> String { "info".to_string() }
