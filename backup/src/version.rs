//! Append-only history of backup runs, one JSON record per run

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::error::{BackupError, Result};

/// Version records live in this directory under the target
pub const VERSIONS_DIR: &str = ".versions";

const VERSION_ID_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Metadata recorded for each copied or confirmed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Hex digest; absent when a skip was decided on size alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Run totals embedded in each version record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    pub total_files: usize,
    pub files_backed_up: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    /// Bytes of every copied or skipped file
    pub total_bytes: u64,
    /// Bytes actually written this run
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionStatus {
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionStatus::InProgress => write!(f, "In Progress"),
            VersionStatus::Completed => write!(f, "Completed"),
            VersionStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// One backup run: manifest, totals and the configuration it ran with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupVersion {
    pub id: String,
    pub timestamp: DateTime<Local>,
    pub files: BTreeMap<String, FileMetadata>,
    /// Sum of manifest file sizes
    pub size: u64,
    pub status: VersionStatus,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub stats: BackupStats,
    pub config_used: BackupConfig,
}

/// Loads, creates and persists version records
pub struct VersionManager {
    versions_dir: PathBuf,
    versions: Vec<BackupVersion>,
    current: Option<BackupVersion>,
    started: Option<Instant>,
}

impl VersionManager {
    /// Ensure the version directory exists under `target` and load its history.
    ///
    /// Any unreadable or unparsable record fails the whole load.
    pub async fn open<P: AsRef<Path>>(target: P) -> Result<Self> {
        let versions_dir = target.as_ref().join(VERSIONS_DIR);

        fs::create_dir_all(&versions_dir)
            .await
            .map_err(|e| BackupError::load_error(&versions_dir, format!("Failed to create directory: {}", e)))?;

        let versions = load_versions(&versions_dir).await?;

        info!(
            directory = %versions_dir.display(),
            versions = versions.len(),
            "Loaded version history"
        );

        Ok(Self {
            versions_dir,
            versions,
            current: None,
            started: None,
        })
    }

    /// Begin a new in-progress version and make it current
    pub fn start_new_version(&mut self, config: &BackupConfig) -> &BackupVersion {
        let timestamp = Local::now();
        let id = self.unique_id(timestamp.format(VERSION_ID_FORMAT).to_string());

        if let Some(previous) = &self.current {
            warn!(id = %previous.id, "Discarding unfinished version");
        }

        debug!(id = %id, "Starting new version");

        self.started = Some(Instant::now());
        self.current.insert(BackupVersion {
            id,
            timestamp,
            files: BTreeMap::new(),
            size: 0,
            status: VersionStatus::InProgress,
            duration: Duration::ZERO,
            stats: BackupStats::default(),
            config_used: config.clone(),
        })
    }

    fn unique_id(&self, base: String) -> String {
        let taken = |candidate: &str| {
            self.versions.iter().any(|v| v.id == candidate)
                || self.current.as_ref().is_some_and(|v| v.id == candidate)
                || self.versions_dir.join(format!("{}.json", candidate)).exists()
        };

        if !taken(&base) {
            return base;
        }

        let candidate = (2..)
            .map(|n| format!("{}-{:03}", base, n))
            .find(|candidate| !taken(candidate));
        candidate.unwrap_or(base)
    }

    /// Record one file in the current manifest
    pub fn add_file(&mut self, path: impl Into<String>, metadata: FileMetadata) -> Result<()> {
        let current = self.current.as_mut().ok_or(BackupError::NoActiveVersion)?;

        let size = metadata.size;
        if let Some(previous) = current.files.insert(path.into(), metadata) {
            current.size -= previous.size;
        }
        current.size += size;

        Ok(())
    }

    /// Finalize the current version as completed and persist it
    pub async fn complete_version(&mut self, stats: BackupStats) -> Result<BackupVersion> {
        self.finalize(VersionStatus::Completed, stats).await
    }

    /// Finalize the current version as failed and persist it
    pub async fn fail_version(&mut self, stats: BackupStats) -> Result<BackupVersion> {
        self.finalize(VersionStatus::Failed, stats).await
    }

    async fn finalize(&mut self, status: VersionStatus, stats: BackupStats) -> Result<BackupVersion> {
        let mut version = self.current.take().ok_or(BackupError::NoActiveVersion)?;

        version.status = status;
        version.stats = stats;
        version.duration = self
            .started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();

        self.persist(&version).await?;

        info!(
            id = %version.id,
            status = %version.status,
            files = version.files.len(),
            "Version saved"
        );

        self.versions.push(version.clone());
        Ok(version)
    }

    async fn persist(&self, version: &BackupVersion) -> Result<()> {
        fs::create_dir_all(&self.versions_dir)
            .await
            .map_err(|e| BackupError::persist_error(&version.id, format!("Failed to create directory: {}", e)))?;

        let json = serde_json::to_string_pretty(version)
            .map_err(|e| BackupError::persist_error(&version.id, format!("Failed to serialize: {}", e)))?;

        let path = self.version_path(&version.id);
        fs::write(&path, json)
            .await
            .map_err(|e| BackupError::persist_error(&version.id, format!("Failed to write '{}': {}", path.display(), e)))
    }

    pub fn version_path(&self, id: &str) -> PathBuf {
        self.versions_dir.join(format!("{}.json", id))
    }

    /// All finalized versions, oldest first
    pub fn versions(&self) -> &[BackupVersion] {
        &self.versions
    }

    pub fn version(&self, id: &str) -> Result<&BackupVersion> {
        self.versions
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| BackupError::VersionNotFound(id.to_string()))
    }

    pub fn latest_version(&self) -> Option<&BackupVersion> {
        self.versions.last()
    }

    /// The in-progress version, if a run is active
    pub fn current(&self) -> Option<&BackupVersion> {
        self.current.as_ref()
    }
}

async fn load_versions(dir: &Path) -> Result<Vec<BackupVersion>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::load_error(dir, e.to_string())),
    };

    let mut versions = Vec::new();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BackupError::load_error(dir, e.to_string()))?
    {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| BackupError::load_error(&path, e.to_string()))?;

        let version: BackupVersion = serde_json::from_str(&content)
            .map_err(|e| BackupError::load_error(&path, e.to_string()))?;

        versions.push(version);
    }

    versions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(temp_dir: &TempDir) -> BackupConfig {
        BackupConfig::new(
            temp_dir.path().join("source"),
            temp_dir.path().join("target"),
            vec!["docs".to_string()],
        )
    }

    fn metadata(path: &str, size: u64) -> FileMetadata {
        FileMetadata {
            path: PathBuf::from(path),
            size,
            modified: Utc::now(),
            checksum: Some("abc123".to_string()),
        }
    }

    #[tokio::test]
    async fn test_open_creates_directory_with_empty_history() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target");

        let manager = VersionManager::open(&target).await.unwrap();

        assert!(target.join(VERSIONS_DIR).is_dir());
        assert!(manager.versions().is_empty());
        assert!(manager.latest_version().is_none());
    }

    #[tokio::test]
    async fn test_full_lifecycle_persists_pretty_json() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        let mut manager = VersionManager::open(&config.target_directory).await.unwrap();

        let id = manager.start_new_version(&config).id.clone();
        assert_eq!(manager.current().unwrap().status, VersionStatus::InProgress);

        manager.add_file("/src/docs/a.txt", metadata("/src/docs/a.txt", 10)).unwrap();
        manager.add_file("/src/docs/b.txt", metadata("/src/docs/b.txt", 5)).unwrap();

        let stats = BackupStats {
            total_files: 2,
            files_backed_up: 2,
            total_bytes: 15,
            bytes_transferred: 15,
            ..Default::default()
        };
        let version = manager.complete_version(stats.clone()).await.unwrap();

        assert_eq!(version.id, id);
        assert_eq!(version.status, VersionStatus::Completed);
        assert_eq!(version.size, 15);
        assert_eq!(version.stats, stats);
        assert!(manager.current().is_none());

        let content = std::fs::read_to_string(manager.version_path(&id)).unwrap();
        assert!(content.starts_with("{\n  \"id\""));
        assert!(content.contains("\"status\": \"Completed\""));

        let parsed: BackupVersion = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, version);
    }

    #[tokio::test]
    async fn test_history_reloads_in_creation_order() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);

        let mut ids = Vec::new();
        {
            let mut manager = VersionManager::open(&config.target_directory).await.unwrap();
            for _ in 0..3 {
                ids.push(manager.start_new_version(&config).id.clone());
                manager.complete_version(BackupStats::default()).await.unwrap();
            }
        }

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);

        let manager = VersionManager::open(&config.target_directory).await.unwrap();
        let loaded: Vec<_> = manager.versions().iter().map(|v| v.id.clone()).collect();
        assert_eq!(loaded, ids);
        assert_eq!(manager.latest_version().unwrap().id, ids[2]);
        assert_eq!(manager.version(&ids[1]).unwrap().id, ids[1]);
    }

    #[tokio::test]
    async fn test_lifecycle_misuse() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = VersionManager::open(temp_dir.path()).await.unwrap();

        assert!(matches!(
            manager.complete_version(BackupStats::default()).await,
            Err(BackupError::NoActiveVersion)
        ));
        assert!(matches!(
            manager.add_file("x", metadata("x", 1)),
            Err(BackupError::NoActiveVersion)
        ));
        assert!(matches!(manager.version("nope"), Err(BackupError::VersionNotFound(_))));
    }

    #[tokio::test]
    async fn test_corrupt_record_fails_open() {
        let temp_dir = TempDir::new().unwrap();
        let versions_dir = temp_dir.path().join(VERSIONS_DIR);
        std::fs::create_dir_all(&versions_dir).unwrap();
        std::fs::write(versions_dir.join("20240101-000000.json"), "{ not json").unwrap();

        let result = VersionManager::open(temp_dir.path()).await;

        assert!(matches!(result, Err(BackupError::VersionLoad { .. })));
    }

    #[tokio::test]
    async fn test_re_adding_a_file_replaces_its_size() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        let mut manager = VersionManager::open(temp_dir.path()).await.unwrap();
        manager.start_new_version(&config);

        manager.add_file("a", metadata("a", 10)).unwrap();
        manager.add_file("a", metadata("a", 4)).unwrap();

        let current = manager.current().unwrap();
        assert_eq!(current.files.len(), 1);
        assert_eq!(current.size, 4);
    }

    #[tokio::test]
    async fn test_failed_version_is_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        let mut manager = VersionManager::open(temp_dir.path()).await.unwrap();
        manager.start_new_version(&config);

        let version = manager.fail_version(BackupStats::default()).await.unwrap();

        assert_eq!(version.status, VersionStatus::Failed);
        assert!(manager.version_path(&version.id).exists());
    }

    #[tokio::test]
    async fn test_colliding_ids_keep_creation_order() {
        let temp_dir = TempDir::new().unwrap();
        let manager = VersionManager::open(temp_dir.path()).await.unwrap();
        let base = "20240101-000000";

        let mut ids = Vec::new();
        for _ in 0..12 {
            let id = manager.unique_id(base.to_string());
            std::fs::write(manager.version_path(&id), "{}").unwrap();
            ids.push(id);
        }

        assert_eq!(ids[0], base);
        assert_eq!(ids[1], format!("{}-002", base));
        assert_eq!(ids[11], format!("{}-012", base));

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, ids);
    }

    #[tokio::test]
    async fn test_unwritable_version_directory_is_persist_error() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        let mut manager = VersionManager::open(temp_dir.path()).await.unwrap();
        manager.start_new_version(&config);
        manager.add_file("a", metadata("a", 3)).unwrap();

        let versions_dir = temp_dir.path().join(VERSIONS_DIR);
        std::fs::remove_dir_all(&versions_dir).unwrap();
        std::fs::write(&versions_dir, b"not a directory").unwrap();

        let result = manager.complete_version(BackupStats::default()).await;

        assert!(matches!(result, Err(BackupError::VersionPersist { .. })));
        assert!(manager.versions().is_empty());
    }
}
