//! Streaming content checksums

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::error::{BackupError, Result};

/// Read buffer used when hashing a file on its own
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Hash algorithms supported for file checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ChecksumAlgorithm {
    /// SHA-256 hash
    #[default]
    Sha256,
    /// Blake3 hash (faster)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(BackupError::validation(format!(
                "unsupported checksum algorithm: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ChecksumAlgorithm {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Incremental hasher over either supported algorithm
pub enum ChecksumHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl ChecksumHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            ChecksumAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(data),
            Self::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    /// Consume the hasher and return the hex-encoded digest
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(hasher) => format!("{:x}", hasher.finalize()),
            Self::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        }
    }
}

/// Compute the checksum of a file, streaming it through a fixed buffer
pub async fn compute_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| BackupError::checksum_error(path, e))?;

    let mut hasher = ChecksumHasher::new(algorithm);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| BackupError::checksum_error(path, e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize_hex())
}
