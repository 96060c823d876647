//! Exclusion filtering using globset

use std::ffi::OsStr;
use std::path::Path;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{BackupError, Result};

/// Exclusion patterns matched against entry base names
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    exclude_set: Option<GlobSet>,
    patterns: Vec<String>,
}

impl ExclusionFilter {
    /// Compile the given patterns once; fails on the first invalid glob
    pub fn new(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }

        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    BackupError::FilterPattern(format!("Failed to compile glob '{}': {}", pattern, e))
                })?;

            builder.add(glob);
        }

        let exclude_set = builder.build().map_err(|e| {
            BackupError::FilterPattern(format!("Failed to build globset: {}", e))
        })?;

        Ok(Self {
            exclude_set: Some(exclude_set),
            patterns: patterns.to_vec(),
        })
    }

    /// Check a single base name against the exclusion patterns
    pub fn is_excluded(&self, name: &OsStr) -> bool {
        match &self.exclude_set {
            Some(set) => set.is_match(Path::new(name)),
            None => false,
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.exclude_set.is_none()
    }
}
