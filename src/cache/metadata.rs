//! CacheMetadata: one per project, stored in `<cachePath>/metadata`,
//! rewritten atomically via write-to-temp-and-rename after every mutation.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CortexError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BranchMetadata {
    pub last_accessed: Option<DateTime<Utc>>,
    pub size_mb: f64,
    pub chunk_count: u64,
    pub is_immortal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheMetadata {
    pub total_size_mb: f64,
    pub last_eviction: Option<DateTime<Utc>>,
    pub branches: HashMap<String, BranchMetadata>,
}

impl CacheMetadata {
    pub fn recompute_total(&mut self) {
        self.total_size_mb = self.branches.values().map(|b| b.size_mb).sum();
    }

    pub fn touch(&mut self, branch: &str) {
        self.branches
            .entry(branch.to_string())
            .or_default()
            .last_accessed = Some(Utc::now());
    }

    pub fn is_protected(&self, branch: &str, protect: &[String]) -> bool {
        branch == "main"
            || branch == "master"
            || protect.iter().any(|p| p == branch)
            || self.branches.get(branch).map(|b| b.is_immortal).unwrap_or(false)
    }
}

const METADATA_FILENAME: &str = "metadata";

pub fn load(cache_path: &Path) -> Result<CacheMetadata> {
    let path = cache_path.join(METADATA_FILENAME);
    if !path.exists() {
        return Ok(CacheMetadata::default());
    }
    let text = std::fs::read_to_string(&path)?;
    serde_json::from_str(&text).map_err(|e| CortexError::Internal(e.into()))
}

/// Atomic write-to-temp-and-rename so a crash never leaves a partial file.
pub fn save(cache_path: &Path, meta: &CacheMetadata) -> Result<()> {
    std::fs::create_dir_all(cache_path)?;
    let final_path = cache_path.join(METADATA_FILENAME);
    let tmp_path = cache_path.join(format!(".{METADATA_FILENAME}.tmp.{}", std::process::id()));
    let text = serde_json::to_string_pretty(meta).map_err(|e| CortexError::Internal(e.into()))?;
    std::fs::write(&tmp_path, text)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = CacheMetadata::default();
        meta.branches.insert(
            "main".into(),
            BranchMetadata {
                last_accessed: Some(Utc::now()),
                size_mb: 1.5,
                chunk_count: 10,
                is_immortal: true,
            },
        );
        meta.recompute_total();
        save(dir.path(), &meta).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.total_size_mb, 1.5);
        assert!(loaded.branches["main"].is_immortal);
    }

    #[test]
    fn missing_metadata_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.total_size_mb, 0.0);
    }

    #[test]
    fn protection_covers_main_master_and_immortal() {
        let mut meta = CacheMetadata::default();
        meta.branches.insert(
            "release".into(),
            BranchMetadata {
                is_immortal: true,
                ..Default::default()
            },
        );
        assert!(meta.is_protected("main", &[]));
        assert!(meta.is_protected("master", &[]));
        assert!(meta.is_protected("release", &[]));
        assert!(!meta.is_protected("feature-x", &[]));
        assert!(meta.is_protected("feature-x", &["feature-x".to_string()]));
    }
}
