//! Cache Store: maps a project identity to its on-disk cache
//! directory, hands out branch database handles, and evicts branch caches
//! under size/age pressure.

pub mod metadata;

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::storage::sqlite::BranchDatabase;

pub use metadata::{BranchMetadata, CacheMetadata};

/// Sanitizes a branch name into a filesystem-safe component — branch names
/// may contain `/` (e.g. `feature/x`), which cannot appear in a single path
/// segment.
fn sanitize_branch(branch: &str) -> String {
    branch.replace('/', "__")
}

/// `EnsureLocation(projectIdentity)` — deterministic cache directory under
/// `cache_base_dir`, keyed by a content hash of the project's identity path
/// so the same worktree always resolves to the same cache directory.
pub fn ensure_location(cache_base_dir: &Path, project_identity: &Path) -> std::io::Result<PathBuf> {
    let key = blake3::hash(project_identity.to_string_lossy().as_bytes()).to_hex().to_string();
    let path = cache_base_dir.join(&key[..16]);
    std::fs::create_dir_all(path.join("branches"))?;
    Ok(path)
}

pub fn cache_key(cache_path: &Path) -> String {
    cache_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn branch_db_path(cache_path: &Path, branch: &str) -> PathBuf {
    cache_path.join("branches").join(format!("{}.db", sanitize_branch(branch)))
}

/// Size on disk of a branch's database, in megabytes, including its
/// `-wal`/`-shm` sidecars — the figure `BranchMetadata.size_mb` tracks.
pub fn branch_db_size_mb(cache_path: &Path, branch: &str) -> f64 {
    let base = branch_db_path(cache_path, branch);
    let mut bytes = 0u64;
    for path in [
        base.clone(),
        PathBuf::from(format!("{}-wal", base.display())),
        PathBuf::from(format!("{}-shm", base.display())),
    ] {
        if let Ok(meta) = std::fs::metadata(&path) {
            bytes += meta.len();
        }
    }
    bytes as f64 / 1_000_000.0
}

/// `OpenDatabase(cachePath, branch)` — opens (creating and migrating, when
/// writable) the branch's database file.
pub async fn open_database(cache_path: &Path, branch: &str, readonly: bool) -> crate::storage::sqlite::Result<BranchDatabase> {
    BranchDatabase::open(&branch_db_path(cache_path, branch), readonly).await
}

pub fn load_metadata(cache_path: &Path) -> Result<CacheMetadata> {
    metadata::load(cache_path)
}

pub fn save_metadata(cache_path: &Path, meta: &CacheMetadata) -> Result<()> {
    metadata::save(cache_path, meta)
}

/// Eviction policy knobs, sourced from [`crate::config::StorageConfig`].
pub struct EvictionPolicy<'a> {
    pub max_age_days: u32,
    pub max_size_mb: f64,
    pub protected_branches: &'a [String],
    /// Branches git currently knows about; anything else is "stale" (the
    /// branch was deleted or renamed out from under the cache).
    pub live_branches: &'a [String],
}

/// `Evict(policy)`: three ordered passes — stale branches first
/// (deleted in git), then branches past the age limit, then, if still over
/// budget, the least-recently-accessed branches until back under budget.
/// Protected branches (`main`/`master`/explicitly configured/immortal) are
/// never evicted.
pub fn evict(cache_path: &Path, meta: &mut CacheMetadata, policy: &EvictionPolicy<'_>) -> Result<Vec<String>> {
    let mut evicted = Vec::new();
    let now = chrono::Utc::now();

    let candidates: Vec<String> = meta.branches.keys().cloned().collect();

    // Pass 1: stale — branch no longer exists in git.
    for branch in &candidates {
        if meta.is_protected(branch, policy.protected_branches) {
            continue;
        }
        if !policy.live_branches.iter().any(|b| b == branch) {
            remove_branch(cache_path, meta, branch)?;
            evicted.push(branch.clone());
        }
    }

    // Pass 2: age.
    let max_age = chrono::Duration::days(policy.max_age_days as i64);
    for branch in meta.branches.keys().cloned().collect::<Vec<_>>() {
        if meta.is_protected(&branch, policy.protected_branches) {
            continue;
        }
        let Some(last_accessed) = meta.branches.get(&branch).and_then(|b| b.last_accessed) else {
            continue;
        };
        if now - last_accessed > max_age {
            remove_branch(cache_path, meta, &branch)?;
            evicted.push(branch);
        }
    }

    // Pass 3: size, evicting least-recently-accessed first, until under budget.
    meta.recompute_total();
    if meta.total_size_mb > policy.max_size_mb {
        let mut by_lru: Vec<(String, Option<chrono::DateTime<chrono::Utc>>)> = meta
            .branches
            .iter()
            .filter(|(b, _)| !meta.is_protected(b, policy.protected_branches))
            .map(|(b, m)| (b.clone(), m.last_accessed))
            .collect();
        by_lru.sort_by_key(|(_, ts)| *ts);

        for (branch, _) in by_lru {
            if meta.total_size_mb <= policy.max_size_mb {
                break;
            }
            remove_branch(cache_path, meta, &branch)?;
            evicted.push(branch);
            meta.recompute_total();
        }
    }

    meta.recompute_total();
    meta.last_eviction = Some(now);
    Ok(evicted)
}

fn remove_branch(cache_path: &Path, meta: &mut CacheMetadata, branch: &str) -> Result<()> {
    let path = branch_db_path(cache_path, branch);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(format!("{}-wal", path.display()));
    let _ = std::fs::remove_file(format!("{}-shm", path.display()));
    meta.branches.remove(branch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_location_is_stable_for_the_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Path::new("/home/user/project");
        let a = ensure_location(dir.path(), identity).unwrap();
        let b = ensure_location(dir.path(), identity).unwrap();
        assert_eq!(a, b);
        assert!(a.join("branches").is_dir());
    }

    #[test]
    fn different_identities_map_to_different_locations() {
        let dir = tempfile::tempdir().unwrap();
        let a = ensure_location(dir.path(), Path::new("/home/user/a")).unwrap();
        let b = ensure_location(dir.path(), Path::new("/home/user/b")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn eviction_removes_stale_branches_but_protects_main() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = ensure_location(dir.path(), Path::new("/home/user/project")).unwrap();

        let mut meta = CacheMetadata::default();
        meta.branches.insert("main".into(), BranchMetadata::default());
        meta.branches.insert("old-feature".into(), BranchMetadata::default());
        std::fs::write(branch_db_path(&cache_path, "old-feature"), b"x").unwrap();

        let policy = EvictionPolicy {
            max_age_days: 30,
            max_size_mb: 2048.0,
            protected_branches: &[],
            live_branches: &["main".to_string()],
        };
        let evicted = evict(&cache_path, &mut meta, &policy).unwrap();

        assert_eq!(evicted, vec!["old-feature".to_string()]);
        assert!(meta.branches.contains_key("main"));
        assert!(!branch_db_path(&cache_path, "old-feature").exists());
    }

    #[test]
    fn eviction_by_size_removes_least_recently_accessed_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = ensure_location(dir.path(), Path::new("/home/user/project")).unwrap();

        let mut meta = CacheMetadata::default();
        meta.branches.insert(
            "older".into(),
            BranchMetadata {
                last_accessed: Some(chrono::Utc::now() - chrono::Duration::days(5)),
                size_mb: 600.0,
                ..Default::default()
            },
        );
        meta.branches.insert(
            "newer".into(),
            BranchMetadata {
                last_accessed: Some(chrono::Utc::now()),
                size_mb: 600.0,
                ..Default::default()
            },
        );

        let policy = EvictionPolicy {
            max_age_days: 3650,
            max_size_mb: 700.0,
            protected_branches: &[],
            live_branches: &["older".to_string(), "newer".to_string()],
        };
        let evicted = evict(&cache_path, &mut meta, &policy).unwrap();

        assert_eq!(evicted, vec!["older".to_string()]);
        assert!(meta.branches.contains_key("newer"));
    }
}
