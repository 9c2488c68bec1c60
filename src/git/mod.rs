//! Git Adapter: a narrow, read-only facade over the repository.
//! A missing or corrupt repository yields a sentinel rather than failing the
//! caller — the actor treats that as "no ancestor available, do a full
//! discovery."

use std::path::{Path, PathBuf};

use git2::Repository;

pub const DETACHED_SENTINEL: &str = "detached";

pub struct GitAdapter {
    repo: Repository,
}

// `git2::Repository` wraps a raw libgit2 handle and is therefore `!Sync` by
// default. `GitAdapter` is only ever accessed from the single actor task
// that owns it (never shared across threads concurrently), so it is safe to
// assert `Sync` here to satisfy `tokio::spawn`'s `Send` requirement on the
// enclosing future.
unsafe impl Sync for GitAdapter {}

impl GitAdapter {
    /// `Repository::discover` walks up from `path` to find the enclosing
    /// worktree, so sub-directories and linked worktrees map to the same
    /// project identity.
    pub fn open(path: &Path) -> Option<Self> {
        Repository::discover(path).ok().map(|repo| Self { repo })
    }

    /// WorktreeRoot(path).
    pub fn worktree_root(&self) -> Option<PathBuf> {
        self.repo.workdir().map(|p| p.to_path_buf())
    }

    /// CurrentBranch(path). Sentinel `"detached"` on detached HEAD; empty
    /// string if HEAD cannot be resolved at all.
    pub fn current_branch(&self) -> String {
        match self.repo.head() {
            Ok(head) => {
                if head.is_branch() {
                    head.shorthand().unwrap_or_default().to_string()
                } else {
                    DETACHED_SENTINEL.to_string()
                }
            }
            Err(_) => String::new(),
        }
    }

    /// ListBranches(path).
    pub fn list_branches(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(branches) = self.repo.branches(Some(git2::BranchType::Local)) {
            for b in branches.flatten() {
                if let Ok(Some(name)) = b.0.name() {
                    names.push(name.to_string());
                }
            }
        }
        names
    }

    /// MergeBase(a, b) — newest common ancestor commit id, if any.
    pub fn merge_base(&self, a: &str, b: &str) -> Option<(git2::Oid, i64)> {
        let oid_a = self.resolve(a)?;
        let oid_b = self.resolve(b)?;
        let base = self.repo.merge_base(oid_a, oid_b).ok()?;
        let commit = self.repo.find_commit(base).ok()?;
        Some((base, commit.time().seconds()))
    }

    fn resolve(&self, refname: &str) -> Option<git2::Oid> {
        self.repo
            .revparse_single(refname)
            .ok()
            .map(|obj| obj.id())
    }

    /// ChangedFiles(fromRef, toRef) — paths that differ between two refs.
    /// Empty on any git error, per the "no ancestor, do a full discovery"
    /// contract.
    pub fn changed_files(&self, from_ref: &str, to_ref: &str) -> Vec<String> {
        let mut paths = Vec::new();
        let (Some(from_oid), Some(to_oid)) = (self.resolve(from_ref), self.resolve(to_ref)) else {
            return paths;
        };
        let (Ok(from_commit), Ok(to_commit)) =
            (self.repo.find_commit(from_oid), self.repo.find_commit(to_oid))
        else {
            return paths;
        };
        let (Ok(from_tree), Ok(to_tree)) = (from_commit.tree(), to_commit.tree()) else {
            return paths;
        };
        let Ok(diff) = self
            .repo
            .diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)
        else {
            return paths;
        };
        let _ = diff.foreach(
            &mut |delta, _| {
                if let Some(p) = delta.new_file().path() {
                    paths.push(p.to_string_lossy().to_string());
                }
                true
            },
            None,
            None,
            None,
        );
        paths
    }

    /// FileAtRef(path, ref) — file content at a given ref, relative to the
    /// worktree root.
    pub fn file_at_ref(&self, relative_path: &str, reference: &str) -> Option<Vec<u8>> {
        let oid = self.resolve(reference)?;
        let commit = self.repo.find_commit(oid).ok()?;
        let tree = commit.tree().ok()?;
        let entry = tree.get_path(Path::new(relative_path)).ok()?;
        let blob = entry.to_object(&self.repo).ok()?.peel_to_blob().ok()?;
        Some(blob.content().to_vec())
    }

    /// Current working-tree content hash for a file, used by the Branch
    /// Synchronizer's "unchanged" test.
    pub fn working_tree_hash(&self, absolute_path: &Path) -> Option<String> {
        let bytes = std::fs::read(absolute_path).ok()?;
        Some(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Fallback identity when no git repository is present: the canonical
/// lexical absolute path (falling back to the lexical absolute path
/// when git is unavailable").
pub fn lexical_identity(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Resolve the project's identity: the git worktree root when available,
/// else the lexical absolute path.
pub fn resolve_identity(path: &Path) -> PathBuf {
    GitAdapter::open(path)
        .and_then(|g| g.worktree_root())
        .unwrap_or_else(|| lexical_identity(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_repository_has_no_adapter() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GitAdapter::open(dir.path()).is_none());
    }

    #[test]
    fn identity_falls_back_to_lexical_path_without_git() {
        let dir = tempfile::tempdir().unwrap();
        let identity = resolve_identity(dir.path());
        assert_eq!(identity, lexical_identity(dir.path()));
    }
}
