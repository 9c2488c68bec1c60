//! Branch Synchronizer: when a project switches to a branch with no
//! existing branch database, seed the new database from the best available
//! ancestor rather than starting from a cold, empty index.

use std::collections::HashMap;
use std::path::Path;

use crate::cache;
use crate::error::Result;
use crate::git::GitAdapter;
use crate::storage::sqlite::BranchDatabase;

/// `PrepareDB(newBranch)`: if `newBranch` already has a database, this is a
/// no-op. Otherwise every other branch with an existing database is a
/// candidate ancestor; the one with the newest merge-base commit wins, ties
/// broken by branch name ascending.
pub async fn prepare_db(
    cache_path: &Path,
    git: &GitAdapter,
    new_branch: &str,
    known_branches: &[String],
) -> Result<BranchDatabase> {
    let db = cache::open_database(cache_path, new_branch, false).await?;
    if !db.is_empty().await? {
        return Ok(db);
    }

    let Some(ancestor_branch) = pick_ancestor(git, new_branch, known_branches) else {
        return Ok(db);
    };

    let ancestor_db = cache::open_database(cache_path, &ancestor_branch, true).await?;
    copy_unchanged_chunks(git, &ancestor_db, &db, new_branch).await?;
    Ok(db)
}

/// Picks the best ancestor branch: the one whose merge-base with
/// `new_branch` has the newest commit timestamp. Branches with no common
/// ancestor (or that the git adapter can't resolve) are skipped.
fn pick_ancestor(git: &GitAdapter, new_branch: &str, known_branches: &[String]) -> Option<String> {
    let mut best: Option<(String, i64)> = None;
    for candidate in known_branches {
        if candidate == new_branch {
            continue;
        }
        let Some((_, timestamp)) = git.merge_base(new_branch, candidate) else {
            continue;
        };
        best = match best {
            None => Some((candidate.clone(), timestamp)),
            Some((best_branch, best_ts)) => {
                if timestamp > best_ts || (timestamp == best_ts && *candidate < best_branch) {
                    Some((candidate.clone(), timestamp))
                } else {
                    Some((best_branch, best_ts))
                }
            }
        };
    }
    best.map(|(branch, _)| branch)
}

/// Copies chunk rows for files whose working-tree content hash still
/// matches the ancestor's stored content hash — those chunks (and their
/// embeddings, if already computed) carry over untouched; everything else
/// is left for the indexing pipeline to (re)compute from scratch.
async fn copy_unchanged_chunks(
    git: &GitAdapter,
    ancestor: &BranchDatabase,
    target: &BranchDatabase,
    new_branch: &str,
) -> Result<()> {
    let worktree_root = git.worktree_root();
    let mut seeded_by_hash: HashMap<String, bool> = HashMap::new();

    for file in ancestor.all_files().await? {
        let current_hash = worktree_root
            .as_ref()
            .and_then(|root| git.working_tree_hash(&root.join(&file.file_path)));

        let Some(current_hash) = current_hash else {
            continue;
        };
        if current_hash != file.content_hash {
            continue;
        }

        let chunks = ancestor.chunks_for_file(&file.file_path).await?;
        target.seed_file(&file, &chunks).await?;
        seeded_by_hash.insert(file.file_path.clone(), true);
    }

    tracing::info!(
        branch = new_branch,
        seeded_files = seeded_by_hash.len(),
        "seeded new branch database from ancestor"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_tie_breaks_on_branch_name() {
        // pick_ancestor needs a real GitAdapter, so the tie-break arithmetic
        // itself is exercised directly here.
        let candidates = vec![("feature-b".to_string(), 100i64), ("feature-a".to_string(), 100i64)];
        let mut best: Option<(String, i64)> = None;
        for (candidate, timestamp) in candidates {
            best = match best {
                None => Some((candidate, timestamp)),
                Some((best_branch, best_ts)) => {
                    if timestamp > best_ts || (timestamp == best_ts && candidate < best_branch) {
                        Some((candidate, timestamp))
                    } else {
                        Some((best_branch, best_ts))
                    }
                }
            };
        }
        assert_eq!(best.unwrap().0, "feature-a");
    }

    #[tokio::test]
    async fn prepare_db_is_noop_when_branch_already_has_data() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path();
        std::fs::create_dir_all(cache_path.join("branches")).unwrap();

        let db = cache::open_database(cache_path, "main", false).await.unwrap();
        let chunk = crate::chunker::Chunk {
            chunk_id: "c1".into(),
            file_path: "a.rs".into(),
            kind: crate::chunker::ChunkKind::Code,
            content: "fn main(){}".into(),
            content_hash: "h1".into(),
            start_line: 1,
            end_line: 1,
            symbol: None,
        };
        db.replace_file_chunks("a.rs", "h1", 10, 0, &[chunk]).await.unwrap();
        drop(db);

        // No git repository here, so `prepare_db` can't be exercised
        // end-to-end without one; this test only documents the empty-db
        // short-circuit via `is_empty`.
        let reopened = cache::open_database(cache_path, "main", true).await.unwrap();
        assert!(!reopened.is_empty().await.unwrap());
    }
}
