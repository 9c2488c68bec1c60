//! Project registry — persists the `identity -> ProjectRecord` mapping
//! (identity -> registration is idempotent) across restarts.
//!
//! The in-memory registry (actor handles, live counters) lives in
//! [`crate::daemon::state::DaemonState`]; this module is the durable half:
//! worktree identity, cache key, and the branch last seen at registration.

use std::path::Path;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ProjectRow {
    pub id: String,
    pub worktree_root: String,
    pub cache_key: String,
    pub current_branch: String,
    pub registered_at: i64,
    pub last_indexed_at: Option<i64>,
}

#[derive(Clone)]
pub struct RegistryDb {
    pool: SqlitePool,
}

impl RegistryDb {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations/registry").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Idempotent: returns the existing row's id unchanged if already
    /// registered (`registeredAt` never changes after the
    /// first call).
    pub async fn register(&self, worktree_root: &str, cache_key: &str, branch: &str) -> Result<ProjectRow> {
        if let Some(existing) = self.get_by_worktree_root(worktree_root).await? {
            return Ok(existing);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO projects (id, worktree_root, cache_key, current_branch, registered_at, last_indexed_at)
             VALUES (?, ?, ?, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(worktree_root)
        .bind(cache_key)
        .bind(branch)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ProjectRow {
            id,
            worktree_root: worktree_root.to_string(),
            cache_key: cache_key.to_string(),
            current_branch: branch.to_string(),
            registered_at: now,
            last_indexed_at: None,
        })
    }

    pub async fn get_by_worktree_root(&self, worktree_root: &str) -> Result<Option<ProjectRow>> {
        let row = sqlx::query(
            "SELECT id, worktree_root, cache_key, current_branch, registered_at, last_indexed_at
             FROM projects WHERE worktree_root = ?",
        )
        .bind(worktree_root)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(from_row))
    }

    pub async fn list(&self) -> Result<Vec<ProjectRow>> {
        let rows = sqlx::query(
            "SELECT id, worktree_root, cache_key, current_branch, registered_at, last_indexed_at
             FROM projects ORDER BY registered_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(from_row).collect())
    }

    pub async fn update_branch(&self, id: &str, branch: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET current_branch = ? WHERE id = ?")
            .bind(branch)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_indexed(&self, id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE projects SET last_indexed_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn from_row(r: sqlx::sqlite::SqliteRow) -> ProjectRow {
    ProjectRow {
        id: r.get("id"),
        worktree_root: r.get("worktree_root"),
        cache_key: r.get("cache_key"),
        current_branch: r.get("current_branch"),
        registered_at: r.get("registered_at"),
        last_indexed_at: r.get("last_indexed_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = RegistryDb::new(&dir.path().join("registry.db")).await.unwrap();
        let first = db.register("/repo", "abc123", "main").await.unwrap();
        let second = db.register("/repo", "abc123", "main").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.registered_at, second.registered_at);
        assert_eq!(db.list().await.unwrap().len(), 1);
    }
}
