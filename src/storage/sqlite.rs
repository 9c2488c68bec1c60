//! BranchDatabase: one embedded relational store per branch per
//! project, file `branches/<branch>.db`.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;

use crate::chunker::Chunk;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct FileRow {
    pub file_path: String,
    pub content_hash: String,
    pub size: i64,
    pub mtime_ns: i64,
    pub last_indexed_at: i64,
}

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub file_path: String,
    pub kind: String,
    pub content: String,
    pub content_hash: String,
    pub start_line: i64,
    pub end_line: i64,
    pub symbol: Option<String>,
    pub embedding: Option<Vec<u8>>,
    pub embedding_dim: Option<i64>,
}

/// Read-write or read-only handle to one branch's database file (
/// "Database handle").
pub struct BranchDatabase {
    pool: SqlitePool,
}

impl BranchDatabase {
    pub async fn open(path: &Path, readonly: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(!readonly)
            .read_only(readonly)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(if readonly { 4 } else { 1 })
            .connect_with(opts)
            .await?;

        if !readonly {
            sqlx::query("PRAGMA cache_size = -16000").execute(&pool).await?;
            sqlx::query("PRAGMA mmap_size = 268435456").execute(&pool).await?;
            sqlx::migrate!("./migrations/branch").run(&pool).await?;
        }

        Ok(Self { pool })
    }

    pub async fn get_file(&self, file_path: &str) -> Result<Option<FileRow>> {
        let row = sqlx::query(
            "SELECT file_path, content_hash, size, mtime_ns, last_indexed_at FROM files WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| FileRow {
            file_path: r.get("file_path"),
            content_hash: r.get("content_hash"),
            size: r.get("size"),
            mtime_ns: r.get("mtime_ns"),
            last_indexed_at: r.get("last_indexed_at"),
        }))
    }

    pub async fn all_files(&self) -> Result<Vec<FileRow>> {
        let rows = sqlx::query("SELECT file_path, content_hash, size, mtime_ns, last_indexed_at FROM files")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| FileRow {
                file_path: r.get("file_path"),
                content_hash: r.get("content_hash"),
                size: r.get("size"),
                mtime_ns: r.get("mtime_ns"),
                last_indexed_at: r.get("last_indexed_at"),
            })
            .collect())
    }

    /// One write transaction per file: delete old
    /// chunks, insert new ones, update the `files` row. Atomic — a crash
    /// mid-write leaves the previous state intact.
    pub async fn replace_file_chunks(
        &self,
        file_path: &str,
        content_hash: &str,
        size: i64,
        mtime_ns: i64,
        chunks: &[Chunk],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO files (file_path, content_hash, size, mtime_ns, last_indexed_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(file_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size = excluded.size,
                mtime_ns = excluded.mtime_ns,
                last_indexed_at = excluded.last_indexed_at",
        )
        .bind(file_path)
        .bind(content_hash)
        .bind(size)
        .bind(mtime_ns)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE file_path = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (chunk_id, file_path, kind, content, content_hash, start_line, end_line, symbol, embedding, embedding_dim)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)",
            )
            .bind(&chunk.chunk_id)
            .bind(file_path)
            .bind(chunk.kind.as_str())
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(chunk.start_line as i64)
            .bind(chunk.end_line as i64)
            .bind(&chunk.symbol)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_file(&self, file_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Chunks missing an embedding, or whose stored dimension no longer
    /// matches `expected_dim`.
    pub async fn chunks_needing_embedding(&self, expected_dim: i64) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            "SELECT chunk_id, file_path, kind, content, content_hash, start_line, end_line, symbol, embedding, embedding_dim
             FROM chunks WHERE embedding IS NULL OR embedding_dim IS NULL OR embedding_dim != ?",
        )
        .bind(expected_dim)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    pub async fn write_embedding(&self, chunk_id: &str, embedding: &[f32], dim: i64) -> Result<()> {
        let bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
        sqlx::query("UPDATE chunks SET embedding = ?, embedding_dim = ? WHERE chunk_id = ?")
            .bind(bytes)
            .bind(dim)
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn chunk_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM chunks").fetch_one(&self.pool).await?;
        Ok(row.get("n"))
    }

    pub async fn file_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM files").fetch_one(&self.pool).await?;
        Ok(row.get("n"))
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.file_count().await? == 0)
    }

    /// Fetch a file's chunk rows, for the Branch Synchronizer's ancestor copy.
    pub async fn chunks_for_file(&self, file_path: &str) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            "SELECT chunk_id, file_path, kind, content, content_hash, start_line, end_line, symbol, embedding, embedding_dim
             FROM chunks WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    /// Insert a file row and its chunk rows verbatim — used to seed a fresh
    /// branch database from an ancestor. Preserves `chunk_id`.
    pub async fn seed_file(&self, file: &FileRow, chunks: &[ChunkRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO files (file_path, content_hash, size, mtime_ns, last_indexed_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(file_path) DO NOTHING",
        )
        .bind(&file.file_path)
        .bind(&file.content_hash)
        .bind(file.size)
        .bind(file.mtime_ns)
        .bind(file.last_indexed_at)
        .execute(&mut *tx)
        .await?;

        for c in chunks {
            sqlx::query(
                "INSERT INTO chunks (chunk_id, file_path, kind, content, content_hash, start_line, end_line, symbol, embedding, embedding_dim)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(chunk_id) DO NOTHING",
            )
            .bind(&c.chunk_id)
            .bind(&c.file_path)
            .bind(&c.kind)
            .bind(&c.content)
            .bind(&c.content_hash)
            .bind(c.start_line)
            .bind(c.end_line)
            .bind(&c.symbol)
            .bind(&c.embedding)
            .bind(c.embedding_dim)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn row_to_chunk(r: sqlx::sqlite::SqliteRow) -> ChunkRow {
    ChunkRow {
        chunk_id: r.get("chunk_id"),
        file_path: r.get("file_path"),
        kind: r.get("kind"),
        content: r.get("content"),
        content_hash: r.get("content_hash"),
        start_line: r.get("start_line"),
        end_line: r.get("end_line"),
        symbol: r.get("symbol"),
        embedding: r.get("embedding"),
        embedding_dim: r.get("embedding_dim"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkKind;

    #[tokio::test]
    async fn replace_file_chunks_is_transactional() {
        let dir = tempfile::tempdir().unwrap();
        let db = BranchDatabase::open(&dir.path().join("main.db"), false).await.unwrap();
        let chunks = vec![Chunk {
            chunk_id: "c1".into(),
            file_path: "a.rs".into(),
            kind: ChunkKind::Code,
            content: "fn main() {}".into(),
            content_hash: "h1".into(),
            start_line: 1,
            end_line: 1,
            symbol: None,
        }];
        db.replace_file_chunks("a.rs", "h1", 12, 0, &chunks).await.unwrap();
        assert_eq!(db.chunk_count().await.unwrap(), 1);
        assert_eq!(db.file_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn chunks_needing_embedding_reflects_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let db = BranchDatabase::open(&dir.path().join("main.db"), false).await.unwrap();
        let chunks = vec![Chunk {
            chunk_id: "c1".into(),
            file_path: "a.rs".into(),
            kind: ChunkKind::Code,
            content: "x".into(),
            content_hash: "h1".into(),
            start_line: 1,
            end_line: 1,
            symbol: None,
        }];
        db.replace_file_chunks("a.rs", "h1", 1, 0, &chunks).await.unwrap();
        db.write_embedding("c1", &[0.1, 0.2], 2).await.unwrap();
        assert!(db.chunks_needing_embedding(2).await.unwrap().is_empty());
        assert_eq!(db.chunks_needing_embedding(384).await.unwrap().len(), 1);
    }
}
