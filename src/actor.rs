//! Project Actor: one per registered project. Owns the writer handle
//! to the current branch database, the Branch Watcher, the File Watcher, and
//! a reference to the shared Embedding Client. All mutation happens inside
//! `run`'s single-task mailbox loop — no per-field locks are needed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cache::{self, CacheMetadata, EvictionPolicy};
use crate::chunker::{Chunk, Chunker};
use crate::config::ProjectConfig;
use crate::daemon::logs::{LogEntry, LogRing};
use crate::daemon::metrics::DaemonMetrics;
use crate::embedding::EmbeddingClient;
use crate::error::{CortexError, Result};
use crate::git::GitAdapter;
use crate::watch::{branch::parse_head, files::scan_directory, BranchWatcher, FileWatcher};

const EMBED_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct ProjectStatus {
    pub project_id: String,
    pub current_branch: String,
    pub phase: String,
    pub files_indexed: u64,
    pub chunks_embedded: u64,
    pub last_error: Option<String>,
}

enum Command {
    IndexFull(oneshot::Sender<Result<()>>),
    IndexHint(Vec<PathBuf>, oneshot::Sender<Result<()>>),
    RecordFileChanges(Vec<PathBuf>),
    OnBranchSwitch(String, String, oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<ProjectStatus>),
    Stop(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct ProjectActorHandle {
    tx: mpsc::Sender<Command>,
}

impl ProjectActorHandle {
    pub async fn index_full(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::IndexFull(tx)).await.map_err(channel_closed)?;
        rx.await.map_err(|_| CortexError::Unavailable("project actor stopped".into()))?
    }

    pub async fn index_hint(&self, paths: Vec<PathBuf>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::IndexHint(paths, tx)).await.map_err(channel_closed)?;
        rx.await.map_err(|_| CortexError::Unavailable("project actor stopped".into()))?
    }

    pub async fn record_file_changes(&self, paths: Vec<PathBuf>) -> Result<()> {
        self.tx
            .send(Command::RecordFileChanges(paths))
            .await
            .map_err(channel_closed)
    }

    pub async fn on_branch_switch(&self, old: String, new: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::OnBranchSwitch(old, new, tx))
            .await
            .map_err(channel_closed)?;
        rx.await.map_err(|_| CortexError::Unavailable("project actor stopped".into()))?
    }

    pub async fn status(&self) -> Result<ProjectStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Status(tx)).await.map_err(channel_closed)?;
        rx.await.map_err(|_| CortexError::Unavailable("project actor stopped".into()))
    }

    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Stop(tx)).await.map_err(channel_closed)?;
        let _ = rx.await;
        Ok(())
    }
}

fn channel_closed<T>(_: mpsc::error::SendError<T>) -> CortexError {
    CortexError::Unavailable("project actor mailbox closed".into())
}

/// Everything the actor needs at spawn time, gathered by the daemon server
/// (component H) when a project is registered.
pub struct ProjectActorConfig {
    pub project_id: String,
    pub worktree_root: PathBuf,
    pub cache_path: PathBuf,
    pub initial_branch: String,
    pub project_config: ProjectConfig,
    pub chunker: Arc<dyn Chunker>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub logs: Arc<LogRing>,
    pub metrics: Arc<DaemonMetrics>,
}

struct ActorState {
    project_id: String,
    worktree_root: PathBuf,
    cache_path: PathBuf,
    current_branch: String,
    db: crate::storage::sqlite::BranchDatabase,
    git: Option<GitAdapter>,
    config: ProjectConfig,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn EmbeddingClient>,
    logs: Arc<LogRing>,
    metrics: Arc<DaemonMetrics>,
    phase: String,
    files_indexed: AtomicU64,
    chunks_embedded: AtomicU64,
    last_error: Option<String>,
    pending: HashSet<PathBuf>,
}

impl ActorState {
    fn log(&self, level: &str, message: impl Into<String>) {
        self.logs.push(LogEntry {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            project: Some(self.project_id.clone()),
            level: level.to_string(),
            message: message.into(),
        });
    }

    fn status(&self) -> ProjectStatus {
        ProjectStatus {
            project_id: self.project_id.clone(),
            current_branch: self.current_branch.clone(),
            phase: self.phase.clone(),
            files_indexed: self.files_indexed.load(Ordering::Relaxed),
            chunks_embedded: self.chunks_embedded.load(Ordering::Relaxed),
            last_error: self.last_error.clone(),
        }
    }

    /// The indexing pipeline: discover, diff, chunk, write, embed, finalize.
    async fn run_index_cycle(&mut self, restrict_to: Option<&HashSet<PathBuf>>, cancel: &CancellationToken) -> Result<()> {
        self.phase = "discovering".to_string();

        let code_patterns = &self.config.paths.code;
        let extensions: Vec<String> = code_patterns
            .iter()
            .filter_map(|p| p.rsplit('.').next())
            .filter(|e| !e.contains('*'))
            .map(|e| e.to_string())
            .collect();

        let mut candidates: Vec<PathBuf> = if let Some(restrict) = restrict_to {
            restrict.iter().cloned().collect()
        } else {
            scan_directory(&self.worktree_root, &extensions, &self.config.paths.ignore)
        };
        candidates.sort();
        candidates.dedup();

        self.phase = "diffing".to_string();
        let mut indexed_count = 0u64;

        for path in &candidates {
            if cancel.is_cancelled() {
                return Err(CortexError::Cancelled);
            }

            let relative = path
                .strip_prefix(&self.worktree_root)
                .unwrap_or(path)
                .to_string_lossy()
                .to_string();

            let Ok(bytes) = tokio::fs::read(path).await else {
                self.log("warn", format!("skipping unreadable file {relative}"));
                continue;
            };
            let content_hash = blake3::hash(&bytes).to_hex().to_string();

            let existing = self.db.get_file(&relative).await.map_err(CortexError::from)?;
            if existing.as_ref().map(|f| f.content_hash.as_str()) == Some(content_hash.as_str()) {
                continue;
            }

            let Ok(content) = String::from_utf8(bytes.clone()) else {
                self.log("warn", format!("skipping non-utf8 file {relative}"));
                continue;
            };

            let chunks: Vec<Chunk> = self.chunker.chunk(&relative, &content);
            let metadata = tokio::fs::metadata(path).await.map_err(CortexError::from)?;
            let mtime_ns = metadata
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0);

            self.db
                .replace_file_chunks(&relative, &content_hash, bytes.len() as i64, mtime_ns, &chunks)
                .await
                .map_err(CortexError::from)?;
            indexed_count += 1;
        }

        // Files present in the DB but no longer on disk are removed.
        if restrict_to.is_none() {
            let tracked = self.db.all_files().await.map_err(CortexError::from)?;
            let live: HashSet<String> = candidates
                .iter()
                .map(|p| p.strip_prefix(&self.worktree_root).unwrap_or(p).to_string_lossy().to_string())
                .collect();
            for file in tracked {
                if !live.contains(&file.file_path) {
                    self.db.remove_file(&file.file_path).await.map_err(CortexError::from)?;
                }
            }
        }

        self.phase = "embedding".to_string();
        let expected_dim = self.config.embedding.dimensions as i64;
        let needing = self.db.chunks_needing_embedding(expected_dim).await.map_err(CortexError::from)?;
        let mut embedded_count = 0u64;

        for batch in needing.chunks(EMBED_BATCH_SIZE) {
            if cancel.is_cancelled() {
                return Err(CortexError::Cancelled);
            }
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self
                .embedder
                .embed(texts)
                .await
                .map_err(|e| CortexError::Embedding(e.to_string()))?;
            for (chunk, vector) in batch.iter().zip(vectors.iter()) {
                self.db
                    .write_embedding(&chunk.chunk_id, vector, expected_dim)
                    .await
                    .map_err(CortexError::from)?;
                embedded_count += 1;
            }
        }

        self.phase = "finalizing".to_string();
        self.files_indexed.fetch_add(indexed_count, Ordering::Relaxed);
        self.chunks_embedded.fetch_add(embedded_count, Ordering::Relaxed);

        let mut meta = cache::load_metadata(&self.cache_path)?;
        meta.touch(&self.current_branch);
        if let Some(entry) = meta.branches.get_mut(&self.current_branch) {
            entry.chunk_count = self.db.chunk_count().await.map_err(CortexError::from)? as u64;
            entry.size_mb = cache::branch_db_size_mb(&self.cache_path, &self.current_branch);
        }
        meta.recompute_total();

        if restrict_to.is_none() && self.config.storage.branch_cache_enabled {
            if let Some(git) = &self.git {
                let mut live_branches = git.list_branches();
                if !live_branches.iter().any(|b| b == &self.current_branch) {
                    live_branches.push(self.current_branch.clone());
                }
                let policy = EvictionPolicy {
                    max_age_days: self.config.storage.cache_max_age_days,
                    max_size_mb: self.config.storage.cache_max_size_mb,
                    protected_branches: &self.config.storage.protected_branches,
                    live_branches: &live_branches,
                };
                let evicted = cache::evict(&self.cache_path, &mut meta, &policy)?;
                self.metrics.record_eviction();
                if !evicted.is_empty() {
                    self.log("info", format!("evicted branch caches: {}", evicted.join(", ")));
                }
            }
        }

        cache::save_metadata(&self.cache_path, &meta)?;
        self.metrics.record_cycle(embedded_count);

        self.phase = "idle".to_string();
        self.log(
            "info",
            format!("indexed {indexed_count} files, embedded {embedded_count} chunks"),
        );
        Ok(())
    }

    /// Branch switch protocol: Pause/Resume balanced even on error.
    async fn handle_branch_switch(
        &mut self,
        old: &str,
        new: &str,
        file_watcher: &Option<FileWatcher>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(fw) = file_watcher {
            fw.pause();
        }

        let result = self.swap_database(new).await;

        if let Some(fw) = file_watcher {
            fw.resume();
        }

        result?;

        self.current_branch = new.to_string();
        let changed = self
            .git
            .as_ref()
            .map(|g| g.changed_files(old, new))
            .unwrap_or_default();
        let restrict: HashSet<PathBuf> = changed.into_iter().map(|p| self.worktree_root.join(p)).collect();
        if restrict.is_empty() {
            self.run_index_cycle(None, cancel).await
        } else {
            self.run_index_cycle(Some(&restrict), cancel).await
        }
    }

    async fn swap_database(&mut self, new_branch: &str) -> Result<()> {
        let known = self.git.as_ref().map(|g| g.list_branches()).unwrap_or_default();
        let db = if let Some(git) = &self.git {
            crate::sync::prepare_db(&self.cache_path, git, new_branch, &known)
                .await
                .map_err(CortexError::from)?
        } else {
            cache::open_database(&self.cache_path, new_branch, false)
                .await
                .map_err(CortexError::from)?
        };
        self.db = db;
        Ok(())
    }
}

/// Spawns the actor's mailbox loop and returns a cheap, cloneable handle.
pub fn spawn(cfg: ProjectActorConfig, db: crate::storage::sqlite::BranchDatabase) -> ProjectActorHandle {
    let (tx, mut rx) = mpsc::channel::<Command>(256);
    let cancel = CancellationToken::new();
    let inner_tx = tx.clone();

    tokio::spawn(async move {
        let tx = inner_tx;
        let git = GitAdapter::open(&cfg.worktree_root);
        let mut state = ActorState {
            project_id: cfg.project_id.clone(),
            worktree_root: cfg.worktree_root.clone(),
            cache_path: cfg.cache_path.clone(),
            current_branch: cfg.initial_branch.clone(),
            db,
            git,
            config: cfg.project_config,
            chunker: cfg.chunker,
            embedder: cfg.embedder,
            logs: cfg.logs,
            metrics: cfg.metrics,
            phase: "idle".to_string(),
            files_indexed: AtomicU64::new(0),
            chunks_embedded: AtomicU64::new(0),
            last_error: None,
            pending: HashSet::new(),
        };

        let file_watcher = start_file_watcher(&state.worktree_root, &tx);
        let branch_watcher = start_branch_watcher(&state.worktree_root, &tx);

        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::IndexFull(reply) => {
                    let result = state.run_index_cycle(None, &cancel).await;
                    if let Err(e) = &result {
                        state.last_error = Some(e.to_string());
                    }
                    let _ = reply.send(result);
                    drain_pending(&mut state, &cancel).await;
                }
                Command::IndexHint(paths, reply) => {
                    let restrict: HashSet<PathBuf> = paths.into_iter().collect();
                    let result = state.run_index_cycle(Some(&restrict), &cancel).await;
                    if let Err(e) = &result {
                        state.last_error = Some(e.to_string());
                    }
                    let _ = reply.send(result);
                    drain_pending(&mut state, &cancel).await;
                }
                Command::RecordFileChanges(paths) => {
                    state.pending.extend(paths);
                    drain_pending(&mut state, &cancel).await;
                }
                Command::OnBranchSwitch(old, new, reply) => {
                    let result = state.handle_branch_switch(&old, &new, &file_watcher, &cancel).await;
                    if let Err(e) = &result {
                        state.last_error = Some(e.to_string());
                    }
                    let _ = reply.send(result);
                }
                Command::Status(reply) => {
                    let _ = reply.send(state.status());
                }
                Command::Stop(reply) => {
                    cancel.cancel();
                    if let Some(fw) = file_watcher {
                        fw.stop().await;
                    }
                    if let Some(mut bw) = branch_watcher {
                        bw.stop().await;
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
    });

    ProjectActorHandle { tx }
}

/// Coalescing: after a cycle, if changes accumulated mid-cycle, run
/// one more cycle restricted to that pending set.
async fn drain_pending(state: &mut ActorState, cancel: &CancellationToken) {
    if state.pending.is_empty() {
        return;
    }
    let pending = std::mem::take(&mut state.pending);
    if let Err(e) = state.run_index_cycle(Some(&pending), cancel).await {
        state.last_error = Some(e.to_string());
    }
}

fn start_file_watcher(worktree_root: &Path, tx: &mpsc::Sender<Command>) -> Option<FileWatcher> {
    let tx = tx.clone();
    FileWatcher::start(worktree_root.to_path_buf(), Vec::new(), Arc::new(move |paths| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Command::RecordFileChanges(paths)).await;
        });
    }))
    .map_err(|e| tracing::warn!("failed to start file watcher: {e}"))
    .ok()
}

fn start_branch_watcher(worktree_root: &Path, tx: &mpsc::Sender<Command>) -> Option<BranchWatcher> {
    if GitAdapter::open(worktree_root).is_none() {
        return None;
    }
    let head_path = worktree_root.join(".git").join("HEAD");
    let last_known = std::fs::read_to_string(&head_path).ok().map(|s| parse_head(&s));
    let last_known = Arc::new(std::sync::Mutex::new(last_known));
    let tx = tx.clone();

    BranchWatcher::start(worktree_root.to_path_buf(), Arc::new(move |new_branch| {
        let mut guard = last_known.lock().unwrap();
        let old_branch = guard.clone().unwrap_or_default();
        if old_branch == new_branch {
            return;
        }
        *guard = Some(new_branch.clone());
        drop(guard);

        let tx = tx.clone();
        tokio::spawn(async move {
            let (reply_tx, _reply_rx) = oneshot::channel();
            let _ = tx.send(Command::OnBranchSwitch(old_branch, new_branch, reply_tx)).await;
        });
    }))
    .map_err(|e| tracing::warn!("failed to start branch watcher: {e}"))
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::LineChunker;

    struct NullEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingClient for NullEmbedder {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        fn dimensions(&self) -> usize {
            4
        }
    }

    #[tokio::test]
    async fn index_full_indexes_new_files_and_embeds_chunks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}\n").unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let db = cache::open_database(cache_dir.path(), "main", false).await.unwrap();

        let mut config = ProjectConfig::default();
        config.embedding.dimensions = 4;
        config.paths.code = vec!["**/*.rs".into()];

        let mut state = ActorState {
            project_id: "p1".into(),
            worktree_root: dir.path().to_path_buf(),
            cache_path: cache_dir.path().to_path_buf(),
            current_branch: "main".into(),
            db,
            git: None,
            config,
            chunker: Arc::new(LineChunker::default()),
            embedder: Arc::new(NullEmbedder),
            logs: Arc::new(LogRing::new()),
            metrics: Arc::new(DaemonMetrics::new()),
            phase: "idle".into(),
            files_indexed: AtomicU64::new(0),
            chunks_embedded: AtomicU64::new(0),
            last_error: None,
            pending: HashSet::new(),
        };

        let cancel = CancellationToken::new();
        state.run_index_cycle(None, &cancel).await.unwrap();

        assert_eq!(state.files_indexed.load(Ordering::Relaxed), 1);
        assert!(state.chunks_embedded.load(Ordering::Relaxed) >= 1);
    }
}
