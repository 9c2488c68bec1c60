//! In-memory half of the project registry: maps a
//! project id to its live [`crate::actor::ProjectActorHandle`] plus the
//! durable row from [`super::registry::RegistryDb`]. One `DaemonState` is
//! shared by every connection the indexer daemon accepts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::actor::{self, ProjectActorConfig, ProjectActorHandle, ProjectStatus};
use crate::cache;
use crate::chunker::{Chunker, LineChunker};
use crate::config::GlobalConfig;
use crate::daemon::logs::LogRing;
use crate::daemon::metrics::DaemonMetrics;
use crate::daemon::registry::{ProjectRow, RegistryDb};
use crate::embedding::{self, EmbeddingClient};
use crate::error::{CortexError, Result};
use crate::git;

/// A registered project: its durable row plus the live actor handle.
#[derive(Clone)]
pub struct ProjectEntry {
    pub row: ProjectRow,
    pub cache_path: std::path::PathBuf,
    pub actor: ProjectActorHandle,
}

pub struct DaemonState {
    pub global: GlobalConfig,
    pub registry: RegistryDb,
    pub logs: Arc<LogRing>,
    pub metrics: Arc<DaemonMetrics>,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
    projects: RwLock<HashMap<String, ProjectEntry>>,
    embedder: Arc<dyn EmbeddingClient>,
    chunker: Arc<dyn Chunker>,
    daemon_exe: std::path::PathBuf,
}

impl DaemonState {
    pub async fn new(global: GlobalConfig, daemon_exe: std::path::PathBuf) -> anyhow::Result<Self> {
        let registry_db_path = global.cache_base_dir.join("registry.db");
        let registry = RegistryDb::new(&registry_db_path).await?;

        let embedder: Arc<dyn EmbeddingClient> = Arc::from(embedding::build_client(
            &crate::config::EmbeddingConfig::default(),
            &global.embed_daemon.socket_path,
            &daemon_exe,
            std::time::Duration::from_secs(global.ensure_timeout_secs),
        )?);

        Ok(Self {
            global,
            registry,
            logs: Arc::new(LogRing::new()),
            metrics: Arc::new(DaemonMetrics::new()),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            projects: RwLock::new(HashMap::new()),
            embedder,
            chunker: Arc::new(LineChunker::default()),
            daemon_exe,
        })
    }

    /// `Register(path)`: idempotent. Resolves the
    /// project's identity, ensures its cache location, registers (or
    /// reattaches to) its durable row, and spawns a Project Actor if one
    /// isn't already running for it.
    pub async fn register_project(&self, path: &Path) -> Result<ProjectEntry> {
        let identity = git::resolve_identity(path);
        let worktree_root = git::GitAdapter::open(path)
            .and_then(|g| g.worktree_root())
            .unwrap_or_else(|| identity.clone());
        let current_branch = git::GitAdapter::open(path)
            .map(|g| g.current_branch())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "main".to_string());

        let cache_path = cache::ensure_location(&self.global.cache_base_dir, &identity)?;
        let cache_key = cache::cache_key(&cache_path);

        let row = self
            .registry
            .register(&worktree_root.to_string_lossy(), &cache_key, &current_branch)
            .await
            .map_err(CortexError::Internal)?;

        let mut projects = self.projects.write().await;
        if let Some(existing) = projects.get(&row.id) {
            return Ok(existing.clone());
        }

        let project_config = crate::config::load_project(&worktree_root).map_err(CortexError::Internal)?;
        let db = cache::open_database(&cache_path, &row.current_branch, false)
            .await
            .map_err(CortexError::from)?;

        let actor_handle = actor::spawn(
            ProjectActorConfig {
                project_id: row.id.clone(),
                worktree_root: worktree_root.clone(),
                cache_path: cache_path.clone(),
                initial_branch: row.current_branch.clone(),
                project_config,
                chunker: self.chunker.clone(),
                embedder: self.embedder.clone(),
                logs: self.logs.clone(),
                metrics: self.metrics.clone(),
            },
            db,
        );

        let entry = ProjectEntry {
            row: row.clone(),
            cache_path,
            actor: actor_handle,
        };
        projects.insert(row.id.clone(), entry.clone());
        self.metrics.record_project_registered();
        Ok(entry)
    }

    pub async fn get_project(&self, id: &str) -> Result<ProjectEntry> {
        self.projects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CortexError::ProjectNotFound(id.to_string()))
    }

    /// Resolves either a project id or a filesystem path to its entry,
    /// registering the project on first use (most RPCs take `path`).
    pub async fn resolve_project(&self, path_or_id: &str) -> Result<ProjectEntry> {
        if let Ok(entry) = self.get_project(path_or_id).await {
            return Ok(entry);
        }
        self.register_project(Path::new(path_or_id)).await
    }

    pub async fn project_status(&self, id: &str) -> Result<ProjectStatus> {
        let entry = self.get_project(id).await?;
        entry.actor.status().await
    }

    pub async fn list_projects(&self) -> Vec<ProjectEntry> {
        self.projects.read().await.values().cloned().collect()
    }

    pub fn daemon_exe(&self) -> &Path {
        &self.daemon_exe
    }

    /// Shutdown protocol: stop every actor, bounded by the caller's
    /// grace period.
    pub async fn stop_all_projects(&self) {
        let projects = self.projects.read().await;
        for entry in projects.values() {
            let _ = entry.actor.stop().await;
        }
    }
}
