//! Configuration source: built-in defaults, overlaid by an on-disk TOML file,
//! overlaid by `CORTEX_*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn cortex_home() -> PathBuf {
    dirs::home_dir()
        .expect("cannot determine home directory")
        .join(".cortex")
}

/// Global, process-wide settings: socket paths, timeouts, cache base directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub indexer_daemon: DaemonEndpoint,
    pub embed_daemon: DaemonEndpoint,
    pub cache_base_dir: PathBuf,
    pub ensure_timeout_secs: u64,
    pub embed_idle_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Address the indexer daemon's Prometheus `/metrics` endpoint binds to.
    /// `None` disables the endpoint.
    pub metrics_addr: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let home = cortex_home();
        Self {
            indexer_daemon: DaemonEndpoint {
                socket_path: home.join("indexer.sock"),
            },
            embed_daemon: DaemonEndpoint {
                socket_path: home.join("embed.sock"),
            },
            cache_base_dir: home.join("cache"),
            ensure_timeout_secs: 30,
            embed_idle_timeout_secs: 300,
            shutdown_grace_secs: 30,
            metrics_addr: Some("127.0.0.1:9090".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonEndpoint {
    pub socket_path: PathBuf,
}

impl Default for DaemonEndpoint {
    fn default() -> Self {
        Self {
            socket_path: cortex_home().join("daemon.sock"),
        }
    }
}

/// Per-project configuration: embedding provider, path globs, chunking and storage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub embedding: EmbeddingConfig,
    pub paths: PathsConfig,
    pub chunking: ChunkingConfig,
    pub storage: StorageConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            paths: PathsConfig::default(),
            chunking: ChunkingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "local" (embedding daemon via fastembed) or "cloud" (HTTPS endpoint).
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "BAAI/bge-small-en-v1.5".to_string(),
            dimensions: 384,
            endpoint: None,
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub code: Vec<String>,
    pub docs: Vec<String>,
    pub ignore: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            code: vec!["**/*.rs".into(), "**/*.go".into(), "**/*.ts".into(), "**/*.py".into()],
            docs: vec!["**/*.md".into()],
            ignore: vec![
                ".git/**".into(),
                "node_modules/**".into(),
                ".cortex/**".into(),
                "target/**".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub strategies: Vec<String>,
    pub doc_chunk_size: usize,
    pub code_chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategies: vec!["line".into()],
            doc_chunk_size: 800,
            code_chunk_size: 200,
            overlap: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_location: Option<PathBuf>,
    pub branch_cache_enabled: bool,
    pub cache_max_age_days: u32,
    pub cache_max_size_mb: f64,
    /// Branches that are never evicted, in addition to `main`/`master`.
    pub protected_branches: Vec<String>,
    /// Only "sqlite" is implemented.
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_location: None,
            branch_cache_enabled: true,
            cache_max_age_days: 30,
            cache_max_size_mb: 2048.0,
            protected_branches: Vec::new(),
            backend: "sqlite".to_string(),
        }
    }
}

/// Load the global config: defaults, overlaid by `~/.cortex/config.toml` if present,
/// overlaid by `CORTEX_*` environment variables (dot segments map to `_`).
pub fn load_global() -> anyhow::Result<GlobalConfig> {
    let mut cfg = GlobalConfig::default();
    let path = config_file_path();
    if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        cfg = toml::from_str(&text).map_err(|e| anyhow::anyhow!("invalid config at {}: {}", path.display(), e))?;
    }
    overlay_env(&mut cfg);
    Ok(cfg)
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(cortex_home)
        .join("cortex")
        .join("config.toml")
}

fn overlay_env(cfg: &mut GlobalConfig) {
    if let Ok(v) = std::env::var("CORTEX_INDEXER_DAEMON_SOCKET_PATH") {
        cfg.indexer_daemon.socket_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CORTEX_EMBED_DAEMON_SOCKET_PATH") {
        cfg.embed_daemon.socket_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CORTEX_CACHE_BASE_DIR") {
        cfg.cache_base_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CORTEX_ENSURE_TIMEOUT_SECS") {
        if let Ok(n) = v.parse() {
            cfg.ensure_timeout_secs = n;
        }
    }
    if let Ok(v) = std::env::var("CORTEX_EMBED_IDLE_TIMEOUT_SECS") {
        if let Ok(n) = v.parse() {
            cfg.embed_idle_timeout_secs = n;
        }
    }
    if let Ok(v) = std::env::var("CORTEX_SHUTDOWN_GRACE_SECS") {
        if let Ok(n) = v.parse() {
            cfg.shutdown_grace_secs = n;
        }
    }
    if let Ok(v) = std::env::var("CORTEX_METRICS_ADDR") {
        cfg.metrics_addr = if v.is_empty() { None } else { Some(v) };
    }
}

/// Load per-project config, looking for `<project>/.cortex/config.toml`; falls back to defaults.
pub fn load_project(project_root: &Path) -> anyhow::Result<ProjectConfig> {
    let path = project_root.join(".cortex").join("config.toml");
    let mut cfg = if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        toml::from_str(&text).map_err(|e| anyhow::anyhow!("invalid project config at {}: {}", path.display(), e))?
    } else {
        ProjectConfig::default()
    };
    if let Ok(v) = std::env::var("CORTEX_EMBEDDING_DIMENSIONS") {
        if let Ok(n) = v.parse() {
            cfg.embedding.dimensions = n;
        }
    }
    if let Ok(v) = std::env::var("CORTEX_EMBEDDING_PROVIDER") {
        cfg.embedding.provider = v;
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_sqlite_backend_only() {
        let cfg = ProjectConfig::default();
        assert_eq!(cfg.storage.backend, "sqlite");
    }

    #[test]
    fn default_embedding_dimensions_is_384() {
        let cfg = ProjectConfig::default();
        assert_eq!(cfg.embedding.dimensions, 384);
    }
}
