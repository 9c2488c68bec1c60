//! Embedding Client: the interface the Project Actor embeds against,
//! with two implementations selected from config — `local` (talks to the
//! embedding daemon over its Unix socket) and `cloud` (a remote HTTPS
//! endpoint with an API key).

pub mod daemon;
pub mod local_backend;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::EmbeddingConfig;
use crate::error::{CortexError, Result};

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Idempotent: `local` ensures the embedding daemon is up and ready;
    /// `cloud` validates the endpoint is configured.
    async fn initialize(&self) -> Result<()>;

    /// Embeds texts, preserving order. Classified connection errors trigger
    /// one `Ensure`+retry internally (local mode only).
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;

    /// No-op for `local` — the daemon manages its own lifecycle via idle
    /// timeout.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Talks to the embedding daemon via the shared IPC foundation, resurrecting
/// it on demand.
pub struct LocalEmbeddingClient {
    socket_path: PathBuf,
    daemon_exe: PathBuf,
    ensure_timeout: Duration,
    dimensions: usize,
}

impl LocalEmbeddingClient {
    pub fn new(socket_path: PathBuf, daemon_exe: PathBuf, ensure_timeout: Duration, dimensions: usize) -> Self {
        Self {
            socket_path,
            daemon_exe,
            ensure_timeout,
            dimensions,
        }
    }

    fn start_args(&self) -> Vec<String> {
        vec!["__embed-daemon".to_string(), "--socket".to_string(), self.socket_path.display().to_string()]
    }
}

#[async_trait]
impl EmbeddingClient for LocalEmbeddingClient {
    async fn initialize(&self) -> Result<()> {
        crate::ipc::client::call_resilient(
            &self.socket_path,
            self.daemon_exe.clone(),
            self.start_args(),
            self.ensure_timeout,
            "initialize",
            json!({}),
        )
        .await
        .map(|_| ())
        .map_err(|e| CortexError::Unavailable(e.to_string()))
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let result = crate::ipc::client::call_resilient(
            &self.socket_path,
            self.daemon_exe.clone(),
            self.start_args(),
            self.ensure_timeout,
            "embed",
            json!({ "texts": texts }),
        )
        .await
        .map_err(|e| CortexError::Unavailable(e.to_string()))?;

        let vectors: Vec<Vec<f32>> = serde_json::from_value(
            result.get("vectors").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| CortexError::Internal(e.into()))?;
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Talks to a remote HTTPS embedding endpoint.
pub struct CloudEmbeddingClient {
    endpoint: String,
    api_key: String,
    dimensions: usize,
    http: reqwest::Client,
}

impl CloudEmbeddingClient {
    pub fn new(endpoint: String, api_key: String, dimensions: usize) -> Self {
        Self {
            endpoint,
            api_key,
            dimensions,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingClient for CloudEmbeddingClient {
    async fn initialize(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(CortexError::Config("cloud embedding endpoint is not configured".into()));
        }
        Ok(())
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "input": texts }))
            .send()
            .await
            .map_err(|e| CortexError::Unavailable(e.to_string()))?;

        let body: serde_json::Value = resp
            .error_for_status()
            .map_err(|e| CortexError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| CortexError::Internal(e.into()))?;

        let vectors: Vec<Vec<f32>> = serde_json::from_value(
            body.get("vectors").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| CortexError::Internal(e.into()))?;
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Builds the configured client for a project.
pub fn build_client(config: &EmbeddingConfig, global_socket: &Path, daemon_exe: &Path, ensure_timeout: Duration) -> Result<Box<dyn EmbeddingClient>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(LocalEmbeddingClient::new(
            global_socket.to_path_buf(),
            daemon_exe.to_path_buf(),
            ensure_timeout,
            config.dimensions,
        ))),
        "cloud" => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| CortexError::Config("cloud provider requires `embedding.endpoint`".into()))?;
            let api_key = config
                .api_key_env
                .as_ref()
                .and_then(|name| std::env::var(name).ok())
                .unwrap_or_default();
            Ok(Box::new(CloudEmbeddingClient::new(endpoint, api_key, config.dimensions)))
        }
        other => Err(CortexError::Config(format!("unknown embedding provider: {other}"))),
    }
}

#[derive(Debug, Clone)]
pub struct EmbedProgress {
    pub completed: usize,
    pub total: usize,
}

/// `EmbedWithProgress`: chunks `texts` into batches of `batch_size`,
/// preserves order in the flattened output, and emits a progress record
/// after each successful batch. Observes `cancel` between batches.
pub async fn embed_with_progress(
    client: &dyn EmbeddingClient,
    texts: Vec<String>,
    batch_size: usize,
    progress: Option<mpsc::Sender<EmbedProgress>>,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<Vec<Vec<f32>>> {
    let total = texts.len();
    let mut out = Vec::with_capacity(total);
    let mut completed = 0usize;

    for batch in texts.chunks(batch_size.max(1)) {
        if cancel.is_cancelled() {
            return Err(CortexError::Cancelled);
        }
        let vectors = client.embed(batch.to_vec()).await?;
        completed += vectors.len();
        out.extend(vectors);

        if let Some(tx) = &progress {
            let _ = tx.send(EmbedProgress { completed, total }).await;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeClient {
        dim: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EmbeddingClient for FakeClient {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(texts.iter().map(|_| vec![0.0_f32; self.dim]).collect())
        }
        fn dimensions(&self) -> usize {
            self.dim
        }
    }

    #[tokio::test]
    async fn embed_with_progress_preserves_order_and_batches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = FakeClient { dim: 4, calls: calls.clone() };
        let texts: Vec<String> = (0..10).map(|i| format!("text-{i}")).collect();
        let cancel = tokio_util::sync::CancellationToken::new();

        let vectors = embed_with_progress(&client, texts, 3, None, &cancel).await.unwrap();

        assert_eq!(vectors.len(), 10);
        assert_eq!(calls.load(Ordering::Relaxed), 4); // 3+3+3+1
    }

    #[tokio::test]
    async fn embed_with_progress_observes_cancellation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = FakeClient { dim: 4, calls };
        let texts: Vec<String> = (0..10).map(|i| format!("text-{i}")).collect();
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();

        let result = embed_with_progress(&client, texts, 3, None, &cancel).await;
        assert!(matches!(result, Err(CortexError::Cancelled)));
    }
}
