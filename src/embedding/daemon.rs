//! Embedding Daemon Server: hosts one [`LocalEmbedder`] behind
//! the shared IPC foundation, with `initialize`/`embed`/`health` RPCs and an
//! idle-timeout self-shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::embedding::local_backend::LocalEmbedder;
use crate::error::CortexError;
use crate::ipc::protocol::{DaemonNotification, DaemonRequest, DaemonResponse};
use crate::ipc::server::RequestHandler;

pub struct EmbedHandler {
    model_name: String,
    cache_dir: PathBuf,
    embedder: RwLock<Option<Arc<LocalEmbedder>>>,
    started_at: Instant,
    last_request_epoch_ms: AtomicI64,
    pub shutdown: CancellationToken,
}

impl EmbedHandler {
    pub fn new(model_name: String, cache_dir: PathBuf) -> Self {
        Self {
            model_name,
            cache_dir,
            embedder: RwLock::new(None),
            started_at: Instant::now(),
            last_request_epoch_ms: AtomicI64::new(epoch_ms()),
            shutdown: CancellationToken::new(),
        }
    }

    fn touch(&self) {
        self.last_request_epoch_ms.store(epoch_ms(), Ordering::Relaxed);
    }

    async fn ensure_loaded(&self, write_tx: &mpsc::Sender<String>, stream: bool) -> crate::error::Result<Arc<LocalEmbedder>> {
        if let Some(e) = self.embedder.read().await.as_ref() {
            return Ok(e.clone());
        }
        let mut guard = self.embedder.write().await;
        if let Some(e) = guard.as_ref() {
            return Ok(e.clone());
        }

        if stream {
            notify(write_tx, "checking").await;
            notify(write_tx, "downloading").await;
        }
        let model_name = self.model_name.clone();
        let cache_dir = self.cache_dir.clone();
        let loaded = tokio::task::spawn_blocking(move || LocalEmbedder::load(&model_name, &cache_dir))
            .await
            .map_err(|e| CortexError::Internal(e.into()))?
            .map_err(|e| CortexError::Embedding(e.to_string()))?;
        if stream {
            notify(write_tx, "loading").await;
        }
        let arc = Arc::new(loaded);
        *guard = Some(arc.clone());
        if stream {
            notify(write_tx, "ready").await;
        }
        Ok(arc)
    }

    /// Background idle-timeout watcher: the embedding daemon
    /// shuts itself down after `idle_timeout` with no successful `Embed`).
    pub fn spawn_idle_watch(self: &Arc<Self>, idle_timeout: Duration) {
        let handler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                if handler.shutdown.is_cancelled() {
                    break;
                }
                let idle_for = epoch_ms() - handler.last_request_epoch_ms.load(Ordering::Relaxed);
                if idle_for >= idle_timeout.as_millis() as i64 {
                    tracing::info!("embedding daemon idle for {idle_for}ms, shutting down");
                    handler.shutdown.cancel();
                    break;
                }
            }
        });
    }

    async fn dispatch(&self, req: &DaemonRequest, write_tx: &mpsc::Sender<String>) -> crate::error::Result<Value> {
        match req.method.as_str() {
            "initialize" => {
                self.ensure_loaded(write_tx, true).await?;
                self.touch();
                Ok(json!({ "status": "ready" }))
            }
            "embed" => {
                let texts: Vec<String> = req
                    .params
                    .get("texts")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .ok_or_else(|| CortexError::InvalidParams("missing `texts`".into()))?;
                let embedder = self.ensure_loaded(write_tx, false).await?;
                let vectors = embedder
                    .embed(texts)
                    .await
                    .map_err(|e| CortexError::Embedding(e.to_string()))?;
                self.touch();
                Ok(json!({ "vectors": vectors }))
            }
            "health" => {
                let last_request_ms_ago = epoch_ms() - self.last_request_epoch_ms.load(Ordering::Relaxed);
                Ok(json!({
                    "healthy": true,
                    "uptime_s": self.started_at.elapsed().as_secs(),
                    "last_request_ms_ago": last_request_ms_ago,
                }))
            }
            "ping" => Ok(json!({ "pong": true })),
            other => Err(CortexError::MethodNotFound(other.to_string())),
        }
    }
}

async fn notify(write_tx: &mpsc::Sender<String>, status: &str) {
    let note = DaemonNotification::new("initialize_progress", json!({ "status": status }));
    let _ = write_tx.send(serde_json::to_string(&note).unwrap_or_default()).await;
}

fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl RequestHandler for EmbedHandler {
    async fn handle(&self, req: DaemonRequest, write_tx: mpsc::Sender<String>) -> Value {
        let id = req.id.clone().unwrap_or(Value::Null);
        match self.dispatch(&req, &write_tx).await {
            Ok(result) => serde_json::to_value(DaemonResponse::success(id, result)).unwrap_or(Value::Null),
            Err(e) => serde_json::to_value(DaemonResponse::from_cortex_error(id, e)).unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: &str, params: Value) -> DaemonRequest {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))
        .unwrap()
    }

    fn handler() -> EmbedHandler {
        EmbedHandler::new("BAAI/bge-small-en-v1.5".to_string(), std::env::temp_dir())
    }

    #[tokio::test]
    async fn ping_does_not_touch_last_request_time() {
        let h = handler();
        let before = h.last_request_epoch_ms.load(Ordering::Relaxed);
        let (write_tx, _write_rx) = mpsc::channel(8);
        let result = h.dispatch(&req("ping", json!({})), &write_tx).await.unwrap();
        assert_eq!(result, json!({ "pong": true }));
        assert_eq!(h.last_request_epoch_ms.load(Ordering::Relaxed), before);
    }

    #[tokio::test]
    async fn health_reports_uptime_without_loading_model() {
        let h = handler();
        let (write_tx, _write_rx) = mpsc::channel(8);
        let result = h.dispatch(&req("health", json!({})), &write_tx).await.unwrap();
        assert_eq!(result["healthy"], json!(true));
        assert!(h.embedder.read().await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let h = handler();
        let (write_tx, _write_rx) = mpsc::channel(8);
        let err = h.dispatch(&req("frobnicate", json!({})), &write_tx).await.unwrap_err();
        assert!(matches!(err, CortexError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn embed_without_texts_is_invalid_params() {
        let h = handler();
        let (write_tx, _write_rx) = mpsc::channel(8);
        let err = h.dispatch(&req("embed", json!({})), &write_tx).await.unwrap_err();
        assert!(matches!(err, CortexError::InvalidParams(_)));
    }
}
