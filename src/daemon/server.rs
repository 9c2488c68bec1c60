//! Indexer Daemon Server: RPC dispatch — `register`, `index`,
//! `status`, `stream_logs`, `shutdown` — on top of the shared accept loop.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::daemon::logs::next_for_subscriber;
use crate::daemon::state::DaemonState;
use crate::error::CortexError;
use crate::ipc::protocol::{DaemonNotification, DaemonRequest, DaemonResponse};
use crate::ipc::server::RequestHandler;

pub struct IndexerHandler {
    state: Arc<DaemonState>,
}

impl IndexerHandler {
    pub fn new(state: Arc<DaemonState>) -> Self {
        Self { state }
    }

    async fn dispatch(&self, req: &DaemonRequest, write_tx: &mpsc::Sender<String>) -> crate::error::Result<Value> {
        match req.method.as_str() {
            "register" => {
                let path = req
                    .project_path()
                    .ok_or_else(|| CortexError::InvalidParams("missing `path`".into()))?;
                let entry = self.state.register_project(&PathBuf::from(path)).await?;
                entry.actor.index_full().await?;
                Ok(json!({
                    "project_id": entry.row.id,
                    "worktree_root": entry.row.worktree_root,
                    "current_branch": entry.row.current_branch,
                }))
            }
            "index" => {
                let path = req
                    .project_path()
                    .ok_or_else(|| CortexError::InvalidParams("missing `path`".into()))?;
                let entry = self.state.resolve_project(path).await?;
                let paths: Vec<PathBuf> = req
                    .params
                    .get("paths")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str())
                            .map(PathBuf::from)
                            .collect()
                    })
                    .unwrap_or_default();
                if paths.is_empty() {
                    entry.actor.index_full().await?;
                } else {
                    entry.actor.index_hint(paths).await?;
                }
                self.state.registry.mark_indexed(&entry.row.id).await.map_err(CortexError::Internal)?;
                Ok(json!({ "project_id": entry.row.id }))
            }
            "status" => {
                let path = req
                    .project_path()
                    .ok_or_else(|| CortexError::InvalidParams("missing `path`".into()))?;
                let entry = self.state.resolve_project(path).await?;
                let status = entry.actor.status().await?;
                Ok(json!({
                    "project_id": status.project_id,
                    "current_branch": status.current_branch,
                    "phase": status.phase,
                    "files_indexed": status.files_indexed,
                    "chunks_embedded": status.chunks_embedded,
                    "last_error": status.last_error,
                }))
            }
            "stream_logs" => {
                let project_filter = req.params.get("project").and_then(|v| v.as_str()).map(str::to_string);
                let follow = req.params.get("follow").and_then(|v| v.as_bool()).unwrap_or(true);
                for entry in self.state.logs.backlog(project_filter.as_deref()) {
                    let note = DaemonNotification::new("log", serde_json::to_value(&entry).unwrap_or(Value::Null));
                    if write_tx.send(serde_json::to_string(&note).unwrap_or_default()).await.is_err() {
                        return Ok(Value::Null);
                    }
                }
                if !follow {
                    return Ok(Value::Null);
                }
                let mut rx = self.state.logs.subscribe();
                while let Some(entry) = next_for_subscriber(&mut rx).await {
                    if let Some(filter) = &project_filter {
                        if entry.project.as_deref() != Some(filter.as_str()) {
                            continue;
                        }
                    }
                    let note = DaemonNotification::new("log", serde_json::to_value(&entry).unwrap_or(Value::Null));
                    if write_tx.send(serde_json::to_string(&note).unwrap_or_default()).await.is_err() {
                        break;
                    }
                }
                Ok(Value::Null)
            }
            "shutdown" => {
                let state = self.state.clone();
                tokio::spawn(async move {
                    state.stop_all_projects().await;
                    state.shutdown.cancel();
                });
                Ok(json!({ "acknowledged": true }))
            }
            "ping" => Ok(json!({ "pong": true })),
            other => Err(CortexError::MethodNotFound(other.to_string())),
        }
    }
}

#[async_trait]
impl RequestHandler for IndexerHandler {
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
    use crate::config::GlobalConfig;

    fn req(method: &str, params: Value) -> DaemonRequest {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))
        .unwrap()
    }

    async fn handler(tmp: &tempfile::TempDir) -> IndexerHandler {
        let global = GlobalConfig {
            cache_base_dir: tmp.path().to_path_buf(),
            ..GlobalConfig::default()
        };
        let state = Arc::new(DaemonState::new(global, PathBuf::from("/bin/true")).await.unwrap());
        IndexerHandler::new(state)
    }

    #[tokio::test]
    async fn ping_is_answered_without_touching_projects() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(&tmp).await;
        let (write_tx, _write_rx) = mpsc::channel(8);
        let result = h.dispatch(&req("ping", json!({})), &write_tx).await.unwrap();
        assert_eq!(result, json!({ "pong": true }));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(&tmp).await;
        let (write_tx, _write_rx) = mpsc::channel(8);
        let err = h.dispatch(&req("frobnicate", json!({})), &write_tx).await.unwrap_err();
        assert!(matches!(err, CortexError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn status_without_path_is_invalid_params() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(&tmp).await;
        let (write_tx, _write_rx) = mpsc::channel(8);
        let err = h.dispatch(&req("status", json!({})), &write_tx).await.unwrap_err();
        assert!(matches!(err, CortexError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn stream_logs_without_follow_returns_after_backlog() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(&tmp).await;
        let (write_tx, mut write_rx) = mpsc::channel(8);

        let dispatched = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            h.dispatch(&req("stream_logs", json!({ "follow": false })), &write_tx),
        )
        .await;

        assert!(dispatched.is_ok(), "stream_logs with follow=false must return once the backlog is drained");
        drop(write_tx);
        assert!(write_rx.recv().await.is_none());
    }
}
