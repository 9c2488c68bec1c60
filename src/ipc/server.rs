//! Generic Unix-socket JSON-RPC accept loop shared by both Cortex daemons.
//!
//! Owns connection-level concerns (bounded concurrency, per-connection rate
//! limiting, idle timeout, batch requests, streaming writes) and delegates
//! request dispatch to a [`RequestHandler`] implementation per daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CortexError;
use crate::foundation::singleton::SingletonGuard;

use super::protocol::DaemonRequest;

const MAX_CONNECTIONS: usize = 256;
const RATE_LIMIT_PER_SEC: u32 = 100;
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-daemon request dispatch. `write_tx` lets a handler push extra lines
/// (notifications, streamed records) before or instead of its single return
/// value — used by `StreamLogs` and embedding `Initialize`.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: DaemonRequest, write_tx: mpsc::Sender<String>) -> Value;
}

/// Run the accept loop until `shutdown` is cancelled. Consumes the singleton
/// guard so the listener and lock live exactly as long as the server does.
pub async fn run<H: RequestHandler>(
    guard: SingletonGuard,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<()> {
    let connection_semaphore = Arc::new(tokio::sync::Semaphore::new(MAX_CONNECTIONS));

    loop {
        tokio::select! {
            result = guard.listener.accept() => {
                let (stream, _addr) = result?;
                let handler = handler.clone();
                let shutdown = shutdown.clone();

                let permit = match connection_semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("max connections reached ({MAX_CONNECTIONS}), rejecting connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handler, shutdown).await {
                        tracing::debug!("connection error: {e}");
                    }
                    drop(permit);
                });
            }
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested, stopping accept loop");
                break;
            }
        }
    }

    drop(guard);
    Ok(())
}

async fn handle_connection<H: RequestHandler>(
    stream: tokio::net::UnixStream,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = BufWriter::new(writer);
    let mut line = String::new();

    let (write_tx, mut write_rx) = mpsc::channel::<String>(64);

    let writer_handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(msg) = write_rx.recv().await {
            if (async {
                writer.write_all(msg.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            })
            .await
            .is_err()
            {
                break;
            }
        }
    });

    let mut window_start = tokio::time::Instant::now();
    let mut window_count: u32 = 0;

    loop {
        line.clear();

        let read_result = tokio::select! {
            r = tokio::time::timeout(IDLE_TIMEOUT, reader.read_line(&mut line)) => r,
            _ = shutdown.cancelled() => break,
        };

        let n = match read_result {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::debug!("connection idle timeout after {:?}", IDLE_TIMEOUT);
                break;
            }
        };
        if n == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let now = tokio::time::Instant::now();
        if now.duration_since(window_start).as_secs() >= 1 {
            window_start = now;
            window_count = 0;
        }
        window_count += 1;
        if window_count > RATE_LIMIT_PER_SEC {
            let resp = error_response(Value::Null, CortexError::Unavailable("rate limit exceeded".into()));
            let _ = write_tx.send(serde_json::to_string(&resp)?).await;
            continue;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(batch)) if !batch.is_empty() => {
                let mut handles = Vec::with_capacity(batch.len());
                for v in batch {
                    let handler = handler.clone();
                    let write_tx = write_tx.clone();
                    handles.push(tokio::spawn(async move {
                        match serde_json::from_value::<DaemonRequest>(v) {
                            Ok(req) => handler.handle(req, write_tx).await,
                            Err(e) => error_response(Value::Null, CortexError::ParseError(e.to_string())),
                        }
                    }));
                }
                let mut responses = Vec::with_capacity(handles.len());
                for h in handles {
                    if let Ok(resp) = h.await {
                        responses.push(resp);
                    }
                }
                let out = serde_json::to_string(&responses)?;
                let _ = write_tx.send(out).await;
            }
            Ok(_) => {
                let response = match serde_json::from_str::<DaemonRequest>(trimmed) {
                    Ok(req) => handler.handle(req, write_tx.clone()).await,
                    Err(e) => error_response(Value::Null, CortexError::ParseError(e.to_string())),
                };
                let out = serde_json::to_string(&response)?;
                let _ = write_tx.send(out).await;
            }
            Err(e) => {
                let resp = error_response(Value::Null, CortexError::ParseError(e.to_string()));
                let _ = write_tx.send(serde_json::to_string(&resp)?).await;
            }
        }
    }

    drop(write_tx);
    let _ = writer_handle.await;
    Ok(())
}

fn error_response(id: Value, err: CortexError) -> Value {
    serde_json::to_value(super::protocol::DaemonResponse::from_cortex_error(id, err))
        .unwrap_or(Value::Null)
}
