//! IPC client for talking to either Cortex daemon over its Unix socket,
//! with resurrection built into `call_resilient`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;

use crate::foundation::{ensure_daemon, is_connection_error, Ensure};

pub struct DaemonClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: BufWriter<tokio::net::unix::OwnedWriteHalf>,
    next_id: u64,
}

impl DaemonClient {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            next_id: 1,
        })
    }

    /// Send one JSON-RPC request and wait for the matching response line.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let req = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let data = serde_json::to_string(&req)?;
        self.writer.write_all(data.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
        }

        let resp: Value = serde_json::from_str(line.trim())?;
        if let Some(err) = resp.get("error") {
            let msg = err
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            anyhow::bail!("{}", msg);
        }
        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Read one more streamed notification/response line (for `StreamLogs`
    /// and `Initialize`). Returns `None` on EOF.
    pub async fn read_line(&mut self) -> Result<Option<Value>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim())?))
    }

    pub async fn is_alive(socket_path: &Path) -> bool {
        if !socket_path.exists() {
            return false;
        }
        match Self::connect(socket_path).await {
            Ok(mut client) => client.call("ping", json!({})).await.is_ok(),
            Err(_) => false,
        }
    }
}

/// Call `method` against the daemon at `socket_path`, resurrecting it at most
/// once if the initial connection attempt fails with a classified
/// connection-level error.
pub async fn call_resilient(
    socket_path: &Path,
    exe: PathBuf,
    start_args: Vec<String>,
    ensure_timeout: Duration,
    method: &str,
    params: Value,
) -> Result<Value> {
    match DaemonClient::connect(socket_path).await {
        Ok(mut client) => return client.call(method, params).await,
        Err(e) => {
            if !classify(&e) {
                return Err(e);
            }
        }
    }

    ensure_daemon(Ensure {
        socket: socket_path,
        exe,
        args: start_args,
        timeout: ensure_timeout,
    })
    .await?;

    let mut client = DaemonClient::connect(socket_path).await?;
    client.call(method, params).await
}

fn classify(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(is_connection_error)
        .unwrap_or(false)
}
