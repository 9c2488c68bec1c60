//! Bounded in-memory log ring shared by the indexer daemon (
//! `StreamLogs`): one producer-visible ring, one broadcast channel per
//! subscriber, lossy on overflow.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const RING_CAPACITY: usize = 2000;
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_ms: i64,
    pub project: Option<String>,
    pub level: String,
    pub message: String,
}

/// Fan-out log ring: a bounded backlog plus a broadcast channel for live
/// subscribers. A subscriber that can't keep up sees a `"log subscriber
/// dropped"` marker rather than blocking the producer (
/// resources").
pub struct LogRing {
    backlog: Mutex<VecDeque<LogEntry>>,
    tx: broadcast::Sender<LogEntry>,
}

impl LogRing {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            backlog: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            tx,
        }
    }

    pub fn push(&self, entry: LogEntry) {
        {
            let mut backlog = self.backlog.lock().unwrap();
            if backlog.len() >= RING_CAPACITY {
                backlog.pop_front();
            }
            backlog.push_back(entry.clone());
        }
        // No receivers is the common case outside active `StreamLogs` calls.
        let _ = self.tx.send(entry);
    }

    pub fn backlog(&self, project_filter: Option<&str>) -> Vec<LogEntry> {
        self.backlog
            .lock()
            .unwrap()
            .iter()
            .filter(|e| project_filter.is_none_or(|p| e.project.as_deref() == Some(p)))
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

/// A tolerant per-subscriber read: resolves a broadcast lag into the
/// documented drop marker instead of propagating `RecvError::Lagged`.
pub async fn next_for_subscriber(rx: &mut broadcast::Receiver<LogEntry>) -> Option<LogEntry> {
    loop {
        match rx.recv().await {
            Ok(entry) => return Some(entry),
            Err(broadcast::error::RecvError::Lagged(_)) => {
                return Some(LogEntry {
                    timestamp_ms: 0,
                    project: None,
                    level: "warn".to_string(),
                    message: "log subscriber dropped".to_string(),
                });
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(project: &str, msg: &str) -> LogEntry {
        LogEntry {
            timestamp_ms: 0,
            project: Some(project.to_string()),
            level: "info".to_string(),
            message: msg.to_string(),
        }
    }

    #[test]
    fn backlog_filters_by_project() {
        let ring = LogRing::new();
        ring.push(entry("a", "one"));
        ring.push(entry("b", "two"));
        let filtered = ring.backlog(Some("a"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].message, "one");
    }

    #[test]
    fn backlog_caps_at_ring_capacity() {
        let ring = LogRing::new();
        for i in 0..(RING_CAPACITY + 10) {
            ring.push(entry("a", &format!("msg-{i}")));
        }
        assert_eq!(ring.backlog(None).len(), RING_CAPACITY);
    }

    #[tokio::test]
    async fn live_subscriber_receives_pushed_entries() {
        let ring = LogRing::new();
        let mut rx = ring.subscribe();
        ring.push(entry("a", "hello"));
        let received = next_for_subscriber(&mut rx).await.unwrap();
        assert_eq!(received.message, "hello");
    }
}
