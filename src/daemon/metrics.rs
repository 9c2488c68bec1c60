//! Lock-free runtime counters for the indexer daemon process.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct DaemonMetrics {
    /// Total projects registered (cumulative, across `Register` calls).
    pub projects_registered: AtomicU64,
    /// Total index cycles completed across all projects.
    pub cycles_run: AtomicU64,
    /// Total chunks sent to the embedding client.
    pub embeddings_issued: AtomicU64,
    /// Total cache-eviction passes run.
    pub eviction_runs: AtomicU64,
}

impl DaemonMetrics {
    pub fn new() -> Self {
        Self {
            projects_registered: AtomicU64::new(0),
            cycles_run: AtomicU64::new(0),
            embeddings_issued: AtomicU64::new(0),
            eviction_runs: AtomicU64::new(0),
        }
    }

    pub fn record_project_registered(&self) {
        self.projects_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle(&self, embeddings: u64) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        self.embeddings_issued.fetch_add(embeddings, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.eviction_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP cortex_projects_registered_total Total projects registered.\n\
             # TYPE cortex_projects_registered_total counter\n\
             cortex_projects_registered_total {}\n\
             # HELP cortex_cycles_run_total Total index cycles completed.\n\
             # TYPE cortex_cycles_run_total counter\n\
             cortex_cycles_run_total {}\n\
             # HELP cortex_embeddings_issued_total Total chunks sent for embedding.\n\
             # TYPE cortex_embeddings_issued_total counter\n\
             cortex_embeddings_issued_total {}\n\
             # HELP cortex_eviction_runs_total Total cache-eviction passes run.\n\
             # TYPE cortex_eviction_runs_total counter\n\
             cortex_eviction_runs_total {}\n",
            self.projects_registered.load(Ordering::Relaxed),
            self.cycles_run.load(Ordering::Relaxed),
            self.embeddings_issued.load(Ordering::Relaxed),
            self.eviction_runs.load(Ordering::Relaxed),
        )
    }
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_prometheus_reflects_recorded_counters() {
        let metrics = DaemonMetrics::new();
        metrics.record_project_registered();
        metrics.record_cycle(12);
        metrics.record_eviction();

        let body = metrics.to_prometheus();
        assert!(body.contains("cortex_projects_registered_total 1"));
        assert!(body.contains("cortex_cycles_run_total 1"));
        assert!(body.contains("cortex_embeddings_issued_total 12"));
        assert!(body.contains("cortex_eviction_runs_total 1"));
    }
}
