//! Client-side counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Producer metrics collector.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub records_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub connections_created: AtomicU64,
    pub connections_failed: AtomicU64,
    pub metadata_refreshes: AtomicU64,
}

impl ClientMetrics {
    /// Record a successfully acknowledged produce call.
    pub fn record_send(&self, record_count: u64, byte_count: u64) {
        self.records_sent.fetch_add(record_count, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_metadata_refresh(&self) {
        self.metadata_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_sent: self.records_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            metadata_refreshes: self.metadata_refreshes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub records_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub connections_created: u64,
    pub connections_failed: u64,
    pub metadata_refreshes: u64,
}

static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<ClientMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(ClientMetrics::default()));

/// The process-wide metrics instance.
pub fn global_metrics() -> Arc<ClientMetrics> {
    GLOBAL_METRICS.clone()
}
