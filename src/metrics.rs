use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters and per-shard gauges for a cluster.
///
/// Use `snapshot()` for a consistent point-in-time view, or the individual
/// getters for single values.
///
/// # Example
/// ```ignore
/// let metrics = cluster.metrics();
/// println!("Identifies: {}", metrics.identifies());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    payloads_received_total: AtomicU64,
    payloads_sent_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    zombie_connections_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    errors_total: AtomicU64,
    fatal_closes_total: AtomicU64,

    /// Per-shard metrics, keyed by shard id
    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone, Default)]
pub struct ShardMetrics {
    pub shard_id: u32,
    /// Whether the shard currently has an open socket
    pub is_connected: bool,
    /// Last sequence number seen
    pub sequence: u64,
    /// Last heartbeat round-trip
    pub latency: Option<Duration>,
    /// Duration since the last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Completed connection time, not counting the current connection
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
}

impl ShardMetrics {
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn payloads_received(&self) -> u64 {
        self.payloads_received_total.load(Ordering::Relaxed)
    }

    pub fn payloads_sent(&self) -> u64 {
        self.payloads_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    /// Connections dropped because a heartbeat went unacknowledged
    pub fn zombie_connections(&self) -> u64 {
        self.zombie_connections_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn fatal_closes(&self) -> u64 {
        self.fatal_closes_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_payload_received(&self) {
        self.payloads_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_payload_sent(&self) {
        self.payloads_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_zombie(&self) {
        self.zombie_connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fatal_close(&self) {
        self.fatal_closes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards.entry(shard_id).or_insert_with(|| ShardMetrics {
            shard_id,
            ..Default::default()
        });
        update_fn(entry);
    }

    /// Mark a shard connected and start its uptime clock
    pub(crate) fn shard_connected(&self, shard_id: u32) {
        self.update_shard(shard_id, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(Instant::now());
        });
    }

    /// Mark a shard disconnected, folding the finished connection into its uptime
    pub(crate) fn shard_disconnected(&self, shard_id: u32) {
        self.update_shard(shard_id, |s| {
            if s.is_connected {
                if let Some(at) = s.last_connected_at {
                    s.total_uptime += at.elapsed();
                }
            }
            s.is_connected = false;
        });
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            payloads_received_total: self.payloads_received_total.load(Ordering::Acquire),
            payloads_sent_total: self.payloads_sent_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            zombie_connections_total: self.zombie_connections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            fatal_closes_total: self.fatal_closes_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub payloads_received_total: u64,
    pub payloads_sent_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub zombie_connections_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub errors_total: u64,
    pub fatal_closes_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
