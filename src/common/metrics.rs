//! Prometheus-compatible metrics for the consensus engine, transactions and fallback
//!
//! - Commit latency histogram
//! - Election, replication and commit counters
//! - Fallback transition and merge counters
//! - Term / commit index gauges

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for commit latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 10] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

/// Fixed-bucket histogram
#[derive(Debug)]
pub struct Histogram {
    boundaries: &'static [f64],
    /// One slot per boundary plus the +Inf slot
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            boundaries: &LATENCY_BUCKETS,
            buckets: (0..=LATENCY_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a duration
    pub fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let slot = self
            .boundaries
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(upper bound, count)` pairs, ending with +Inf
    pub fn cumulative_buckets(&self) -> Vec<(f64, u64)> {
        let mut total = 0;
        self.boundaries
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(&self.buckets)
            .map(|(bound, n)| {
                total += n.load(Ordering::Relaxed);
                (bound, total)
            })
            .collect()
    }

    /// Sum of observations in milliseconds
    pub fn sum_ms(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-value gauge
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide metrics
#[derive(Debug)]
pub struct MetricsRegistry {
    // Consensus
    pub elections_started: Counter,
    pub leaderships_won: Counter,
    pub append_rejections: Counter,
    pub entries_committed: Counter,
    pub snapshots_installed: Counter,
    pub current_term: Gauge,
    pub commit_index: Gauge,

    // Transactions
    pub transactions_committed: Counter,
    pub transaction_conflicts: Counter,
    pub commit_timeouts: Counter,
    pub commit_latency: Histogram,

    // Fallback
    pub fallback_transitions: Counter,
    pub merges_failed: Counter,
    pub standalone_mode: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            elections_started: Counter::default(),
            leaderships_won: Counter::default(),
            append_rejections: Counter::default(),
            entries_committed: Counter::default(),
            snapshots_installed: Counter::default(),
            current_term: Gauge::default(),
            commit_index: Gauge::default(),
            transactions_committed: Counter::default(),
            transaction_conflicts: Counter::default(),
            commit_timeouts: Counter::default(),
            commit_latency: Histogram::new(),
            fallback_transitions: Counter::default(),
            merges_failed: Counter::default(),
            standalone_mode: Gauge::default(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 11] = [
            ("elections_started_total", "Elections started by this node", &self.elections_started),
            ("leaderships_won_total", "Elections won by this node", &self.leaderships_won),
            ("append_rejections_total", "AppendEntries rejected by followers", &self.append_rejections),
            ("entries_committed_total", "Log entries applied to the state machine", &self.entries_committed),
            ("snapshots_installed_total", "Snapshots installed into the log store", &self.snapshots_installed),
            ("transactions_committed_total", "Transactions committed", &self.transactions_committed),
            ("transaction_conflicts_total", "Transactions rejected by conflict detection", &self.transaction_conflicts),
            ("commit_timeouts_total", "Commits with indeterminate outcome", &self.commit_timeouts),
            ("fallback_transitions_total", "Switches between replicated and standalone", &self.fallback_transitions),
            ("merges_failed_total", "Failed fallback merges", &self.merges_failed),
            ("uptime_seconds", "Process uptime in seconds", &Counter(AtomicU64::new(self.uptime_seconds()))),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP quorumkv_{name} {help}");
            let _ = writeln!(out, "# TYPE quorumkv_{name} counter");
            let _ = writeln!(out, "quorumkv_{name} {}", counter.get());
        }

        let gauges: [(&str, &str, &Gauge); 3] = [
            ("current_term", "Current Raft term", &self.current_term),
            ("commit_index", "Highest committed log index", &self.commit_index),
            ("standalone_mode", "1 while running against the standalone store", &self.standalone_mode),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP quorumkv_{name} {help}");
            let _ = writeln!(out, "# TYPE quorumkv_{name} gauge");
            let _ = writeln!(out, "quorumkv_{name} {}", gauge.get());
        }

        out.push_str("# HELP quorumkv_commit_duration_ms Commit latency in milliseconds\n");
        out.push_str("# TYPE quorumkv_commit_duration_ms histogram\n");
        for (le, count) in self.commit_latency.cumulative_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "quorumkv_commit_duration_ms_bucket{{le=\"+Inf\"}} {count}");
            } else {
                let _ = writeln!(out, "quorumkv_commit_duration_ms_bucket{{le=\"{le}\"}} {count}");
            }
        }
        let _ = writeln!(out, "quorumkv_commit_duration_ms_sum {}", self.commit_latency.sum_ms());
        let _ = writeln!(out, "quorumkv_commit_duration_ms_count {}", self.commit_latency.count());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(Duration::from_millis(3));
        hist.observe(Duration::from_millis(40));
        hist.observe(Duration::from_secs(60));

        assert_eq!(hist.count(), 3);
        let buckets = hist.cumulative_buckets();
        assert_eq!(buckets.len(), LATENCY_BUCKETS.len() + 1);
        assert_eq!(buckets[1], (5.0, 1));
        assert_eq!(buckets.last().unwrap().1, 3);
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::default();
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);

        let gauge = Gauge::default();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_prometheus_output() {
        let registry = MetricsRegistry::new();
        registry.elections_started.inc();
        registry.current_term.set(7);
        registry.commit_latency.observe(Duration::from_millis(12));

        let text = registry.to_prometheus();
        assert!(text.contains("quorumkv_elections_started_total 1"));
        assert!(text.contains("quorumkv_current_term 7"));
        assert!(text.contains("quorumkv_commit_duration_ms_bucket{le=\"+Inf\"} 1"));
    }
}
