//! Prometheus metrics for zoning
//!
//! Process-wide counters, gauges and histograms exported in text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

fn header(name: &str, help: &str, kind: &str) -> String {
    format!("# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind)
}

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    /// Create a new counter
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut out = header(self.name, self.help, "counter");
        out.push_str(&format!("{} {}\n", self.name, self.get()));
        out
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    /// Create a new gauge
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Add a signed delta
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.add(1);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.add(-1);
    }

    /// Current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut out = header(self.name, self.help, "gauge");
        out.push_str(&format!("{} {}\n", self.name, self.get()));
        out
    }
}

/// Histogram for durations, in seconds
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    /// Create with buckets suited to per-tick work
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_buckets(
            name,
            help,
            &[0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.002_5, 0.005, 0.01, 0.025, 0.05],
        )
    }

    /// Create with custom bucket bounds
    pub fn with_buckets(name: &'static str, help: &'static str, bounds: &[f64]) -> Self {
        Self {
            buckets: bounds.iter().map(|b| (*b, AtomicU64::new(0))).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Observe a value
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Observe the time elapsed since `start`
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_secs_f64());
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut out = header(self.name, self.help, "histogram");

        for (bound, count) in &self.buckets {
            out.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));

        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        out.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        out.push_str(&format!("{}_count {}\n", self.name, self.count()));
        out
    }
}

/// Standard zoning metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static MIGRATIONS_APPLIED: Counter =
        Counter::new("zoning_migrations_applied_total", "Authority intents sent for migrating entities");

    pub static MIGRATIONS_DEFERRED: Counter =
        Counter::new("zoning_migrations_deferred_total", "Migrations postponed by the cool-down window");

    pub static MIGRATION_REJECTIONS: Counter = Counter::new(
        "zoning_migration_rejections_total",
        "Migrations rejected because the placement strategy was inconsistent",
    );

    pub static BLOCKED_HIERARCHIES: Counter =
        Counter::new("zoning_blocked_hierarchies_total", "Hierarchies held back by a blocked member");

    pub static DIAGNOSTICS_EXPIRED: Counter =
        Counter::new("zoning_diagnostics_expired_total", "Migration diagnostic requests that were never answered");

    pub static ROSTER_QUERIES: Counter =
        Counter::new("zoning_roster_queries_total", "Worker roster queries sent");

    pub static MAPPING_PUBLISHES: Counter =
        Counter::new("zoning_mapping_publishes_total", "Virtual worker mapping snapshots published");

    pub static VIRTUAL_WORKERS_ASSIGNED: Gauge =
        Gauge::new("zoning_virtual_workers_assigned", "Virtual workers bound to a physical worker");

    pub static MIGRATION_LOCKS_HELD: Gauge =
        Gauge::new("zoning_migration_locks_held", "Outstanding migration lock tokens");

    pub static EVALUATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("zoning_evaluation_duration_seconds", "Migration evaluation pass latency")
    });
}

/// Gather all standard metrics in Prometheus text format
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::MIGRATIONS_APPLIED.to_prometheus());
    output.push_str(&standard::MIGRATIONS_DEFERRED.to_prometheus());
    output.push_str(&standard::MIGRATION_REJECTIONS.to_prometheus());
    output.push_str(&standard::BLOCKED_HIERARCHIES.to_prometheus());
    output.push_str(&standard::DIAGNOSTICS_EXPIRED.to_prometheus());
    output.push_str(&standard::ROSTER_QUERIES.to_prometheus());
    output.push_str(&standard::MAPPING_PUBLISHES.to_prometheus());

    // Gauges
    output.push_str(&standard::VIRTUAL_WORKERS_ASSIGNED.to_prometheus());
    output.push_str(&standard::MIGRATION_LOCKS_HELD.to_prometheus());

    // Histograms
    output.push_str(&standard::EVALUATION_DURATION.to_prometheus());

    output
}
