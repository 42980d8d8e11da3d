//! Prometheus metrics for monitoring
//!
//! Provides counters, gauges, and histograms for observability.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: String,
    help: String,
}

impl Counter {
    /// Create a new counter
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: String,
    help: String,
}

impl Gauge {
    /// Create a new gauge
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum: AtomicU64,
    count: AtomicU64,
    name: String,
    help: String,
}

impl Histogram {
    /// Create with default buckets
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
    }

    /// Create with custom buckets
    pub fn with_buckets(name: &str, help: &str, bounds: Vec<f64>) -> Self {
        let buckets = bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Observe a value
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        // Sum kept as u64 micros for precision
        let micros = (value * 1_000_000.0) as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Time a closure and record the duration
    pub fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!(
            "{}_count {}\n",
            self.name,
            self.count.load(Ordering::Relaxed)
        ));

        output
    }
}

/// Standard Riptide metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static RECORDS_DISPATCHED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "riptide_records_dispatched_total",
            "Total records delivered to the pipeline",
        )
    });

    pub static BATCHES_DISPATCHED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "riptide_batches_dispatched_total",
            "Total batches delivered to the pipeline",
        )
    });

    pub static CHECKPOINTS_COMMITTED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "riptide_checkpoints_committed_total",
            "Total checkpoint commits",
        )
    });

    pub static LEASES_ACQUIRED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("riptide_leases_acquired_total", "Total leases acquired")
    });

    pub static LEASES_STOLEN: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "riptide_leases_stolen_total",
            "Leases taken over from expired owners",
        )
    });

    pub static LEASES_LOST: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "riptide_leases_lost_total",
            "Leases lost to other workers mid-hold",
        )
    });

    pub static CONSUMER_FAILURES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "riptide_consumer_failures_total",
            "Shard consumer tasks that ended in failure",
        )
    });

    pub static LEASES_HELD: LazyLock<Gauge> =
        LazyLock::new(|| Gauge::new("riptide_leases_held", "Leases currently held"));

    pub static CONSUMERS_ACTIVE: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("riptide_consumers_active", "Running shard consumer tasks")
    });

    pub static MILLIS_BEHIND: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new(
            "riptide_millis_behind_latest",
            "Read lag behind the shard tip",
        )
    });

    pub static DISPATCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new(
            "riptide_dispatch_duration_seconds",
            "Batch dispatch latency including retries",
        )
    });
}

/// Helper to gather all standard metrics
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::RECORDS_DISPATCHED.to_prometheus());
    output.push_str(&standard::BATCHES_DISPATCHED.to_prometheus());
    output.push_str(&standard::CHECKPOINTS_COMMITTED.to_prometheus());
    output.push_str(&standard::LEASES_ACQUIRED.to_prometheus());
    output.push_str(&standard::LEASES_STOLEN.to_prometheus());
    output.push_str(&standard::LEASES_LOST.to_prometheus());
    output.push_str(&standard::CONSUMER_FAILURES.to_prometheus());

    // Gauges
    output.push_str(&standard::LEASES_HELD.to_prometheus());
    output.push_str(&standard::CONSUMERS_ACTIVE.to_prometheus());
    output.push_str(&standard::MILLIS_BEHIND.to_prometheus());

    // Histograms
    output.push_str(&standard::DISPATCH_DURATION.to_prometheus());

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        assert_eq!(gauge.get(), 0);

        gauge.set(10);
        assert_eq!(gauge.get(), 10);

        gauge.dec();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram", "Test histogram");

        histogram.observe(0.001);
        histogram.observe(0.01);
        histogram.observe(0.1);

        let prometheus = histogram.to_prometheus();
        assert!(prometheus.contains("test_histogram_count 3"));
    }

    #[test]
    fn test_gather_includes_domain_metrics() {
        let output = gather_system_metrics();
        assert!(output.contains("riptide_records_dispatched_total"));
        assert!(output.contains("riptide_leases_held"));
        assert!(output.contains("riptide_dispatch_duration_seconds"));
    }
}
