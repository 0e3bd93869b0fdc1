// Engine telemetry
//
// Counters, gauges and histograms for:
// - Sandbox lifecycle (created, released, live)
// - Activity statistics (finished, bad, defer time)
// - Detection and compensation actions (penalties, handshakes, wakeups, escalation)
// - Ownership transfer
// - Failures (protocol violations, backend errors)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::ResourceKind;

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram bucket for duration tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // sum in nanoseconds
    count: AtomicU64,
}

impl Histogram {
    fn with_bounds(bounds: &[f64]) -> Self {
        let buckets = bounds
            .iter()
            .map(|&le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets from one microsecond to ten seconds, for lock and queue waits
    pub fn new_defer() -> Self {
        Self::with_bounds(&[
            0.000_001, 0.000_01, 0.000_1, 0.001, 0.01, 0.1, 0.5, 1.0, 2.5, 10.0,
        ])
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);

        self.sum.fetch_add(nanos, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_nanos(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < le * 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Engine metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    // Lifecycle
    pub sandboxes_created: Counter,
    pub sandboxes_released: Counter,
    pub live_sandboxes: Gauge,

    // Activity statistics
    pub activities_finished: Counter,
    pub activities_bad: Counter,
    pub escalations: Counter,
    pub tickets_expired: Counter,

    // Detection and compensation
    pub interference_detected: Counter,
    pub penalties_immediate: Counter,
    pub penalties_deferred: Counter,
    pub handshakes_completed: Counter,
    pub wakeups: Counter,
    pub release_penalties_queue: Counter,
    pub release_penalties_mutex: Counter,
    pub contended_keys: Gauge,

    // Ownership transfer
    pub transfers_parked: Counter,
    pub transfers_adopted: Counter,

    // Failures
    pub protocol_violations: Counter,
    pub backend_errors: Counter,

    pub defer_time: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            sandboxes_created: Counter::new(),
            sandboxes_released: Counter::new(),
            live_sandboxes: Gauge::new(),

            activities_finished: Counter::new(),
            activities_bad: Counter::new(),
            escalations: Counter::new(),
            tickets_expired: Counter::new(),

            interference_detected: Counter::new(),
            penalties_immediate: Counter::new(),
            penalties_deferred: Counter::new(),
            handshakes_completed: Counter::new(),
            wakeups: Counter::new(),
            release_penalties_queue: Counter::new(),
            release_penalties_mutex: Counter::new(),
            contended_keys: Gauge::new(),

            transfers_parked: Counter::new(),
            transfers_adopted: Counter::new(),

            protocol_violations: Counter::new(),
            backend_errors: Counter::new(),

            defer_time: Histogram::new_defer(),
        }
    }

    /// Record a finished activity
    pub fn record_activity(&self, defer: Duration, bad: bool) {
        self.activities_finished.inc();
        if bad {
            self.activities_bad.inc();
        }
        self.defer_time.observe(defer);
    }

    /// Record a penalty earned by leaving a resource others were waiting for
    pub fn record_release_penalty(&self, kind: ResourceKind) {
        match kind {
            ResourceKind::Queue => self.release_penalties_queue.inc(),
            ResourceKind::Mutex => self.release_penalties_mutex.inc(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, &Counter); 10] = [
            ("sandboxes_created_total", "Sandboxes created", &self.sandboxes_created),
            ("sandboxes_released_total", "Sandboxes released", &self.sandboxes_released),
            ("activities_finished_total", "Activities frozen", &self.activities_finished),
            ("activities_bad_total", "Activities that failed the deferral test", &self.activities_bad),
            ("escalations_total", "Sandboxes escalated to the highest tier", &self.escalations),
            ("tickets_expired_total", "Compensation tickets run down to zero", &self.tickets_expired),
            ("interference_detected_total", "Positive interference tests", &self.interference_detected),
            ("handshakes_completed_total", "Deferred penalties served", &self.handshakes_completed),
            ("wakeups_total", "Sleeping competitors woken", &self.wakeups),
            ("protocol_violations_total", "Events rejected as out of order", &self.protocol_violations),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!("# HELP perfbox_{} {}\n", name, help));
            output.push_str(&format!("# TYPE perfbox_{} counter\n", name));
            output.push_str(&format!("perfbox_{} {}\n", name, counter.get()));
        }

        output.push_str("# HELP perfbox_penalties_total Penalties by mode\n");
        output.push_str("# TYPE perfbox_penalties_total counter\n");
        output.push_str(&format!(
            "perfbox_penalties_total{{mode=\"immediate\"}} {}\n",
            self.penalties_immediate.get()
        ));
        output.push_str(&format!(
            "perfbox_penalties_total{{mode=\"deferred\"}} {}\n",
            self.penalties_deferred.get()
        ));

        output.push_str("# HELP perfbox_release_penalties_total Release-time penalties by resource kind\n");
        output.push_str("# TYPE perfbox_release_penalties_total counter\n");
        output.push_str(&format!(
            "perfbox_release_penalties_total{{kind=\"queue\"}} {}\n",
            self.release_penalties_queue.get()
        ));
        output.push_str(&format!(
            "perfbox_release_penalties_total{{kind=\"mutex\"}} {}\n",
            self.release_penalties_mutex.get()
        ));

        output.push_str("# HELP perfbox_transfers_total Ownership transfers\n");
        output.push_str("# TYPE perfbox_transfers_total counter\n");
        output.push_str(&format!(
            "perfbox_transfers_total{{step=\"parked\"}} {}\n",
            self.transfers_parked.get()
        ));
        output.push_str(&format!(
            "perfbox_transfers_total{{step=\"adopted\"}} {}\n",
            self.transfers_adopted.get()
        ));

        output.push_str("# HELP perfbox_backend_errors_total Failed enforcement calls\n");
        output.push_str("# TYPE perfbox_backend_errors_total counter\n");
        output.push_str(&format!(
            "perfbox_backend_errors_total {}\n",
            self.backend_errors.get()
        ));

        output.push_str("# HELP perfbox_live_sandboxes Sandboxes currently registered\n");
        output.push_str("# TYPE perfbox_live_sandboxes gauge\n");
        output.push_str(&format!(
            "perfbox_live_sandboxes {}\n",
            self.live_sandboxes.get()
        ));

        output.push_str("# HELP perfbox_contended_keys Resource keys with a competitor set\n");
        output.push_str("# TYPE perfbox_contended_keys gauge\n");
        output.push_str(&format!(
            "perfbox_contended_keys {}\n",
            self.contended_keys.get()
        ));

        output.push_str("# HELP perfbox_defer_seconds Deferred time per activity\n");
        output.push_str("# TYPE perfbox_defer_seconds histogram\n");
        for bucket in &self.defer_time.buckets {
            output.push_str(&format!(
                "perfbox_defer_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "perfbox_defer_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.defer_time.get_count()
        ));
        output.push_str(&format!(
            "perfbox_defer_seconds_sum {}\n",
            self.defer_time.get_sum_nanos() as f64 / 1_000_000_000.0
        ));
        output.push_str(&format!(
            "perfbox_defer_seconds_count {}\n",
            self.defer_time.get_count()
        ));

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get global metrics registry
pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}
