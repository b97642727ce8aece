use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    // Executor
    pub partition_bindings_total: AtomicU64,
    pub partition_reset_failures_total: AtomicU64,
    pub connections_discarded_total: AtomicU64,

    // Resolver
    pub login_probes_total: AtomicU64,
    pub login_index_hits_total: AtomicU64,

    // Publisher
    pub events_published_total: AtomicU64,
    pub publish_failures_total: AtomicU64,

    // Consumer
    pub events_applied_total: AtomicU64,
    pub events_redelivered_total: AtomicU64,
    pub events_dead_lettered_total: AtomicU64,
    pub envelopes_rejected_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            partition_bindings_total: AtomicU64::new(0),
            partition_reset_failures_total: AtomicU64::new(0),
            connections_discarded_total: AtomicU64::new(0),
            login_probes_total: AtomicU64::new(0),
            login_index_hits_total: AtomicU64::new(0),
            events_published_total: AtomicU64::new(0),
            publish_failures_total: AtomicU64::new(0),
            events_applied_total: AtomicU64::new(0),
            events_redelivered_total: AtomicU64::new(0),
            events_dead_lettered_total: AtomicU64::new(0),
            envelopes_rejected_total: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    fn counters(&self) -> [(&'static str, &AtomicU64); 11] {
        [
            ("partition_bindings_total", &self.partition_bindings_total),
            (
                "partition_reset_failures_total",
                &self.partition_reset_failures_total,
            ),
            ("connections_discarded_total", &self.connections_discarded_total),
            ("login_probes_total", &self.login_probes_total),
            ("login_index_hits_total", &self.login_index_hits_total),
            ("events_published_total", &self.events_published_total),
            ("publish_failures_total", &self.publish_failures_total),
            ("events_applied_total", &self.events_applied_total),
            ("events_redelivered_total", &self.events_redelivered_total),
            ("events_dead_lettered_total", &self.events_dead_lettered_total),
            ("envelopes_rejected_total", &self.envelopes_rejected_total),
        ]
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let mut s = String::new();
    for (name, value) in metrics().counters() {
        let _ = writeln!(
            s,
            "# TYPE {name} counter\n{name} {}",
            value.load(Ordering::Relaxed)
        );
    }
    s
}

/// Result of a readiness probe against a backing service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Up,
    Down(String),
}

impl HealthStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, HealthStatus::Up)
    }
}
