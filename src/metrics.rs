//! Process-wide counters and gauges, and a Prometheus text-exposition formatter.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide metrics registry. Intentionally a single shared instance
/// (held behind an `Arc` by `Hub`, the HTTP side-car, and every task that
/// touches a counter) rather than per-module state — counters and gauges
/// are the one piece of global state this crate keeps outside `Hub::new`.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    pub accept_errors: AtomicU64,
    pub messages_published: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub messages_dropped_queue_full: AtomicU64,
    pub messages_dropped_rate_limit: AtomicU64,
    pub messages_dropped_overload: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub slow_clients_evicted: AtomicU64,

    pub connections_active: AtomicI64,
    pub queue_depth: AtomicI64,
    pub cpu_percent_x1000: AtomicI64,
    pub memory_bytes: AtomicI64,
    pub task_count: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub accept_errors: u64,
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_dropped_queue_full: u64,
    pub messages_dropped_rate_limit: u64,
    pub messages_dropped_overload: u64,
    pub duplicates_dropped: u64,
    pub slow_clients_evicted: u64,

    pub connections_active: i64,
    pub queue_depth: i64,
    pub cpu_percent: f64,
    pub memory_bytes: i64,
    pub task_count: i64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cpu_percent(&self, percent: f64) {
        self.cpu_percent_x1000
            .store((percent * 1000.0) as i64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped_queue_full: self.messages_dropped_queue_full.load(Ordering::Relaxed),
            messages_dropped_rate_limit: self.messages_dropped_rate_limit.load(Ordering::Relaxed),
            messages_dropped_overload: self.messages_dropped_overload.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            slow_clients_evicted: self.slow_clients_evicted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            cpu_percent: self.cpu_percent_x1000.load(Ordering::Relaxed) as f64 / 1000.0,
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            task_count: self.task_count.load(Ordering::Relaxed),
        }
    }

    /// Render the Prometheus text-exposition format for the `/metrics` route.
    ///
    /// Hand-rolled rather than pulled from the `prometheus` crate: this is a
    /// dozen fixed gauges/counters, not a dynamic registry.
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "# TYPE odin_connections_total counter");
        let _ = writeln!(out, "odin_connections_total {}", snap.connections_total);
        let _ = writeln!(out, "# TYPE odin_accept_errors counter");
        let _ = writeln!(out, "odin_accept_errors {}", snap.accept_errors);
        let _ = writeln!(out, "# TYPE odin_messages_published counter");
        let _ = writeln!(out, "odin_messages_published {}", snap.messages_published);
        let _ = writeln!(out, "# TYPE odin_messages_delivered counter");
        let _ = writeln!(out, "odin_messages_delivered {}", snap.messages_delivered);
        let _ = writeln!(out, "# TYPE odin_messages_dropped_queue_full counter");
        let _ = writeln!(
            out,
            "odin_messages_dropped_queue_full {}",
            snap.messages_dropped_queue_full
        );
        let _ = writeln!(out, "# TYPE odin_messages_dropped_rate_limit counter");
        let _ = writeln!(
            out,
            "odin_messages_dropped_rate_limit {}",
            snap.messages_dropped_rate_limit
        );
        let _ = writeln!(out, "# TYPE odin_messages_dropped_overload counter");
        let _ = writeln!(
            out,
            "odin_messages_dropped_overload {}",
            snap.messages_dropped_overload
        );
        let _ = writeln!(out, "# TYPE odin_duplicates_dropped counter");
        let _ = writeln!(out, "odin_duplicates_dropped {}", snap.duplicates_dropped);
        let _ = writeln!(out, "# TYPE odin_slow_clients_evicted counter");
        let _ = writeln!(
            out,
            "odin_slow_clients_evicted {}",
            snap.slow_clients_evicted
        );
        let _ = writeln!(out, "# TYPE odin_connections_active gauge");
        let _ = writeln!(out, "odin_connections_active {}", snap.connections_active);
        let _ = writeln!(out, "# TYPE odin_queue_depth gauge");
        let _ = writeln!(out, "odin_queue_depth {}", snap.queue_depth);
        let _ = writeln!(out, "# TYPE odin_cpu_percent gauge");
        let _ = writeln!(out, "odin_cpu_percent {}", snap.cpu_percent);
        let _ = writeln!(out, "# TYPE odin_memory_bytes gauge");
        let _ = writeln!(out, "odin_memory_bytes {}", snap.memory_bytes);
        let _ = writeln!(out, "# TYPE odin_task_count gauge");
        let _ = writeln!(out, "odin_task_count {}", snap.task_count);
        out
    }
}
