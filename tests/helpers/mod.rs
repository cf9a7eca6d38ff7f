//! Shared setup for the scenario suites: a hub built from a small,
//! fast-converging config, and a handful of helpers for driving
//! connections without a real socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use odin_websocket_hub::config::{test_support::small_config, Config};
use odin_websocket_hub::connection::Connection;
use odin_websocket_hub::hub::Hub;
use odin_websocket_hub::metrics::Metrics;
use odin_websocket_hub::protocol;

pub fn test_hub() -> Hub {
    Hub::new(small_config())
}

pub fn test_hub_with(mutate: impl FnOnce(&mut Config)) -> Hub {
    let mut config = small_config();
    mutate(&mut config);
    Hub::new(config)
}

/// Builds an open `Connection` registered directly in `hub`'s registry,
/// bypassing the WebSocket upgrade. Returns the id and the receiving half
/// of its send queue, which stands in for "what a client would see".
///
/// Mirrors `Hub::register`'s own sequence of `insert` then the
/// `connection:established` frame, so callers see exactly what a real
/// client would: the established frame first, then whatever broadcasts
/// follow.
pub fn join(hub: &Hub, name: &str) -> (String, tokio::sync::mpsc::Receiver<Message>) {
    let id = format!("{name}-{}", uuid::Uuid::new_v4());
    let (conn, rx) = Connection::new(
        id.clone(),
        "127.0.0.1:0".to_string(),
        None,
        hub.config().connection.clone(),
        Arc::new(Metrics::new()),
    );
    conn.mark_open();
    hub.registry().insert(id.clone(), conn.clone());
    let established = protocol::connection_established(&id);
    let _ = conn.enqueue(Message::Text(established.into()));
    (id, rx)
}

/// Drains whatever is already queued on `rx` without blocking past `within`.
pub async fn drain(
    rx: &mut tokio::sync::mpsc::Receiver<Message>,
    within: Duration,
) -> Vec<Message> {
    let mut out = Vec::new();
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(msg)) => out.push(msg),
            _ => break,
        }
    }
    out
}

/// Simple throughput/latency helper matching the spec's p50/p95/p99
/// performance-scenario language, for suites that measure fan-out latency.
pub struct Benchmark {
    samples: Vec<Duration>,
}

impl Benchmark {
    pub fn new() -> Self {
        Self { samples: Vec::new() }
    }

    pub fn record(&mut self, sample: Duration) {
        self.samples.push(sample);
    }

    fn percentile(&self, p: f64) -> Duration {
        let mut sorted = self.samples.clone();
        sorted.sort();
        if sorted.is_empty() {
            return Duration::ZERO;
        }
        let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
        sorted[idx]
    }

    pub fn p50(&self) -> Duration {
        self.percentile(0.50)
    }

    pub fn p95(&self) -> Duration {
        self.percentile(0.95)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(0.99)
    }
}
