//! The HTTP side-car: `GET /health` and `GET /metrics`, served on a port
//! independent of the WebSocket listener (section 6). No static asset or
//! SPA serving — the browser UI is out of scope.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use crate::hub::Hub;
use crate::resource_guard::GuardState;

pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(hub)
}

#[derive(Serialize)]
struct HealthChecks {
    capacity: bool,
    memory: bool,
    cpu: bool,
    upstream: bool,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    checks: HealthChecks,
    uptime_seconds: u64,
    connections_open: usize,
    connections_draining: usize,
}

async fn health(State(hub): State<Hub>) -> impl IntoResponse {
    let guard_state = hub.resource_guard_state();
    let snapshot = hub.metrics().snapshot();
    let (open, draining) = hub.connection_state_counts();

    let capacity_ok = hub.registry().active_count() < hub.config().registry.max_connections;
    let cpu_ok = guard_state != GuardState::Reject;
    let memory_limit = hub.config().resource_guard.max_memory_bytes as f64;
    let memory_ok = (snapshot.memory_bytes as f64) < memory_limit * 0.95;
    // `Hub` has no externally-observable "upstream connected" bit — the
    // reconnect loop only ever calls `Hub::ingest`. Always-true until a
    // real `UpstreamSource` exposes a connection status to check here.
    let upstream_ok = true;

    let status = match guard_state {
        GuardState::Ok => "ok",
        GuardState::Degraded => "degraded",
        GuardState::Reject => "unhealthy",
    };

    Json(HealthBody {
        status,
        checks: HealthChecks {
            capacity: capacity_ok,
            memory: memory_ok,
            cpu: cpu_ok,
            upstream: upstream_ok,
        },
        uptime_seconds: hub.uptime().as_secs(),
        connections_open: open,
        connections_draining: draining,
    })
}

async fn metrics(State(hub): State<Hub>) -> impl IntoResponse {
    let body = hub.metrics().render_prometheus();
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
