//! The WebSocket accept route. The handshake itself (upgrade negotiation,
//! TLS termination) is `axum`/`hyper`'s job — out of scope per section 1 —
//! this module is only the thin admission-control layer section 4.6's
//! `Accept` describes, plus the query/header parsing section 6 names.

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;

use crate::errors::AcceptError;
use crate::hub::Hub;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub fn router(hub: Hub, path: &str) -> Router {
    Router::new().route(path, get(upgrade)).with_state(hub)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(hub): State<Hub>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let token = query.token.or_else(|| bearer_token(&headers));

    // The JWT verifier is an external collaborator (section 1); this
    // crate only carries the narrow admission-control seam it plugs into.
    // Absence of a token is not itself a rejection here — that policy
    // decision belongs to the verifier, which is out of scope.
    let _ = token;

    if let Err(err) = hub.check_admission() {
        return reject(err);
    }

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket: WebSocket| async move {
        hub.register(remote_addr.to_string(), user_agent, socket);
    })
    .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Admission is refused before the WebSocket upgrade completes, so there is
/// no open socket yet to send a close frame on; the rejection is a plain
/// HTTP response instead. The close code `AcceptError::close_code` assigns
/// this failure is still recorded in the response and in the log line, so a
/// proxy/load balancer in front of this hub (or a client that retries the
/// upgrade) can see the same code it would have gotten had the rejection
/// instead happened after an upgrade.
fn reject(err: AcceptError) -> axum::response::Response {
    let status = match err {
        AcceptError::AuthRejected => StatusCode::UNAUTHORIZED,
        AcceptError::CapacityExceeded | AcceptError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
    };
    let close_code = err.close_code();
    tracing::debug!(target: "ws", reason = %err, close_code, "rejecting connection before upgrade");
    (
        status,
        [("x-close-code", close_code.to_string())],
        err.reason(),
    )
        .into_response()
}
