//! The wire envelope and the small set of message constructors the hub
//! itself emits (`connection:established`, `heartbeat`, `pong`,
//! `subscription:ack`). The hub is format-agnostic for upstream payloads —
//! it only ever needs to read `nonce` off an inbound control frame, never
//! the full shape of `price:update` / `trade:executed` / etc.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub const PONG_TYPE: &str = "pong";
pub const CONNECTION_ESTABLISHED_TYPE: &str = "connection:established";
pub const HEARTBEAT_TYPE: &str = "heartbeat";
pub const SUBSCRIPTION_ACK_TYPE: &str = "subscription:ack";

/// `{ "type": ..., "timestamp": ..., "nonce": ..., ... }`.
///
/// `#[serde(flatten)]` on `extra` preserves any other fields (e.g.
/// `subscribe`'s `tokens` array) without the hub needing to know their
/// shape — it only reads `type`, `timestamp`, and `nonce`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Sent once per accepted connection, carrying the assigned id and the
/// feature flags the client should expect from this node.
pub fn connection_established(client_id: &str) -> String {
    serde_json::json!({
        "type": CONNECTION_ESTABLISHED_TYPE,
        "timestamp": now_ms(),
        "clientId": client_id,
        "features": {
            "subscribe": true,
            "heartbeat": true,
        },
    })
    .to_string()
}

pub fn heartbeat() -> String {
    serde_json::json!({
        "type": HEARTBEAT_TYPE,
        "timestamp": now_ms(),
    })
    .to_string()
}
