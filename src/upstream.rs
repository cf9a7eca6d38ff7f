//! The upstream pub/sub consumer contract and its reconnect loop.
//!
//! The actual NATS/Kafka client is out of scope (section 1) — the hub only
//! consumes a `Subscribe(subject) -> stream of UpstreamMessage` contract.
//! `UpstreamSource` is that narrow interface; anything implementing it
//! (a real client, or the in-memory `ChannelSource` tests use to simulate
//! upstream outages) can drive `Hub::ingest`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::UpstreamConfig;
use crate::hub::Hub;

/// One message as handed to the hub by the upstream client: the subject it
/// arrived on, the opaque payload, and the nonce the publisher attached
/// (see the Design Notes' preference for "publisher passes nonce alongside
/// payload" over scanning the body for it).
#[derive(Debug, Clone)]
pub struct UpstreamMessage {
    pub subject: String,
    pub payload: Bytes,
    pub nonce: String,
}

/// Narrow interface onto the external pub/sub bus. `subscribe` returns a
/// channel receiver rather than a `Stream` impl to keep the trait
/// object-safe and easy to mock in tests.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn subscribe(
        &self,
        subject: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<UpstreamMessage>, UpstreamError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamError(pub String);

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream subscription error: {}", self.0)
    }
}

impl std::error::Error for UpstreamError {}

/// Runs for the lifetime of the process (or until `token` cancels),
/// reconnecting with exponential backoff (base/cap from `config`, full
/// jitter) on subscribe failure or stream termination. Existing client
/// connections are never torn down while this loop is reconnecting —
/// it only ever calls `Hub::ingest`, never touches the registry directly.
pub async fn run_subscription(
    hub: Hub,
    source: impl UpstreamSource + 'static,
    subject: String,
    config: UpstreamConfig,
    token: CancellationToken,
) {
    let mut backoff_ms = config.backoff_base_ms;

    loop {
        if token.is_cancelled() {
            return;
        }

        match source.subscribe(&subject).await {
            Ok(mut rx) => {
                tracing::info!(target: "upstream", subject = %subject, "subscribed");
                backoff_ms = config.backoff_base_ms;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        msg = rx.recv() => {
                            match msg {
                                Some(msg) => hub.ingest(msg.subject, msg.payload, msg.nonce),
                                None => {
                                    tracing::warn!(target: "upstream", subject = %subject, "subscription stream ended, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(target: "upstream", subject = %subject, error = %err, "subscribe failed, retrying");
            }
        }

        let jittered = jittered_backoff(backoff_ms);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(jittered)) => {}
        }
        backoff_ms = (backoff_ms * 2).min(config.backoff_cap_ms);
    }
}

fn jittered_backoff(base_ms: u64) -> u64 {
    let mut rng = rand::thread_rng();
    rng.gen_range(0..=base_ms.max(1))
}

/// Placeholder `UpstreamSource` wired in by default at process start. The
/// real NATS/Kafka client is out of scope (section 1) and is expected to
/// be supplied by the deployment; this stub subscribes successfully but
/// yields nothing, so the hub starts cleanly and serves client
/// connections even with no upstream client configured.
pub struct NoopUpstream;

#[async_trait]
impl UpstreamSource for NoopUpstream {
    async fn subscribe(
        &self,
        _subject: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<UpstreamMessage>, UpstreamError> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        // Never drop `tx`: an immediately-closed channel would read as a
        // dead subscription and spin the reconnect loop. Leaking it is
        // harmless for a placeholder that is never used in a real
        // deployment (a real `UpstreamSource` replaces this entirely).
        std::mem::forget(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_backoff_never_exceeds_base() {
        for _ in 0..100 {
            let b = jittered_backoff(1000);
            assert!(b <= 1000);
        }
    }
}
