//! A single client session: identity, bounded send queue, inbound nonce
//! cache, and the lifecycle state machine.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::dedup::SeenNonces;
use crate::errors::EnvelopeError;
use crate::metrics::Metrics;
use crate::protocol::{Envelope, PONG_TYPE};

type WsSink = SplitSink<axum::extract::ws::WebSocket, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    DroppedQueueFull,
    DroppedClosed,
}

struct Probation {
    strikes: u32,
    window_start: Instant,
}

/// Shared, `Arc`-held connection state. The two orchestration tasks
/// (`run_writer`, `run_reader`) each own one half of the split socket and
/// are the only code paths that touch it; everything else here is safe to
/// read/write concurrently from broadcast workers and the hub.
pub struct Connection {
    pub id: String,
    pub remote_addr: String,
    pub user_agent: Option<String>,
    pub connected_at: Instant,

    state: Mutex<ConnectionState>,
    last_activity: Mutex<Instant>,
    probation: Mutex<Probation>,
    seen_nonces: Mutex<SeenNonces>,
    missed_pongs: AtomicU32,

    pub message_count_sent: AtomicU64,
    pub bytes_sent: AtomicU64,

    send_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    close_reason: Mutex<(u16, &'static str)>,
    config: ConnectionConfig,
    metrics: Arc<Metrics>,
}

impl Connection {
    pub fn new(
        id: String,
        remote_addr: String,
        user_agent: Option<String>,
        config: ConnectionConfig,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (send_tx, send_rx) = mpsc::channel(config.send_channel_size);
        let now = Instant::now();
        let conn = Arc::new(Self {
            id,
            remote_addr,
            user_agent,
            connected_at: now,
            state: Mutex::new(ConnectionState::Connecting),
            last_activity: Mutex::new(now),
            probation: Mutex::new(Probation {
                strikes: 0,
                window_start: now,
            }),
            seen_nonces: Mutex::new(SeenNonces::new(config.seen_nonces_capacity)),
            missed_pongs: AtomicU32::new(0),
            message_count_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_tx,
            cancel: CancellationToken::new(),
            close_reason: Mutex::new((1000, "normal")),
            config,
            metrics,
        });
        (conn, send_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// CONNECTING -> OPEN. No-op (never backward) if already past CONNECTING.
    pub fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Open;
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Non-blocking. Never blocks the caller (a broadcast worker or the
    /// ping scheduler), per the spec's backpressure-drop policy.
    pub fn enqueue(&self, frame: Message) -> EnqueueOutcome {
        if !self.is_open() {
            return EnqueueOutcome::DroppedClosed;
        }
        match self.send_tx.try_send(frame) {
            Ok(()) => {
                self.reset_probation();
                EnqueueOutcome::Accepted
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics
                    .messages_dropped_queue_full
                    .fetch_add(1, Ordering::Relaxed);
                if self.record_full_queue_strike() {
                    self.metrics.slow_clients_evicted.fetch_add(1, Ordering::Relaxed);
                    self.close_with(1013, "slow client");
                }
                EnqueueOutcome::DroppedQueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::DroppedClosed,
        }
    }

    fn reset_probation(&self) {
        let mut p = self.probation.lock();
        p.strikes = 0;
    }

    /// Three consecutive full-queue enqueues within `slow_client_window_ms`
    /// trip eviction. Returns `true` if this strike tripped the limit.
    fn record_full_queue_strike(&self) -> bool {
        let mut p = self.probation.lock();
        let now = Instant::now();
        if now.duration_since(p.window_start)
            > Duration::from_millis(self.config.slow_client_window_ms)
        {
            p.strikes = 0;
            p.window_start = now;
        }
        p.strikes += 1;
        p.strikes >= self.config.slow_client_strikes
    }

    /// Idempotent request to start closing. The writer task observes this
    /// via the cancellation token at its next suspension point.
    pub fn close(&self) {
        self.close_with(1000, "normal")
    }

    /// Like `close`, but records the close code/reason the writer sends
    /// once it finishes draining. Only the first call's code sticks —
    /// idempotent the same way `close` is.
    pub fn close_with(&self, code: u16, reason: &'static str) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Open || *state == ConnectionState::Connecting {
            *state = ConnectionState::Draining;
            *self.close_reason.lock() = (code, reason);
        }
        self.cancel.cancel();
    }

    fn mark_closed(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sole task authorized to write to the socket. Multiplexes outbound
    /// queue frames, scheduled pings, and cancellation through one select
    /// loop — one task, one socket, no re-entrancy.
    pub async fn run_writer(
        self: Arc<Self>,
        mut sink: WsSink,
        mut send_rx: mpsc::Receiver<Message>,
        disconnect_tx: mpsc::UnboundedSender<String>,
        metrics: Arc<Metrics>,
    ) {
        let mut ping_interval =
            tokio::time::interval(Duration::from_millis(self.config.ping_interval_ms));
        ping_interval.tick().await; // skip the immediate first tick

        let close_reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break *self.close_reason.lock();
                }
                frame = send_rx.recv() => {
                    match frame {
                        Some(msg) => {
                            if self.write_with_deadline(&mut sink, msg).await.is_err() {
                                break (1011, "write error");
                            }
                        }
                        None => break (1000, "queue closed"),
                    }
                }
                _ = ping_interval.tick() => {
                    if self.idle_for() >= Duration::from_millis(self.config.ping_interval_ms) {
                        if self.missed_pongs.load(Ordering::Relaxed) >= self.config.missed_pongs_limit {
                            break (1011, "missed pongs");
                        }
                        self.missed_pongs.fetch_add(1, Ordering::Relaxed);
                        // Section 6's server-initiated `heartbeat` envelope is
                        // the application-level signal a client can surface
                        // in its own UI; the WS `Ping` frame right after it
                        // is the transport-level liveness check this writer
                        // actually tracks via `missed_pongs`.
                        let heartbeat = Message::Text(crate::protocol::heartbeat().into());
                        if self.write_with_deadline(&mut sink, heartbeat).await.is_err() {
                            break (1011, "heartbeat write error");
                        }
                        if self.write_with_deadline(&mut sink, Message::Ping(Vec::new().into())).await.is_err() {
                            break (1011, "ping write error");
                        }
                    }
                }
            }
        };

        self.drain_on_close(&mut sink, &mut send_rx).await;
        self.mark_closed();
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_reason.0,
                reason: close_reason.1.into(),
            })))
            .await;
        let _ = metrics; // counters updated by the caller on removal
        let _ = disconnect_tx.send(self.id.clone());
    }

    async fn drain_on_close(&self, sink: &mut WsSink, send_rx: &mut mpsc::Receiver<Message>) {
        let deadline = Duration::from_millis(self.config.close_drain_deadline_ms);
        let _ = tokio::time::timeout(deadline, async {
            while let Ok(msg) = send_rx.try_recv() {
                if self.write_with_deadline(sink, msg).await.is_err() {
                    break;
                }
            }
        })
        .await;
    }

    async fn write_with_deadline(&self, sink: &mut WsSink, msg: Message) -> Result<(), ()> {
        let deadline = Duration::from_millis(self.config.write_deadline_ms);
        let len = match &msg {
            Message::Text(t) => t.len(),
            Message::Binary(b) => b.len(),
            _ => 0,
        };
        match tokio::time::timeout(deadline, sink.send(msg)).await {
            Ok(Ok(())) => {
                self.message_count_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(()),
        }
    }

    /// Reads frames from the socket, dispatching control messages and
    /// updating `last_activity`. Malformed frames are counted, not fatal,
    /// unless the malformed rate exceeds the configured threshold.
    pub async fn run_reader(
        self: Arc<Self>,
        mut stream: futures_util::stream::SplitStream<axum::extract::ws::WebSocket>,
    ) {
        let mut malformed_strikes = 0u32;
        let mut malformed_window_start = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = stream.next() => {
                    let Some(frame) = frame else { break };
                    let Ok(frame) = frame else { break };
                    self.touch();
                    match self.handle_inbound(frame) {
                        Ok(()) => {}
                        Err(_) => {
                            let now = Instant::now();
                            if now.duration_since(malformed_window_start)
                                > Duration::from_millis(self.config.malformed_frame_window_ms)
                            {
                                malformed_strikes = 0;
                                malformed_window_start = now;
                            }
                            malformed_strikes += 1;
                            if malformed_strikes >= self.config.malformed_frame_limit {
                                self.close();
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, frame: Message) -> Result<(), EnvelopeError> {
        match frame {
            Message::Text(text) => {
                let envelope: Envelope = serde_json::from_str(&text)
                    .map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
                self.dispatch_envelope(envelope);
                Ok(())
            }
            Message::Binary(_) => Ok(()),
            Message::Ping(_) => Ok(()),
            Message::Pong(_) => {
                self.missed_pongs.store(0, Ordering::Relaxed);
                Ok(())
            }
            Message::Close(_) => {
                self.close();
                Ok(())
            }
        }
    }

    fn dispatch_envelope(&self, envelope: Envelope) {
        match envelope.kind.as_str() {
            "ping" => {
                let pong = serde_json::json!({
                    "type": PONG_TYPE,
                    "timestamp": crate::protocol::now_ms(),
                    "originalTimestamp": envelope.timestamp,
                    "latency": crate::protocol::now_ms() - envelope.timestamp,
                });
                let _ = self.enqueue(Message::Text(pong.to_string().into()));
            }
            "subscribe" => {
                // Advisory only (see Design Notes): acked, never filters
                // which broadcasts this connection subsequently receives.
                let ack = serde_json::json!({
                    "type": "subscription:ack",
                    "timestamp": crate::protocol::now_ms(),
                });
                let _ = self.enqueue(Message::Text(ack.to_string().into()));
            }
            "unsubscribe" | "pong" => {}
            _ => {
                tracing::debug!(target: "connection", kind = %envelope.kind, "unrecognized client message type");
            }
        }
    }

    /// Per-client duplicate suppression for client-originated nonces.
    /// Inbound-only; the global broadcast dedup cache is authoritative for
    /// outbound delivery (see the spec's Open Questions decision).
    pub fn check_inbound_nonce(&self, nonce: &str) -> bool {
        self.seen_nonces.lock().check_and_insert(nonce)
    }
}
