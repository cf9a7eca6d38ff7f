//! The coordinator: wires the upstream subscription, dedup, rate-limiting,
//! the broadcast queue/workers, the registry, and the resource guard
//! together behind one `Hub::new(config)` entry point.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{self, BroadcastJob, BroadcastQueue};
use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::dedup::GlobalDedupCache;
use crate::metrics::Metrics;
use crate::protocol;
use crate::rate_limiter::RateLimiter;
use crate::registry::Registry;
use crate::resource_guard::{GuardState, ResourceGuard};

/// Cloneable handle to the hub's shared state. Every field is itself
/// `Arc`-held, so cloning a `Hub` is cheap and every task (readers,
/// writers, workers, the resource guard, the upstream loop, the HTTP
/// side-car) gets its own handle rather than reaching through a global.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    started_at: Instant,
    config: Config,
    registry: Arc<Registry>,
    broadcast_queue: Arc<BroadcastQueue>,
    rate_limiter: RateLimiter,
    dedup: GlobalDedupCache,
    resource_guard: Arc<ResourceGuard>,
    metrics: Arc<Metrics>,
    disconnect_tx: mpsc::UnboundedSender<String>,
    worker_handles: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    disconnect_reaper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    resource_guard_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_token: CancellationToken,
}

impl Hub {
    /// Builds every subsystem, spawns the broadcast worker pool, the
    /// resource guard sampler, and the disconnect reaper, and returns a
    /// ready-to-serve `Hub`. Nothing here reaches `Config::global()` — the
    /// caller decides which `Config` to build from, so tests can pass a
    /// small, fast-converging one.
    pub fn new(config: Config) -> Self {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(Registry::new(config.registry.shard_count));
        let broadcast_queue = BroadcastQueue::new(config.broadcast.broadcast_queue_size);
        let rate_limiter = RateLimiter::new(&config.rate_limiter);
        let dedup = GlobalDedupCache::new(
            config.dedup.dedup_capacity,
            Duration::from_millis(config.dedup.dedup_window_ms),
        );

        let shutdown_token = CancellationToken::new();

        let guard_queue = broadcast_queue.clone();
        let guard_registry = registry.clone();
        let resource_guard = ResourceGuard::new(
            config.resource_guard.clone(),
            config.broadcast.broadcast_queue_size,
            metrics.clone(),
            move || guard_queue.depth(),
            move || guard_registry.active_count() * 2, // reader + writer task per connection
        );
        let resource_guard_handle = resource_guard.clone().spawn(shutdown_token.clone());

        let worker_handles = broadcast::spawn_workers(
            broadcast_queue.clone(),
            registry.clone(),
            metrics.clone(),
            config.broadcast.broadcast_workers,
            shutdown_token.clone(),
        );

        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();

        let hub = Self {
            inner: Arc::new(HubInner {
                started_at: Instant::now(),
                config,
                registry,
                broadcast_queue,
                rate_limiter,
                dedup,
                resource_guard,
                metrics,
                disconnect_tx,
                worker_handles: std::sync::Mutex::new(worker_handles),
                disconnect_reaper: std::sync::Mutex::new(None),
                resource_guard_handle: std::sync::Mutex::new(Some(resource_guard_handle)),
                shutdown_token,
            }),
        };

        let reaper = hub.clone().spawn_disconnect_reaper(disconnect_rx);
        *hub.inner.disconnect_reaper.lock().unwrap() = Some(reaper);
        hub
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn resource_guard_state(&self) -> GuardState {
        self.inner.resource_guard.state()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.inner.registry.clone()
    }

    /// Step 1-5 of section 4.6. Never suspends: every internal check is
    /// either an atomic read or a non-blocking try-operation.
    pub fn ingest(&self, subject: String, payload: Bytes, nonce: String) {
        let inner = &self.inner;

        if !inner.rate_limiter.try_acquire_inbound() {
            inner
                .metrics
                .messages_dropped_rate_limit
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        inner
            .metrics
            .messages_published
            .fetch_add(1, Ordering::Relaxed);

        if inner.dedup.insert_if_absent(&nonce) {
            inner
                .metrics
                .duplicates_dropped
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        if inner.resource_guard.state() == GuardState::Reject {
            inner
                .metrics
                .messages_dropped_overload
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !inner.rate_limiter.try_acquire_broadcast() {
            inner
                .metrics
                .messages_dropped_rate_limit
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let job = BroadcastJob {
            subject,
            nonce,
            payload,
            enqueued_at: Instant::now(),
        };
        if inner.broadcast_queue.try_push(job).is_err() {
            inner
                .metrics
                .messages_dropped_queue_full
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Section 4.6 `Accept`: admission control ahead of the handshake
    /// library's upgrade, then registration and task spawn. The caller
    /// (the axum `ws` route) owns translating `Err` into an HTTP/close
    /// response — this method never touches the socket.
    pub fn check_admission(&self) -> Result<(), crate::errors::AcceptError> {
        let inner = &self.inner;
        if inner.registry.active_count() >= inner.config.registry.max_connections {
            inner.metrics.accept_errors.fetch_add(1, Ordering::Relaxed);
            return Err(crate::errors::AcceptError::CapacityExceeded);
        }
        match inner.resource_guard.state() {
            GuardState::Degraded | GuardState::Reject => {
                inner.metrics.accept_errors.fetch_add(1, Ordering::Relaxed);
                Err(crate::errors::AcceptError::Overloaded)
            }
            GuardState::Ok => Ok(()),
        }
    }

    /// Registers a newly-accepted connection, spawns its reader/writer
    /// tasks, and sends `connection:established`. Returns the connection
    /// id assigned.
    pub fn register(
        &self,
        remote_addr: String,
        user_agent: Option<String>,
        socket: WebSocket,
    ) -> String {
        let inner = &self.inner;
        let id = uuid::Uuid::new_v4().to_string();
        let (conn, send_rx) = Connection::new(
            id.clone(),
            remote_addr,
            user_agent,
            inner.config.connection.clone(),
            inner.metrics.clone(),
        );
        conn.mark_open();
        inner.registry.insert(id.clone(), conn.clone());
        inner.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        inner.metrics.connections_active.fetch_add(1, Ordering::Relaxed);

        let (sink, stream) = futures_util::StreamExt::split(socket);
        let established = protocol::connection_established(&id);
        let _ = conn.enqueue(Message::Text(established.into()));

        let disconnect_tx = inner.disconnect_tx.clone();
        let metrics = inner.metrics.clone();
        let writer_conn = conn.clone();
        tokio::spawn(async move {
            writer_conn
                .run_writer(sink, send_rx, disconnect_tx, metrics)
                .await;
        });
        tokio::spawn(async move {
            conn.run_reader(stream).await;
        });

        id
    }

    /// Drains the `disconnected` channel the connection's writer pushes
    /// its id onto when it finishes — the only path that removes a
    /// connection from the registry, keeping removal single-threaded
    /// (section 9's cyclic-lifecycle design note) without the connection
    /// holding a reference back to the hub.
    fn spawn_disconnect_reaper(
        self,
        mut disconnect_rx: mpsc::UnboundedReceiver<String>,
    ) -> tokio::task::JoinHandle<()> {
        let token = self.inner.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled(), if disconnect_rx.is_empty() => {
                        // Drain whatever is already queued before exiting.
                        while let Ok(id) = disconnect_rx.try_recv() {
                            self.finish_disconnect(&id);
                        }
                        break;
                    }
                    id = disconnect_rx.recv() => {
                        match id {
                            Some(id) => self.finish_disconnect(&id),
                            None => break,
                        }
                    }
                }
            }
        })
    }

    fn finish_disconnect(&self, id: &str) {
        if self.inner.registry.remove(id).is_some() {
            self.inner
                .metrics
                .connections_active
                .fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Section 4.6 `Shutdown`: stop accepting (the caller stops the HTTP
    /// listener), signal every connection to DRAINING, wait for writer
    /// queues to drain or `deadline`, then force-close what remains.
    pub async fn shutdown(&self, deadline: Duration) {
        let inner = &self.inner;
        inner.registry.range(|conn| conn.close());
        inner.shutdown_token.cancel();

        let _ = tokio::time::timeout(deadline, async {
            loop {
                if inner.registry.active_count() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;

        let handles = std::mem::take(&mut *inner.worker_handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(reaper) = inner.disconnect_reaper.lock().unwrap().take() {
            let _ = reaper.await;
        }
        if let Some(guard_handle) = inner.resource_guard_handle.lock().unwrap().take() {
            let _ = guard_handle.await;
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shutdown_token.clone()
    }

    /// Test-only escape hatch (section 8, scenario 4: overload reject)
    /// for forcing the resource guard's advisory state without driving
    /// real CPU load.
    pub fn force_resource_guard_state_for_test(&self, state: GuardState) {
        self.inner.resource_guard.force_state_for_test(state);
    }

    /// `(open, draining)` counts across the whole registry, used only by
    /// the `/health` side-car route.
    pub fn connection_state_counts(&self) -> (usize, usize) {
        let mut open = 0;
        let mut draining = 0;
        self.inner.registry.range(|conn| match conn.state() {
            ConnectionState::Open => open += 1,
            ConnectionState::Draining => draining += 1,
            _ => {}
        });
        (open, draining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        crate::config::test_support::small_config()
    }

    #[tokio::test]
    async fn ingest_dedups_by_nonce() {
        let hub = Hub::new(test_config());
        hub.ingest("prices".into(), "{}".into(), "n1".into());
        hub.ingest("prices".into(), "{}".into(), "n1".into());
        assert_eq!(hub.metrics().duplicates_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(hub.metrics().messages_published.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn admission_rejects_over_capacity() {
        let mut config = test_config();
        config.registry.max_connections = 0;
        let hub = Hub::new(config);
        assert!(hub.check_admission().is_err());
    }

    #[tokio::test]
    async fn admission_rejects_when_guard_is_reject() {
        let hub = Hub::new(test_config());
        hub.force_resource_guard_state_for_test(GuardState::Reject);
        assert!(hub.check_admission().is_err());
        hub.shutdown(Duration::from_millis(200)).await;
    }
}
