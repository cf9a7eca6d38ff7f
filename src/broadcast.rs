//! The bounded fan-out queue and the worker pool that drains it.
//!
//! A `BroadcastJob` is produced exactly once by `Hub::ingest` and consumed
//! exactly once by whichever worker pops it. Each worker serializes the
//! payload into a single `axum` `Message` and clones it per recipient —
//! `Message`'s payload types (`Bytes`/`Utf8Bytes`) are refcounted, so the
//! "shared immutable buffer, last writer relinquishes it" ownership the
//! distilled spec describes for a manual-memory runtime is just what
//! cloning an `Arc`-backed buffer already does here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, Utf8Bytes};
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct BroadcastJob {
    pub subject: String,
    pub nonce: String,
    pub payload: Bytes,
    pub enqueued_at: Instant,
}

/// Bounded multi-producer/multi-consumer queue. Producers (`Hub::ingest`)
/// use `try_push`, which never blocks. Consumers (broadcast workers) share
/// one `mpsc::Receiver` behind an async mutex — only one worker holds the
/// lock at a time, for exactly as long as it takes to pop one job.
pub struct BroadcastQueue {
    tx: mpsc::Sender<BroadcastJob>,
    rx: AsyncMutex<mpsc::Receiver<BroadcastJob>>,
    depth: AtomicUsize,
    capacity: usize,
}

impl BroadcastQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            tx,
            rx: AsyncMutex::new(rx),
            depth: AtomicUsize::new(0),
            capacity: capacity.max(1),
        })
    }

    /// Never blocks: full queues are a drop, not backpressure on the
    /// caller, per section 4.3.
    pub fn try_push(&self, job: BroadcastJob) -> Result<(), BroadcastJob> {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => Err(job),
            Err(mpsc::error::TrySendError::Closed(job)) => Err(job),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn pop(&self) -> Option<BroadcastJob> {
        let mut rx = self.rx.lock().await;
        let job = rx.recv().await;
        if job.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        job
    }
}

/// Spawns `worker_count` symmetric workers draining `queue` and fanning
/// each job out via `registry.range`. Returns their join handles so the
/// caller (`Hub::shutdown`) can await them after cancellation.
pub fn spawn_workers(
    queue: Arc<BroadcastQueue>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    worker_count: usize,
    token: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..worker_count.max(1))
        .map(|worker_id| {
            let queue = queue.clone();
            let registry = registry.clone();
            let metrics = metrics.clone();
            let token = token.clone();
            tokio::spawn(async move {
                run_worker(worker_id, queue, registry, metrics, token).await;
            })
        })
        .collect()
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<BroadcastQueue>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = token.cancelled() => break,
            job = queue.pop() => job,
        };
        let Some(job) = job else { break };
        broadcast_job(job, &registry, &metrics);
        tracing::trace!(target: "broadcast", worker_id, "job broadcast");
    }
}

fn broadcast_job(job: BroadcastJob, registry: &Registry, metrics: &Metrics) {
    // Serialized once per job; `Message::Text`/`Message::Binary` both wrap
    // a refcounted buffer, so every `clone()` below is a pointer bump, not
    // a copy. The hub is format-agnostic for upstream payloads (section 6)
    // and must not assume UTF-8: a binary Kafka/NATS producer is valid
    // input here, so non-UTF-8 payloads are broadcast as `Binary` frames
    // instead of being force-cast into `Utf8Bytes`.
    let frame = match Utf8Bytes::try_from(job.payload.clone()) {
        Ok(text) => Message::Text(text),
        Err(_) => Message::Binary(job.payload),
    };
    let mut delivered = 0u64;
    registry.range(|conn| {
        use crate::connection::EnqueueOutcome;
        match conn.enqueue(frame.clone()) {
            EnqueueOutcome::Accepted => delivered += 1,
            EnqueueOutcome::DroppedQueueFull | EnqueueOutcome::DroppedClosed => {}
        }
    });
    metrics
        .messages_delivered
        .fetch_add(delivered, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_push_respects_capacity() {
        let queue = BroadcastQueue::new(2);
        let job = |n: &str| BroadcastJob {
            subject: "s".into(),
            nonce: n.into(),
            payload: "{}".into(),
            enqueued_at: Instant::now(),
        };
        assert!(queue.try_push(job("1")).is_ok());
        assert!(queue.try_push(job("2")).is_ok());
        assert!(queue.try_push(job("3")).is_err());
        assert_eq!(queue.depth(), 2);
    }
}
