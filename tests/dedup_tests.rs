//! Nonce-based deduplication at the hub level: a repeated nonce is
//! dropped before it reaches the broadcast queue, regardless of subject
//! or payload.

mod helpers;

use std::sync::atomic::Ordering;
use std::time::Duration;

use helpers::{drain, join, test_hub, test_hub_with};

#[tokio::test]
async fn duplicate_nonce_is_broadcast_once() {
    let hub = test_hub();
    let (_, mut rx) = join(&hub, "client");

    hub.ingest("prices".into(), "{}".into(), "dup-1".into());
    hub.ingest("prices".into(), "{}".into(), "dup-1".into());
    hub.ingest("volume".into(), "{}".into(), "dup-1".into()); // same nonce, different subject

    let frames = drain(&mut rx, Duration::from_millis(200)).await;
    assert_eq!(frames.len(), 2); // connection:established + one broadcast

    assert_eq!(hub.metrics().messages_published.load(Ordering::Relaxed), 3);
    assert_eq!(hub.metrics().duplicates_dropped.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn nonce_is_admitted_again_after_dedup_window_elapses() {
    let hub = test_hub_with(|c| c.dedup.dedup_window_ms = 20);
    let (_, mut rx) = join(&hub, "client");

    hub.ingest("prices".into(), "{}".into(), "n1".into());
    tokio::time::sleep(Duration::from_millis(40)).await;
    hub.ingest("prices".into(), "{}".into(), "n1".into());

    let frames = drain(&mut rx, Duration::from_millis(200)).await;
    assert_eq!(frames.len(), 3); // connection:established + two broadcasts
    assert_eq!(hub.metrics().duplicates_dropped.load(Ordering::Relaxed), 0);
}
