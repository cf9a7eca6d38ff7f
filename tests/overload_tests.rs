//! Forcing the resource guard into REJECT short-circuits both new
//! connection admission and further broadcast ingestion.

mod helpers;

use std::sync::atomic::Ordering;
use std::time::Duration;

use helpers::{drain, join, test_hub};
use odin_websocket_hub::resource_guard::GuardState;

#[tokio::test]
async fn reject_state_blocks_new_admission() {
    let hub = test_hub();
    assert!(hub.check_admission().is_ok());

    hub.force_resource_guard_state_for_test(GuardState::Reject);
    assert!(hub.check_admission().is_err());
    assert_eq!(hub.metrics().accept_errors.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn reject_state_drops_ingested_messages() {
    let hub = test_hub();
    let (_, mut rx) = join(&hub, "client");

    hub.force_resource_guard_state_for_test(GuardState::Reject);
    hub.ingest("prices".into(), "{}".into(), "n1".into());

    let frames = drain(&mut rx, Duration::from_millis(100)).await;
    assert_eq!(frames.len(), 1); // only connection:established, broadcast dropped
    assert_eq!(hub.metrics().messages_dropped_overload.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn degraded_state_still_admits_and_ingests() {
    let hub = test_hub();
    let (_, mut rx) = join(&hub, "client");

    hub.force_resource_guard_state_for_test(GuardState::Degraded);
    // Degraded blocks new admission (stricter than ingest, which only
    // checks for Reject) but existing connections keep receiving.
    assert!(hub.check_admission().is_err());
    hub.ingest("prices".into(), "{}".into(), "n1".into());

    let frames = drain(&mut rx, Duration::from_millis(100)).await;
    assert_eq!(frames.len(), 2);
}
