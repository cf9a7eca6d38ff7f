//! Broadcasting one published message reaches every connected client.

mod helpers;

use std::time::Duration;

use axum::extract::ws::Message;
use helpers::{drain, join, test_hub};

#[tokio::test]
async fn broadcast_reaches_every_connected_client() {
    let hub = test_hub();
    let mut receivers = Vec::new();
    for i in 0..10 {
        let (_, rx) = join(&hub, &format!("client{i}"));
        receivers.push(rx);
    }

    hub.ingest("prices".into(), r#"{"type":"price:update"}"#.into(), "n1".into());

    for mut rx in receivers {
        let frames = drain(&mut rx, Duration::from_millis(200)).await;
        // `connection:established` is pushed at join time, the broadcast
        // frame follows it.
        assert_eq!(frames.len(), 2);
        match &frames[1] {
            Message::Text(t) => assert!(t.contains("price:update")),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    assert_eq!(hub.metrics().messages_delivered.load(std::sync::atomic::Ordering::Relaxed), 10);
}

#[tokio::test]
async fn late_joiner_does_not_see_earlier_broadcasts() {
    let hub = test_hub();
    let (_, mut rx1) = join(&hub, "early");
    hub.ingest("prices".into(), "{}".into(), "n1".into());
    let (_, mut rx2) = join(&hub, "late");

    let early_frames = drain(&mut rx1, Duration::from_millis(200)).await;
    assert_eq!(early_frames.len(), 2);

    let late_frames = drain(&mut rx2, Duration::from_millis(100)).await;
    assert_eq!(late_frames.len(), 1); // only its own connection:established
}
