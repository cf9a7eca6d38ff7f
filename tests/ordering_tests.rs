//! With a single broadcast worker, jobs are drained from the queue in the
//! order they were pushed, so every client observes the same relative
//! ordering for a given subject.

mod helpers;

use std::time::Duration;

use axum::extract::ws::Message;
use helpers::{drain, join, test_hub_with};

#[tokio::test]
async fn single_worker_preserves_publish_order() {
    let hub = test_hub_with(|c| c.broadcast.broadcast_workers = 1);
    let (_, mut rx) = join(&hub, "client");

    for i in 0..20 {
        hub.ingest(
            "prices".into(),
            format!(r#"{{"seq":{i}}}"#).into(),
            format!("n{i}"),
        );
    }

    let frames = drain(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(frames.len(), 21); // connection:established + 20 broadcasts

    let seqs: Vec<i64> = frames[1..]
        .iter()
        .map(|frame| match frame {
            Message::Text(t) => serde_json::from_str::<serde_json::Value>(t).unwrap()["seq"]
                .as_i64()
                .unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        })
        .collect();

    let expected: Vec<i64> = (0..20).collect();
    assert_eq!(seqs, expected);
}
