//! Metrics stream against a local WebSocket worker
//!
//! Run with: cargo test -p botfleet-connectors --test metrics_stream_test

use botfleet_connectors::{spawn_metrics_stream, StreamConfig, StreamEvent, StreamFrame, StreamStatus};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Worker that records subscriptions, sends two frames, then hangs up
async fn spawn_worker(subscriptions: Arc<Mutex<Vec<String>>>) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let subscriptions = subscriptions.clone();
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    subscriptions.lock().unwrap().push(text);
                }
                ws.send(Message::Text(
                    r#"{"type": "metrics_update", "data": {"latency_ms": 42.0, "fill_rate": 0.9}}"#
                        .to_string(),
                ))
                .await
                .unwrap();
                ws.send(Message::Text(r#"{"type": "mystery", "data": {}}"#.to_string()))
                    .await
                    .unwrap();
                let _ = ws.close(None).await;
            });
        }
    });

    addr
}

async fn next_event(sub: &mut botfleet_connectors::MetricsSubscription) -> StreamEvent {
    timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("stream event within timeout")
        .expect("stream open")
}

#[tokio::test]
async fn test_stream_decodes_frames_and_resubscribes() {
    let subscriptions = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_worker(subscriptions.clone()).await;

    let mut sub = spawn_metrics_stream(StreamConfig {
        url: format!("ws://{}", addr),
        strategy_id: "wrk-7".to_string(),
        initial_reconnect_delay_ms: 20,
        max_reconnect_delay_ms: 50,
        max_reconnect_attempts: 0,
        ping_interval_ms: 10_000,
        connect_timeout_ms: 2_000,
    });

    assert_eq!(next_event(&mut sub).await, StreamEvent::Status(StreamStatus::Connecting));
    assert_eq!(next_event(&mut sub).await, StreamEvent::Status(StreamStatus::Connected));

    match next_event(&mut sub).await {
        StreamEvent::Frame(StreamFrame::MetricsUpdate(m)) => assert_eq!(m.latency_ms, 42.0),
        other => panic!("expected metrics frame, got {:?}", other),
    }
    assert!(matches!(next_event(&mut sub).await, StreamEvent::DecodeError(_)));

    // Server hangs up; the stream reconnects, subscribes again and gets frames
    let mut reconnected = false;
    for _ in 0..10 {
        match next_event(&mut sub).await {
            StreamEvent::Status(StreamStatus::Connected) => reconnected = true,
            StreamEvent::Frame(_) if reconnected => break,
            _ => {}
        }
    }
    assert!(reconnected);

    sub.close();
    let subscriptions = subscriptions.lock().unwrap().clone();
    assert!(subscriptions.len() >= 2);
    for text in subscriptions {
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["action"], "subscribe");
        assert_eq!(value["strategy_id"], "wrk-7");
    }
}

#[tokio::test]
async fn test_stream_gives_up_after_max_attempts() {
    // Bind then drop so nothing listens on the port
    let addr = {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap()
    };

    let mut sub = spawn_metrics_stream(StreamConfig {
        url: format!("ws://{}", addr),
        strategy_id: "wrk-1".to_string(),
        initial_reconnect_delay_ms: 10,
        max_reconnect_delay_ms: 20,
        max_reconnect_attempts: 2,
        ping_interval_ms: 10_000,
        connect_timeout_ms: 500,
    });

    let mut failed = false;
    while let Ok(Some(event)) = timeout(Duration::from_secs(5), sub.recv()).await {
        if let StreamEvent::Status(StreamStatus::Failed(_)) = event {
            failed = true;
            break;
        }
    }
    assert!(failed);
}
