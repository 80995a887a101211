//! Worker metrics stream
//!
//! Keeps a WebSocket open to a worker, re-subscribes to the strategy after
//! every reconnect, and forwards decoded frames plus status changes to the
//! subscriber. Dropping the [`MetricsSubscription`] closes the stream.

use botfleet_types::Severity;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::worker::WorkerMetrics;

/// Frame pushed by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamFrame {
    MetricsUpdate(WorkerMetrics),
    OrderUpdate(OrderUpdate),
    TradeUpdate(TradeUpdate),
    Error(WorkerErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub trade_id: String,
    pub side: String,
    pub price: f64,
    pub amount: f64,
    #[serde(default)]
    pub fee: Option<f64>,
}

fn default_error_severity() -> Severity {
    Severity::Medium
}

/// Error reported by the worker itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerErrorEvent {
    pub message: String,
    #[serde(default = "default_error_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub code: Option<String>,
}

impl StreamFrame {
    /// Decode a text frame; unknown `type` values are rejected
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamStatus {
    Connecting,
    Connected,
    Reconnecting(u32),
    Failed(String),
    Closed,
}

/// What a subscriber receives
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Frame(StreamFrame),
    Status(StreamStatus),
    DecodeError(String),
}

/// Stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket URL
    pub url: String,
    /// Worker-side strategy id to subscribe to
    pub strategy_id: String,
    pub initial_reconnect_delay_ms: u64,
    /// Maximum reconnect delay (caps exponential backoff)
    pub max_reconnect_delay_ms: u64,
    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
    /// Ping interval for keep-alive
    pub ping_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            strategy_id: String::new(),
            initial_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30000,
            max_reconnect_attempts: 0,
            ping_interval_ms: 20000,
            connect_timeout_ms: 10000,
        }
    }
}

/// Live metrics subscription; closes the stream when dropped
pub struct MetricsSubscription {
    events: mpsc::Receiver<StreamEvent>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl MetricsSubscription {
    pub fn new(events: mpsc::Receiver<StreamEvent>, shutdown_tx: mpsc::Sender<()>) -> Self {
        Self {
            events,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        // Dropping the sender ends the connection loop
        self.shutdown_tx.take();
    }
}

/// Spawn the connection loop for one strategy subscription
pub fn spawn_metrics_stream(config: StreamConfig) -> MetricsSubscription {
    let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(1000);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        connection_loop(config, event_tx, shutdown_rx).await;
    });

    MetricsSubscription::new(event_rx, shutdown_tx)
}

fn shutdown_requested(shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty))
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: StreamConfig,
    event_tx: mpsc::Sender<StreamEvent>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut reconnect_attempt = 0u32;
    let mut reconnect_delay = config.initial_reconnect_delay_ms;

    loop {
        if shutdown_requested(&mut shutdown_rx) {
            break;
        }

        let status = if reconnect_attempt > 0 {
            StreamStatus::Reconnecting(reconnect_attempt)
        } else {
            StreamStatus::Connecting
        };
        if event_tx.send(StreamEvent::Status(status)).await.is_err() {
            return;
        }

        debug!(url = %config.url, strategy = %config.strategy_id, "connecting metrics stream");

        let connect_result = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            connect_async(&config.url),
        )
        .await;

        match connect_result {
            Ok(Ok((ws_stream, _response))) => {
                info!(strategy = %config.strategy_id, "Metrics stream connected");
                reconnect_attempt = 0;
                reconnect_delay = config.initial_reconnect_delay_ms;

                match message_loop(ws_stream, &config, &event_tx, &mut shutdown_rx).await {
                    DisconnectReason::Shutdown => break,
                    DisconnectReason::ReceiverDropped => return,
                    DisconnectReason::Error(e) => {
                        warn!(strategy = %config.strategy_id, "Metrics stream error: {}", e);
                    }
                    DisconnectReason::ServerClosed => {
                        info!(strategy = %config.strategy_id, "Metrics stream closed by worker");
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(strategy = %config.strategy_id, "Metrics stream connection failed: {}", e);
            }
            Err(_) => {
                warn!(strategy = %config.strategy_id, "Metrics stream connection timed out");
            }
        }

        reconnect_attempt += 1;
        if config.max_reconnect_attempts > 0 && reconnect_attempt >= config.max_reconnect_attempts {
            error!(
                strategy = %config.strategy_id,
                "Max reconnection attempts reached ({})", config.max_reconnect_attempts
            );
            let _ = event_tx
                .send(StreamEvent::Status(StreamStatus::Failed(
                    "max reconnection attempts reached".to_string(),
                )))
                .await;
            return;
        }

        if event_tx
            .send(StreamEvent::Status(StreamStatus::Reconnecting(reconnect_attempt)))
            .await
            .is_err()
        {
            return;
        }

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sleep(Duration::from_millis(reconnect_delay)) => {}
        }

        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay_ms);
    }

    let _ = event_tx.send(StreamEvent::Status(StreamStatus::Closed)).await;
}

enum DisconnectReason {
    Shutdown,
    ReceiverDropped,
    Error(String),
    ServerClosed,
}

/// Message loop - subscribe, then decode frames and answer pings
async fn message_loop(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: &StreamConfig,
    event_tx: &mpsc::Sender<StreamEvent>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> DisconnectReason {
    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "action": "subscribe",
        "strategy_id": config.strategy_id,
    });
    if let Err(e) = write.send(Message::Text(subscribe.to_string())).await {
        return DisconnectReason::Error(format!("Subscribe failed: {}", e));
    }
    if event_tx
        .send(StreamEvent::Status(StreamStatus::Connected))
        .await
        .is_err()
    {
        return DisconnectReason::ReceiverDropped;
    }

    let mut ping_interval = tokio::time::interval(Duration::from_millis(config.ping_interval_ms));
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = write.close().await;
                return DisconnectReason::Shutdown;
            }

            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    return DisconnectReason::Error(format!("Ping failed: {}", e));
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let event = match StreamFrame::decode(&text) {
                            Ok(frame) => StreamEvent::Frame(frame),
                            Err(e) => StreamEvent::DecodeError(e.to_string()),
                        };
                        if event_tx.send(event).await.is_err() {
                            return DisconnectReason::ReceiverDropped;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return DisconnectReason::Error(format!("Pong failed: {}", e));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return DisconnectReason::ServerClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return DisconnectReason::Error(format!("WebSocket error: {}", e));
                    }
                }
            }
        }
    }
}
