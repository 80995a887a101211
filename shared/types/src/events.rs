//! Fleet event bus
//!
//! Every lifecycle transition is published as a [`FleetEvent`] on a broadcast
//! channel. Sinks (audit log, webhook, test recorder) attach through
//! [`EventBus::attach_sink`]; the returned [`SinkSubscription`] detaches the
//! sink when dropped. Publishing never blocks and never fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    Adjustment, Alert, Anomaly, ArbitrageOpportunity, InstanceId, InstanceStatus, Severity,
    ShutdownReason, ShutdownResult, ShutdownStepKind, StrategyId,
};

/// Typed fleet events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    InstanceCreated {
        instance_id: InstanceId,
        name: String,
    },
    InstanceRemoved {
        instance_id: InstanceId,
    },
    InstanceStatusChanged {
        instance_id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    },
    InstanceNeedsIntervention {
        instance_id: InstanceId,
        attempts: u32,
        issues: Vec<String>,
    },
    ScaleRequested {
        from: usize,
        to: usize,
        reason: String,
    },
    StrategyDeployed {
        strategy_id: StrategyId,
        instance_id: InstanceId,
        exchange: String,
        trading_pair: String,
    },
    StrategyStopped {
        strategy_id: StrategyId,
        reason: String,
    },
    StrategyPaused {
        strategy_id: StrategyId,
        reason: String,
    },
    StrategyResumed {
        strategy_id: StrategyId,
    },
    StrategyMigrated {
        strategy_id: StrategyId,
        new_strategy_id: StrategyId,
        from: String,
        to: String,
    },
    AnomalyDetected {
        anomaly: Anomaly,
    },
    AlertTriggered {
        alert: Alert,
    },
    AlertResolved {
        alert_id: String,
        strategy_id: StrategyId,
    },
    AdjustmentApplied {
        adjustment: Adjustment,
    },
    AdjustmentFailed {
        adjustment: Adjustment,
    },
    MonitorError {
        strategy_id: StrategyId,
        severity: Severity,
        message: String,
    },
    SafetyViolation {
        violation_id: String,
        strategy_id: Option<StrategyId>,
        severity: Severity,
        description: String,
    },
    StrategyForceStopped {
        strategy_id: StrategyId,
        reason: String,
    },
    ExchangeStatusChanged {
        exchange: String,
        healthy: bool,
        consecutive_failures: u32,
    },
    ArbitrageDetected {
        opportunity: ArbitrageOpportunity,
    },
    ArbitrageExecuted {
        opportunity_id: String,
        buy_strategy_id: StrategyId,
        sell_strategy_id: StrategyId,
        amount: f64,
    },
    ArbitrageRejected {
        opportunity_id: String,
        reason: String,
    },
    ShutdownInitiated {
        plan_id: String,
        reason: ShutdownReason,
        simulated: bool,
    },
    /// Operator page sent by a live shutdown
    OperatorNotified {
        plan_id: String,
        severity: Severity,
        message: String,
    },
    ShutdownStepCompleted {
        plan_id: String,
        step: ShutdownStepKind,
        success: bool,
        attempts: u32,
    },
    ShutdownCompleted {
        result: Box<ShutdownResult>,
    },
    ShutdownCancelled {
        plan_id: String,
    },
}

impl FleetEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FleetEvent::InstanceCreated { .. } => "instance_created",
            FleetEvent::InstanceRemoved { .. } => "instance_removed",
            FleetEvent::InstanceStatusChanged { .. } => "instance_status_changed",
            FleetEvent::InstanceNeedsIntervention { .. } => "instance_needs_intervention",
            FleetEvent::ScaleRequested { .. } => "scale_requested",
            FleetEvent::StrategyDeployed { .. } => "strategy_deployed",
            FleetEvent::StrategyStopped { .. } => "strategy_stopped",
            FleetEvent::StrategyPaused { .. } => "strategy_paused",
            FleetEvent::StrategyResumed { .. } => "strategy_resumed",
            FleetEvent::StrategyMigrated { .. } => "strategy_migrated",
            FleetEvent::AnomalyDetected { .. } => "anomaly_detected",
            FleetEvent::AlertTriggered { .. } => "alert_triggered",
            FleetEvent::AlertResolved { .. } => "alert_resolved",
            FleetEvent::AdjustmentApplied { .. } => "adjustment_applied",
            FleetEvent::AdjustmentFailed { .. } => "adjustment_failed",
            FleetEvent::MonitorError { .. } => "monitor_error",
            FleetEvent::SafetyViolation { .. } => "safety_violation",
            FleetEvent::StrategyForceStopped { .. } => "strategy_force_stopped",
            FleetEvent::ExchangeStatusChanged { .. } => "exchange_status_changed",
            FleetEvent::ArbitrageDetected { .. } => "arbitrage_detected",
            FleetEvent::ArbitrageExecuted { .. } => "arbitrage_executed",
            FleetEvent::ArbitrageRejected { .. } => "arbitrage_rejected",
            FleetEvent::ShutdownInitiated { .. } => "shutdown_initiated",
            FleetEvent::OperatorNotified { .. } => "operator_notified",
            FleetEvent::ShutdownStepCompleted { .. } => "shutdown_step_completed",
            FleetEvent::ShutdownCompleted { .. } => "shutdown_completed",
            FleetEvent::ShutdownCancelled { .. } => "shutdown_cancelled",
        }
    }
}

/// Event with delivery metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event: FleetEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Consumer of fleet events
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), SinkError>;
}

/// Broadcast bus for fleet events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self { sender }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn publish(&self, event: FleetEvent) {
        let envelope = EventEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        };
        debug!(event = envelope.event.kind(), "publishing fleet event");
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Forward every event to `sink` on a background task
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) -> SinkSubscription {
        let mut rx = self.sender.subscribe();
        let name = sink.name().to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if let Err(e) = sink.handle(&envelope).await {
                            warn!(sink = %sink.name(), event = envelope.event.kind(), "sink error: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(sink = %sink.name(), skipped, "sink lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        SinkSubscription {
            name,
            handle: Some(handle),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Handle for an attached sink; detaches on drop
pub struct SinkSubscription {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl SinkSubscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for SinkSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Collect {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSink for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn handle(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
            self.seen.lock().push(envelope.event.kind().to_string());
            Ok(())
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(FleetEvent::InstanceRemoved {
            instance_id: "i-1".into(),
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = FleetEvent::StrategyPaused {
            strategy_id: "s1".into(),
            reason: "exchange down".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "strategy_paused");
        assert_eq!(json["strategy_id"], "s1");
    }

    #[tokio::test]
    async fn test_sink_detaches_on_drop() {
        let bus = EventBus::new(8);
        let sink = Arc::new(Collect {
            seen: Mutex::new(Vec::new()),
        });

        let subscription = bus.attach_sink(sink.clone());
        bus.publish(FleetEvent::StrategyResumed {
            strategy_id: "s1".into(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.seen.lock().len(), 1);

        drop(subscription);
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(FleetEvent::StrategyResumed {
            strategy_id: "s2".into(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.seen.lock().len(), 1);
    }
}
