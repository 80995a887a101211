//! Event sinks: audit log and webhook notifications

use async_trait::async_trait;
use botfleet_types::{EventEnvelope, EventSink, FleetEvent, Severity, SinkError};
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

/// Writes every event to the audit log
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &str {
        "audit-log"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        let payload = serde_json::to_string(&envelope.event)
            .map_err(|e| SinkError::Encoding(e.to_string()))?;
        info!(
            target: "botfleet::audit",
            event_id = %envelope.id,
            event = envelope.event.kind(),
            "{}",
            payload
        );
        Ok(())
    }
}

/// Posts notable events to a webhook
pub struct WebhookSink {
    client: Client,
    url: String,
    min_severity: Severity,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            min_severity: Severity::High,
        })
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    /// Events worth a notification, with their severity
    fn notable(&self, event: &FleetEvent) -> Option<Severity> {
        let severity = match event {
            FleetEvent::AnomalyDetected { anomaly } => anomaly.severity,
            FleetEvent::AlertTriggered { alert } => alert.severity,
            FleetEvent::SafetyViolation { severity, .. } => *severity,
            FleetEvent::MonitorError { severity, .. } => *severity,
            // The shutdown's own notify step pages operators; a rehearsal never does
            FleetEvent::OperatorNotified { .. }
            | FleetEvent::StrategyForceStopped { .. }
            | FleetEvent::InstanceNeedsIntervention { .. } => Severity::Critical,
            FleetEvent::ShutdownCompleted { .. }
            | FleetEvent::ShutdownCancelled { .. }
            | FleetEvent::StrategyPaused { .. }
            | FleetEvent::AdjustmentFailed { .. } => Severity::High,
            FleetEvent::ExchangeStatusChanged { healthy: false, .. } => Severity::High,
            _ => return None,
        };
        (severity >= self.min_severity).then_some(severity)
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        let Some(severity) = self.notable(&envelope.event) else {
            return Ok(());
        };

        let payload = serde_json::json!({
            "id": envelope.id,
            "timestamp": envelope.timestamp,
            "severity": severity,
            "title": envelope.event.kind(),
            "event": envelope.event,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SinkError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "webhook rejected notification");
            return Err(SinkError::Delivery(format!("webhook returned {}", response.status())));
        }
        Ok(())
    }
}
