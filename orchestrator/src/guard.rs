//! Automatic emergency shutdown on fleet events

use botfleet_safety::PAPER_TRADING_DISABLED;
use botfleet_shutdown::{EmergencyShutdownCoordinator, ShutdownError};
use botfleet_types::{
    EventBus, EventEnvelope, FleetEvent, Severity, ShutdownReason, ShutdownTrigger,
};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shutdown reason an event warrants, if any
pub fn reason_for(envelope: &EventEnvelope) -> Option<ShutdownReason> {
    match &envelope.event {
        FleetEvent::SafetyViolation {
            description,
            strategy_id: None,
            ..
        } if description == PAPER_TRADING_DISABLED => Some(
            ShutdownReason::new(
                ShutdownTrigger::PaperTradingDisabled,
                Severity::High,
                description,
            )
            .initiated_by("safety"),
        ),
        FleetEvent::SafetyViolation {
            violation_id,
            severity: Severity::Critical,
            description,
            ..
        } => Some(
            ShutdownReason::new(
                ShutdownTrigger::RiskViolation,
                Severity::Critical,
                &format!("{} ({})", description, violation_id),
            )
            .initiated_by("safety"),
        ),
        _ => None,
    }
}

/// Watch the bus and start a shutdown whenever an event warrants one and
/// the shutdown configuration allows it
pub fn spawn_shutdown_guard(
    events: &EventBus,
    shutdown: Arc<EmergencyShutdownCoordinator>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                received = rx.recv() => match received {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("GUARD: Missed {} event(s)", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = stop.changed() => break,
            };

            let Some(reason) = reason_for(&envelope) else {
                continue;
            };
            if !shutdown.should_trigger(&reason) {
                info!(
                    trigger = reason.trigger.as_str(),
                    "GUARD: Shutdown not triggered: {}", reason.description
                );
                continue;
            }

            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                warn!("GUARD: Triggering emergency shutdown: {}", reason.description);
                match shutdown.execute(reason).await {
                    Ok(result) if result.success => info!("GUARD: Emergency shutdown completed"),
                    Ok(result) => error!(
                        "GUARD: Emergency shutdown finished with errors: {}",
                        result.errors.join("; ")
                    ),
                    Err(ShutdownError::AlreadyInProgress) => {
                        debug!("GUARD: Shutdown already running")
                    }
                    Err(e) => error!("GUARD: Emergency shutdown failed: {}", e),
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn envelope(event: FleetEvent) -> EventEnvelope {
        EventEnvelope {
            id: "evt-1".into(),
            timestamp: Utc::now(),
            event,
        }
    }

    fn violation(severity: Severity, strategy: Option<&str>, description: &str) -> EventEnvelope {
        envelope(FleetEvent::SafetyViolation {
            violation_id: "violation-1".into(),
            strategy_id: strategy.map(str::to_string),
            severity,
            description: description.into(),
        })
    }

    #[test]
    fn test_critical_violation_maps_to_risk_shutdown() {
        let reason = reason_for(&violation(
            Severity::Critical,
            Some("s1"),
            "risk level critical: drawdown 30%",
        ))
        .unwrap();
        assert_eq!(reason.trigger, ShutdownTrigger::RiskViolation);
        assert_eq!(reason.severity, Severity::Critical);
        assert_eq!(reason.initiated_by, "safety");
        assert!(reason.description.contains("violation-1"));
    }

    #[test]
    fn test_paper_trading_switch_off_maps_to_its_own_trigger() {
        let reason = reason_for(&violation(Severity::High, None, PAPER_TRADING_DISABLED)).unwrap();
        assert_eq!(reason.trigger, ShutdownTrigger::PaperTradingDisabled);
        assert_eq!(reason.severity, Severity::High);
    }

    #[test]
    fn test_other_events_are_ignored() {
        assert!(reason_for(&violation(Severity::High, Some("s1"), "risk level high")).is_none());
        assert!(reason_for(&envelope(FleetEvent::InstanceCreated {
            instance_id: "i-1".into(),
            name: "worker-1".into(),
        }))
        .is_none());
    }
}
