//! Keeps the strategy monitor in step with deployments

use botfleet_bridge::BridgeRegistry;
use botfleet_monitor::StrategyMonitor;
use botfleet_types::{EventBus, FleetEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Start monitoring every strategy the bridge deploys and stop when it is
/// stopped. A redeploy of a monitored strategy keeps its session.
pub fn spawn_monitor_attacher(
    events: &EventBus,
    bridge: Arc<BridgeRegistry>,
    monitor: Arc<StrategyMonitor>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                received = rx.recv() => match received {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("ATTACH: Missed {} event(s)", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = stop.changed() => break,
            };

            match envelope.event {
                FleetEvent::StrategyDeployed {
                    strategy_id,
                    instance_id,
                    ..
                } => {
                    let Some(execution) = bridge.execution(&strategy_id) else {
                        continue;
                    };
                    // A retune redeploys under the same id
                    if monitor
                        .rebind(&strategy_id, &instance_id, execution.definition.clone())
                        .await
                        .is_some()
                    {
                        continue;
                    }
                    if let Err(e) = monitor
                        .start_monitoring(&strategy_id, &instance_id, execution.definition)
                        .await
                    {
                        warn!(strategy_id = %strategy_id, "ATTACH: Monitoring not started: {}", e);
                    }
                }
                FleetEvent::StrategyStopped { strategy_id, .. } => {
                    if monitor.stop_monitoring(&strategy_id) {
                        debug!(strategy_id = %strategy_id, "ATTACH: Monitoring stopped");
                    }
                }
                _ => {}
            }
        }
    })
}
