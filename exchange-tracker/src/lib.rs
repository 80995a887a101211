//! EXCHANGE TRACKER - Exchange liveness
//!
//! Probes every configured exchange and keeps a consecutive-failure counter
//! per exchange. Crossing the failure threshold marks the exchange failed,
//! which is what the coordinator's failover reacts to.
//!
//! # Responsibilities
//! - Probe exchanges concurrently with a bounded timeout
//! - Track health, latency and consecutive failures
//! - Report exchanges that just crossed into `failed`

use botfleet_config::CoordinatorConfig;
use botfleet_connectors::ExchangeProbe;
use botfleet_metrics::CoordinatorMetrics;
use botfleet_types::{EventBus, FleetEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Exchange health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeHealth {
    /// Not probed yet
    Unknown,
    Healthy,
    /// Slow probes, or failing probes below the threshold
    Degraded,
    Failed,
}

/// Last known state of one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeStatus {
    pub name: String,
    pub health: ExchangeHealth,
    pub consecutive_failures: u32,
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ExchangeStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            health: ExchangeHealth::Unknown,
            consecutive_failures: 0,
            last_latency: None,
            last_error: None,
            last_checked: None,
        }
    }
}

/// Tracks liveness of the configured exchanges
pub struct ExchangeStatusTracker {
    probe: Arc<dyn ExchangeProbe>,
    exchanges: Vec<String>,
    statuses: DashMap<String, ExchangeStatus>,
    failure_threshold: u32,
    probe_timeout: Duration,
    degraded_latency: Duration,
    events: EventBus,
    metrics: Arc<CoordinatorMetrics>,
}

impl ExchangeStatusTracker {
    pub fn new(
        probe: Arc<dyn ExchangeProbe>,
        config: &CoordinatorConfig,
        events: EventBus,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        let exchanges = config.exchange_names();
        let statuses = DashMap::new();
        for name in &exchanges {
            statuses.insert(name.clone(), ExchangeStatus::new(name));
        }
        info!("EXCHANGES: Tracking {} exchanges", exchanges.len());

        Self {
            probe,
            exchanges,
            statuses,
            failure_threshold: config.failure_threshold.max(1),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            degraded_latency: Duration::from_millis(config.degraded_latency_ms),
            events,
            metrics,
        }
    }

    /// Probe every exchange once. Returns the exchanges that became failed
    /// during this poll.
    pub async fn poll_once(&self) -> Vec<String> {
        let probes = self.exchanges.iter().map(|name| async move {
            let outcome = match timeout(self.probe_timeout, self.probe.probe(name)).await {
                Ok(Ok(latency)) => Ok(latency),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("probe timed out".to_string()),
            };
            (name.clone(), outcome)
        });

        let mut newly_failed = Vec::new();
        for (name, outcome) in join_all(probes).await {
            let failed = match outcome {
                Ok(latency) => {
                    self.record_success(&name, latency);
                    false
                }
                Err(error) => self.record_failure(&name, error),
            };
            if failed {
                newly_failed.push(name);
            }
        }
        newly_failed
    }

    fn record_success(&self, name: &str, latency: Duration) {
        let Some(mut status) = self.statuses.get_mut(name) else {
            return;
        };
        let was_failed = status.health == ExchangeHealth::Failed;

        status.consecutive_failures = 0;
        status.last_latency = Some(latency);
        status.last_error = None;
        status.last_checked = Some(Utc::now());
        status.health = if latency > self.degraded_latency {
            ExchangeHealth::Degraded
        } else {
            ExchangeHealth::Healthy
        };
        let health = status.health;
        drop(status);

        self.metrics
            .exchange_latency
            .with_label_values(&[name])
            .set(latency.as_secs_f64() * 1000.0);
        self.metrics
            .exchange_healthy
            .with_label_values(&[name])
            .set(i64::from(health == ExchangeHealth::Healthy));

        if was_failed {
            info!(exchange = name, "EXCHANGES: {} recovered", name);
            self.events.publish(FleetEvent::ExchangeStatusChanged {
                exchange: name.to_string(),
                healthy: true,
                consecutive_failures: 0,
            });
        } else {
            debug!(exchange = name, latency_ms = latency.as_millis() as u64, "probe ok");
        }
    }

    /// Returns true when this failure crossed the threshold
    fn record_failure(&self, name: &str, error: String) -> bool {
        let Some(mut status) = self.statuses.get_mut(name) else {
            return false;
        };

        status.consecutive_failures += 1;
        status.last_error = Some(error.clone());
        status.last_checked = Some(Utc::now());
        let failures = status.consecutive_failures;

        let crossed = failures >= self.failure_threshold && status.health != ExchangeHealth::Failed;
        if crossed {
            status.health = ExchangeHealth::Failed;
        } else if status.health != ExchangeHealth::Failed {
            status.health = ExchangeHealth::Degraded;
        }
        drop(status);

        self.metrics
            .exchange_healthy
            .with_label_values(&[name])
            .set(0);

        if crossed {
            warn!(
                exchange = name,
                failures, "EXCHANGES: {} marked failed: {}", name, error
            );
            self.events.publish(FleetEvent::ExchangeStatusChanged {
                exchange: name.to_string(),
                healthy: false,
                consecutive_failures: failures,
            });
        } else {
            debug!(exchange = name, failures, "probe failed: {}", error);
        }
        crossed
    }

    pub fn exchanges(&self) -> &[String] {
        &self.exchanges
    }

    pub fn status(&self, name: &str) -> Option<ExchangeStatus> {
        self.statuses.get(name).map(|s| s.value().clone())
    }

    /// Snapshot in configuration order
    pub fn statuses(&self) -> Vec<ExchangeStatus> {
        self.exchanges
            .iter()
            .filter_map(|name| self.status(name))
            .collect()
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.statuses
            .get(name)
            .map(|s| s.health == ExchangeHealth::Healthy)
            .unwrap_or(false)
    }

    pub fn is_failed(&self, name: &str) -> bool {
        self.statuses
            .get(name)
            .map(|s| s.health == ExchangeHealth::Failed)
            .unwrap_or(false)
    }

    pub fn healthy_exchanges(&self) -> Vec<String> {
        self.exchanges
            .iter()
            .filter(|name| self.is_healthy(name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botfleet_config::ExchangeConfig;
    use botfleet_connectors::testing::{RecordingSink, ScriptedProbe};
    use botfleet_metrics::Registry;

    fn config(names: &[&str]) -> CoordinatorConfig {
        CoordinatorConfig {
            exchanges: names
                .iter()
                .map(|n| ExchangeConfig {
                    name: n.to_string(),
                    status_url: format!("https://{}.example/status", n),
                    fallbacks: Vec::new(),
                })
                .collect(),
            degraded_latency_ms: 500,
            ..Default::default()
        }
    }

    fn tracker(probe: Arc<ScriptedProbe>, events: EventBus) -> ExchangeStatusTracker {
        ExchangeStatusTracker::new(
            probe,
            &config(&["binance", "kraken"]),
            events,
            Arc::new(CoordinatorMetrics::new(&Registry::new())),
        )
    }

    #[tokio::test]
    async fn test_unknown_until_probed() {
        let tracker = tracker(Arc::new(ScriptedProbe::new()), EventBus::default());
        assert_eq!(tracker.status("binance").unwrap().health, ExchangeHealth::Unknown);
        assert!(!tracker.is_healthy("binance"));

        tracker.poll_once().await;
        assert_eq!(tracker.healthy_exchanges(), vec!["binance", "kraken"]);
    }

    #[tokio::test]
    async fn test_third_failure_marks_failed_once() {
        let probe = Arc::new(ScriptedProbe::new());
        let events = EventBus::default();
        let sink = Arc::new(RecordingSink::new());
        let _sub = events.attach_sink(sink.clone());
        let tracker = tracker(probe.clone(), events);

        tracker.poll_once().await;
        probe.set_down("kraken", true);

        assert!(tracker.poll_once().await.is_empty());
        assert!(tracker.poll_once().await.is_empty());
        assert_eq!(tracker.status("kraken").unwrap().health, ExchangeHealth::Degraded);
        assert_eq!(tracker.poll_once().await, vec!["kraken".to_string()]);
        assert!(tracker.is_failed("kraken"));

        // Already failed; no second report
        assert!(tracker.poll_once().await.is_empty());
        assert_eq!(tracker.status("kraken").unwrap().consecutive_failures, 4);
        assert!(sink.wait_for("exchange_status_changed", Duration::from_secs(1)).await);
        assert_eq!(sink.count("exchange_status_changed"), 1);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let probe = Arc::new(ScriptedProbe::new());
        let tracker = tracker(probe.clone(), EventBus::default());

        probe.set_down("binance", true);
        tracker.poll_once().await;
        tracker.poll_once().await;
        probe.set_down("binance", false);
        tracker.poll_once().await;
        probe.set_down("binance", true);
        tracker.poll_once().await;
        tracker.poll_once().await;

        let status = tracker.status("binance").unwrap();
        assert_eq!(status.consecutive_failures, 2);
        assert_ne!(status.health, ExchangeHealth::Failed);
    }

    #[tokio::test]
    async fn test_slow_exchange_is_degraded() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_latency("kraken", Duration::from_millis(900));
        let tracker = tracker(probe, EventBus::default());

        tracker.poll_once().await;
        assert_eq!(tracker.status("kraken").unwrap().health, ExchangeHealth::Degraded);
        assert_eq!(
            tracker.status("kraken").unwrap().last_latency,
            Some(Duration::from_millis(900))
        );
        assert_eq!(tracker.healthy_exchanges(), vec!["binance"]);
    }
}
