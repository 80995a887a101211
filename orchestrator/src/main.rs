//! botfleetd - runs the strategy-worker fleet until interrupted

use anyhow::{Context, Result};
use botfleet_config::{FleetConfig, MonitoringConfig};
use botfleet_metrics::{registry, serve_metrics};
use botfleet_orchestrator::{BotFleet, Connectors};
use std::net::SocketAddr;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/botfleet.toml";

fn init_tracing(monitoring: &MonitoringConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&monitoring.log_level));

    if monitoring.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BOTFLEET_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = FleetConfig::from_file_with_env(&path)
        .with_context(|| format!("loading configuration from {}", path))?;
    config.validate().context("validating configuration")?;

    init_tracing(&config.monitoring);
    info!("BOTFLEETD: Starting with {} ({} environment)", path, config.environment);
    if !config.safety.paper_trading_enabled {
        warn!("BOTFLEETD: Paper trading is off; deployments will be rejected");
    }

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.monitoring.prometheus_port));
    let exporter = serve_metrics(registry().clone(), metrics_addr);

    let connectors = Connectors::from_config(&config)?;
    let app = BotFleet::build(config, connectors, registry())?;

    let report = app.bootstrap().await?;
    info!(
        "BOTFLEETD: Bootstrap scaled {} -> {} ({} created)",
        report.from,
        report.to,
        report.created.len()
    );

    let mut supervisor = app.supervisor();
    supervisor.start_all().await?;
    info!("BOTFLEETD: Running; services: {}", supervisor.names().join(", "));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("BOTFLEETD: Interrupt received, stopping services");

    for e in supervisor.stop_all().await {
        error!("BOTFLEETD: {}", e);
    }
    exporter.abort();
    info!("BOTFLEETD: Stopped");
    Ok(())
}
