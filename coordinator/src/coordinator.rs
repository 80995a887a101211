//! Multi-exchange coordinator

use crate::arbitrage::{find_opportunities, leg_definitions, order_size, revalidate};
use crate::rebalance::{plan_rebalance, RebalanceOrder};
use crate::{CoordinatorError, CrossExchangeStrategy, CrossStatus, FailoverAction, StrategyLeg};
use botfleet_bridge::BridgeRegistry;
use botfleet_config::CoordinatorConfig;
use botfleet_connectors::{BalanceProvider, PriceOracle};
use botfleet_exchange_tracker::ExchangeStatusTracker;
use botfleet_metrics::CoordinatorMetrics;
use botfleet_types::{
    short_id, spawn_periodic, ArbitrageOpportunity, EventBus, ExecutionSettings, ExecutionStatus,
    FleetEvent, InstanceDirectory, InstanceId, OpportunityStatus, RiskLimits, StrategyDefinition,
    StrategyKind,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Coordinates strategies, arbitrage and failover across exchanges
pub struct MultiExchangeCoordinator {
    bridge: Arc<BridgeRegistry>,
    tracker: Arc<ExchangeStatusTracker>,
    directory: Arc<dyn InstanceDirectory>,
    oracle: Arc<dyn PriceOracle>,
    balances: Arc<dyn BalanceProvider>,
    config: CoordinatorConfig,
    strategies: DashMap<String, CrossExchangeStrategy>,
    opportunities: DashMap<String, ArbitrageOpportunity>,
    events: EventBus,
    metrics: Arc<CoordinatorMetrics>,
}

impl MultiExchangeCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bridge: Arc<BridgeRegistry>,
        tracker: Arc<ExchangeStatusTracker>,
        directory: Arc<dyn InstanceDirectory>,
        oracle: Arc<dyn PriceOracle>,
        balances: Arc<dyn BalanceProvider>,
        config: CoordinatorConfig,
        events: EventBus,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        info!(
            "COORDINATOR: {} exchanges, {} pairs, min profit {}%",
            config.exchanges.len(),
            config.trading_pairs.len(),
            config.min_profit_threshold
        );
        Self {
            bridge,
            tracker,
            directory,
            oracle,
            balances,
            config,
            strategies: DashMap::new(),
            opportunities: DashMap::new(),
            events,
            metrics,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<ExchangeStatusTracker> {
        &self.tracker
    }

    /// Connected running instance with the fewest active strategies,
    /// ties broken by instance id
    pub fn select_instance(&self) -> Result<InstanceId, CoordinatorError> {
        self.directory
            .running_instances()
            .into_iter()
            .filter(|id| self.bridge.is_connected(id))
            .map(|id| (self.bridge.active_count(&id), id))
            .min()
            .map(|(_, id)| id)
            .ok_or(CoordinatorError::NoInstance)
    }

    // ========================================================================
    // Coordinated placement
    // ========================================================================

    /// Deploy `definitions` as one strategy spread over their exchanges.
    /// Every exchange must be healthy; any failed leg rolls back the rest.
    pub async fn coordinate_strategies(
        &self,
        name: &str,
        definitions: Vec<StrategyDefinition>,
    ) -> Result<CrossExchangeStrategy, CoordinatorError> {
        if definitions.is_empty() {
            return Err(CoordinatorError::Coordination(
                "no strategies to coordinate".to_string(),
            ));
        }

        let mut groups: BTreeMap<String, Vec<StrategyDefinition>> = BTreeMap::new();
        for definition in definitions {
            groups
                .entry(definition.exchange.clone())
                .or_default()
                .push(definition);
        }

        if let Some(down) = groups.keys().find(|e| !self.tracker.is_healthy(e)) {
            warn!(exchange = %down, "COORDINATOR: Refusing coordination, exchange not healthy");
            return Err(CoordinatorError::ExchangeUnavailable(down.clone()));
        }

        let mut legs: Vec<StrategyLeg> = Vec::new();
        for (exchange, group) in groups {
            let instance_id = match self.select_instance() {
                Ok(id) => id,
                Err(e) => {
                    self.rollback(&legs, "coordination aborted").await;
                    return Err(CoordinatorError::Coordination(format!("{}: {}", exchange, e)));
                }
            };

            for definition in group {
                match self.bridge.deploy(&instance_id, definition.clone()).await {
                    Ok(execution) => legs.push(StrategyLeg {
                        exchange: exchange.clone(),
                        strategy_id: execution.id,
                        instance_id: instance_id.clone(),
                        definition,
                    }),
                    Err(e) => {
                        error!(
                            exchange = %exchange,
                            strategy_id = %definition.id,
                            "COORDINATOR: Leg deployment failed, rolling back {} legs: {}",
                            legs.len(),
                            e
                        );
                        self.rollback(&legs, "coordination aborted").await;
                        return Err(CoordinatorError::Coordination(format!(
                            "{} on {}: {}",
                            definition.id, exchange, e
                        )));
                    }
                }
            }
        }

        let strategy = CrossExchangeStrategy {
            id: short_id("xstrat"),
            name: name.to_string(),
            legs,
            status: CrossStatus::Active,
            created_at: Utc::now(),
        };
        info!(
            cross_id = %strategy.id,
            "COORDINATOR: '{}' running on {:?}",
            name,
            strategy.exchanges()
        );
        self.strategies
            .insert(strategy.id.clone(), strategy.clone());
        Ok(strategy)
    }

    async fn rollback(&self, legs: &[StrategyLeg], reason: &str) {
        for leg in legs {
            if let Err(e) = self.bridge.stop(&leg.strategy_id, reason).await {
                error!(strategy_id = %leg.strategy_id, "COORDINATOR: Rollback stop failed: {}", e);
            }
        }
    }

    /// Stop every leg of a cross-exchange strategy
    pub async fn stop_strategy(&self, cross_id: &str) -> Result<(), CoordinatorError> {
        let strategy = self
            .strategy(cross_id)
            .ok_or_else(|| CoordinatorError::NotFound(cross_id.to_string()))?;

        let mut first_error = None;
        for leg in &strategy.legs {
            if let Err(e) = self.bridge.stop(&leg.strategy_id, "cross-exchange stop").await {
                first_error.get_or_insert(e);
            }
        }
        self.set_cross_status(cross_id, CrossStatus::Stopped);
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn set_cross_status(&self, cross_id: &str, status: CrossStatus) {
        if let Some(mut strategy) = self.strategies.get_mut(cross_id) {
            strategy.status = status;
        }
    }

    pub fn strategy(&self, cross_id: &str) -> Option<CrossExchangeStrategy> {
        self.strategies.get(cross_id).map(|s| s.value().clone())
    }

    pub fn strategies(&self) -> Vec<CrossExchangeStrategy> {
        let mut all: Vec<CrossExchangeStrategy> =
            self.strategies.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    // ========================================================================
    // Arbitrage
    // ========================================================================

    /// Compare prices for every configured pair across every configured
    /// exchange. Exchanges without a price are skipped.
    pub async fn detect_arbitrage(&self) -> Vec<ArbitrageOpportunity> {
        // Only executed or rejected opportunities outlive a detection pass
        self.opportunities
            .retain(|_, o| o.status != OpportunityStatus::Detected);

        let mut detected = Vec::new();
        for pair in &self.config.trading_pairs {
            let quotes = join_all(self.tracker.exchanges().iter().map(|exchange| async move {
                (exchange.clone(), self.oracle.price(exchange, pair).await)
            }))
            .await;

            let prices: Vec<(String, f64)> = quotes
                .into_iter()
                .filter_map(|(exchange, quote)| match quote {
                    Ok(price) => Some((exchange, price)),
                    Err(e) => {
                        debug!(exchange = %exchange, pair = %pair, "no price: {}", e);
                        None
                    }
                })
                .collect();

            for opportunity in find_opportunities(pair, &prices, self.config.min_profit_threshold) {
                info!(
                    opportunity_id = %opportunity.id,
                    "COORDINATOR: {} buy {} @ {} / sell {} @ {} ({:.3}%)",
                    pair,
                    opportunity.buy_exchange,
                    opportunity.buy_price,
                    opportunity.sell_exchange,
                    opportunity.sell_price,
                    opportunity.profit_percent
                );
                self.metrics
                    .opportunities_detected
                    .with_label_values(&[pair.as_str()])
                    .inc();
                self.events.publish(FleetEvent::ArbitrageDetected {
                    opportunity: opportunity.clone(),
                });
                self.opportunities
                    .insert(opportunity.id.clone(), opportunity.clone());
                detected.push(opportunity);
            }
        }
        detected
    }

    /// Re-check an opportunity against current prices, then deploy its buy
    /// and sell legs concurrently. A leg that deploys while the other fails
    /// is torn down.
    pub async fn execute_arbitrage(
        &self,
        opportunity: &ArbitrageOpportunity,
    ) -> Result<CrossExchangeStrategy, CoordinatorError> {
        for exchange in [&opportunity.buy_exchange, &opportunity.sell_exchange] {
            if !self.tracker.is_healthy(exchange) {
                return Err(self.reject(opportunity, format!("exchange {} not healthy", exchange)));
            }
        }

        let (buy_quote, sell_quote) = tokio::join!(
            self.oracle
                .price(&opportunity.buy_exchange, &opportunity.trading_pair),
            self.oracle
                .price(&opportunity.sell_exchange, &opportunity.trading_pair),
        );
        let (buy_now, sell_now) = match (buy_quote, sell_quote) {
            (Ok(buy), Ok(sell)) => (buy, sell),
            (Err(e), _) | (_, Err(e)) => {
                return Err(self.reject(opportunity, format!("price refresh failed: {}", e)))
            }
        };
        if let Err(reason) = revalidate(buy_now, sell_now, self.config.min_profit_threshold) {
            return Err(self.reject(opportunity, reason));
        }

        let amount = order_size(buy_now, &self.config);
        if amount <= 0.0 {
            return Err(self.reject(opportunity, "order size is zero".to_string()));
        }
        let instance_id = match self.select_instance() {
            Ok(id) => id,
            Err(e) => return Err(self.reject(opportunity, e.to_string())),
        };

        self.set_opportunity_status(opportunity, OpportunityStatus::Executing);
        let (buy_def, sell_def) = leg_definitions(opportunity, amount, buy_now, sell_now);
        let (buy, sell) = tokio::join!(
            self.bridge.deploy(&instance_id, buy_def.clone()),
            self.bridge.deploy(&instance_id, sell_def.clone()),
        );

        let failure = match (&buy, &sell) {
            (Ok(_), Ok(_)) => None,
            (Ok(deployed), Err(e)) | (Err(e), Ok(deployed)) => {
                warn!(
                    opportunity_id = %opportunity.id,
                    "COORDINATOR: One leg failed, tearing down {}",
                    deployed.id
                );
                if let Err(stop_err) = self.bridge.stop(&deployed.id, "arbitrage leg failed").await {
                    error!(strategy_id = %deployed.id, "COORDINATOR: Teardown failed: {}", stop_err);
                }
                Some(e.to_string())
            }
            (Err(e), Err(_)) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            error!(opportunity_id = %opportunity.id, "COORDINATOR: Arbitrage failed: {}", reason);
            self.set_opportunity_status(opportunity, OpportunityStatus::Failed);
            self.metrics
                .arbitrage_outcomes
                .with_label_values(&["failed"])
                .inc();
            return Err(CoordinatorError::Coordination(reason));
        }

        let strategy = CrossExchangeStrategy {
            id: opportunity.id.clone(),
            name: format!("arbitrage {}", opportunity.trading_pair),
            legs: vec![
                StrategyLeg {
                    exchange: opportunity.buy_exchange.clone(),
                    strategy_id: buy_def.id.clone(),
                    instance_id: instance_id.clone(),
                    definition: buy_def,
                },
                StrategyLeg {
                    exchange: opportunity.sell_exchange.clone(),
                    strategy_id: sell_def.id.clone(),
                    instance_id,
                    definition: sell_def,
                },
            ],
            status: CrossStatus::Active,
            created_at: Utc::now(),
        };
        self.strategies
            .insert(strategy.id.clone(), strategy.clone());
        self.set_opportunity_status(opportunity, OpportunityStatus::Executed);
        self.metrics
            .arbitrage_outcomes
            .with_label_values(&["executed"])
            .inc();

        info!(
            opportunity_id = %opportunity.id,
            amount,
            "COORDINATOR: Arbitrage executed on {} / {}",
            opportunity.buy_exchange,
            opportunity.sell_exchange
        );
        self.events.publish(FleetEvent::ArbitrageExecuted {
            opportunity_id: opportunity.id.clone(),
            buy_strategy_id: strategy.legs[0].strategy_id.clone(),
            sell_strategy_id: strategy.legs[1].strategy_id.clone(),
            amount,
        });
        Ok(strategy)
    }

    fn reject(&self, opportunity: &ArbitrageOpportunity, reason: String) -> CoordinatorError {
        info!(opportunity_id = %opportunity.id, "COORDINATOR: Opportunity rejected: {}", reason);
        self.set_opportunity_status(opportunity, OpportunityStatus::Rejected);
        self.metrics
            .arbitrage_outcomes
            .with_label_values(&["rejected"])
            .inc();
        self.events.publish(FleetEvent::ArbitrageRejected {
            opportunity_id: opportunity.id.clone(),
            reason: reason.clone(),
        });
        CoordinatorError::Rejected(reason)
    }

    fn set_opportunity_status(&self, opportunity: &ArbitrageOpportunity, status: OpportunityStatus) {
        self.opportunities
            .entry(opportunity.id.clone())
            .or_insert_with(|| opportunity.clone())
            .status = status;
    }

    /// Known opportunities, oldest first
    pub fn opportunities(&self) -> Vec<ArbitrageOpportunity> {
        let mut all: Vec<ArbitrageOpportunity> =
            self.opportunities.iter().map(|o| o.value().clone()).collect();
        all.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        all
    }

    // ========================================================================
    // Failover
    // ========================================================================

    /// Probe exchanges once, then fail over every exchange that is down.
    /// Exchanges that stay failed are revisited each cycle, so a leg an
    /// earlier attempt could not move or pause gets another attempt.
    pub async fn run_health_cycle(&self) -> Vec<FailoverAction> {
        self.tracker.poll_once().await;
        let mut actions = Vec::new();
        for exchange in self.tracker.exchanges() {
            if self.tracker.is_failed(exchange) {
                actions.extend(self.handle_failover(exchange).await);
            }
        }
        actions
    }

    fn is_live(&self, leg: &StrategyLeg) -> bool {
        self.bridge
            .execution(&leg.strategy_id)
            .map(|e| e.status == ExecutionStatus::Active)
            .unwrap_or(false)
    }

    /// Move every live leg on `exchange` to its first healthy fallback.
    /// Without one, every live leg of each affected strategy is paused, so
    /// no strategy keeps trading one side of a pair.
    pub async fn handle_failover(&self, exchange: &str) -> Vec<FailoverAction> {
        let fallback = self
            .config
            .exchange(exchange)
            .and_then(|e| e.fallbacks.iter().find(|f| self.tracker.is_healthy(f)))
            .cloned();

        let plan: Vec<(String, Vec<StrategyLeg>)> = self
            .strategies
            .iter()
            .filter(|s| matches!(s.status, CrossStatus::Active | CrossStatus::Paused))
            .filter(|s| s.legs.iter().any(|l| l.exchange == exchange))
            .map(|s| {
                let mut legs: Vec<StrategyLeg> = s
                    .legs
                    .iter()
                    .filter(|l| fallback.is_none() || l.exchange == exchange)
                    .filter(|l| self.is_live(l))
                    .cloned()
                    .collect();
                // Legs on the failed exchange go first
                legs.sort_by_key(|l| l.exchange != exchange);
                (s.id.clone(), legs)
            })
            .filter(|(_, legs)| !legs.is_empty())
            .collect();

        if plan.is_empty() {
            debug!(exchange, "no live legs to fail over");
            return Vec::new();
        }

        warn!(
            exchange,
            strategies = plan.len(),
            "COORDINATOR: Exchange failed, fallback: {:?}",
            fallback
        );

        let mut actions = Vec::new();
        for (cross_id, legs) in plan {
            let mut all_paused = true;
            for leg in legs {
                let action = match &fallback {
                    Some(target) => self.migrate_leg(&cross_id, &leg, target).await,
                    None => self.pause_leg(&cross_id, &leg, exchange).await,
                };
                let outcome = match &action {
                    FailoverAction::Migrated { .. } => "migrated",
                    FailoverAction::Paused { .. } => "paused",
                    FailoverAction::Failed { .. } => {
                        all_paused = false;
                        "failed"
                    }
                };
                self.metrics
                    .failovers
                    .with_label_values(&[exchange, outcome])
                    .inc();
                actions.push(action);
            }
            if fallback.is_none() && all_paused {
                self.set_cross_status(&cross_id, CrossStatus::Paused);
            }
        }
        actions
    }

    async fn migrate_leg(&self, cross_id: &str, leg: &StrategyLeg, target: &str) -> FailoverAction {
        let failed = |error: String| FailoverAction::Failed {
            cross_id: cross_id.to_string(),
            strategy_id: leg.strategy_id.clone(),
            error,
        };

        let instance_id = match self.select_instance() {
            Ok(id) => id,
            Err(e) => return failed(e.to_string()),
        };
        if let Err(e) = self
            .bridge
            .stop(&leg.strategy_id, &format!("exchange {} failed", leg.exchange))
            .await
        {
            return failed(e.to_string());
        }

        let new_id = short_id(&format!("{}-fo", leg.strategy_id));
        let relocated = leg.definition.relocated(&new_id, target);
        match self.bridge.deploy(&instance_id, relocated.clone()).await {
            Ok(_) => {
                if let Some(mut strategy) = self.strategies.get_mut(cross_id) {
                    if let Some(slot) = strategy
                        .legs
                        .iter_mut()
                        .find(|l| l.strategy_id == leg.strategy_id)
                    {
                        *slot = StrategyLeg {
                            exchange: target.to_string(),
                            strategy_id: new_id.clone(),
                            instance_id,
                            definition: relocated,
                        };
                    }
                }
                info!(
                    cross_id,
                    strategy_id = %leg.strategy_id,
                    new_strategy_id = %new_id,
                    "COORDINATOR: Leg migrated {} -> {}",
                    leg.exchange,
                    target
                );
                self.events.publish(FleetEvent::StrategyMigrated {
                    strategy_id: leg.strategy_id.clone(),
                    new_strategy_id: new_id.clone(),
                    from: leg.exchange.clone(),
                    to: target.to_string(),
                });
                FailoverAction::Migrated {
                    cross_id: cross_id.to_string(),
                    strategy_id: leg.strategy_id.clone(),
                    new_strategy_id: new_id,
                    to: target.to_string(),
                }
            }
            Err(e) => {
                // The old leg is already stopped, so the whole strategy is broken
                error!(cross_id, strategy_id = %leg.strategy_id, "COORDINATOR: Migration failed: {}", e);
                self.set_cross_status(cross_id, CrossStatus::Failed);
                failed(e.to_string())
            }
        }
    }

    async fn pause_leg(&self, cross_id: &str, leg: &StrategyLeg, failed: &str) -> FailoverAction {
        let reason = format!("exchange {} failed, no healthy fallback", failed);
        match self.bridge.pause(&leg.strategy_id, &reason).await {
            Ok(()) => FailoverAction::Paused {
                cross_id: cross_id.to_string(),
                strategy_id: leg.strategy_id.clone(),
            },
            Err(e) => {
                error!(cross_id, strategy_id = %leg.strategy_id, "COORDINATOR: Pause failed: {}", e);
                FailoverAction::Failed {
                    cross_id: cross_id.to_string(),
                    strategy_id: leg.strategy_id.clone(),
                    error: e.to_string(),
                }
            }
        }
    }

    // ========================================================================
    // Rebalancing
    // ========================================================================

    /// Quote-currency value held per asset across every exchange
    pub async fn portfolio_values(&self) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
        let mut holdings: BTreeMap<String, f64> = BTreeMap::new();
        for exchange in self.tracker.exchanges() {
            match self.balances.balances(exchange).await {
                Ok(balances) => {
                    for (asset, amount) in balances {
                        *holdings.entry(asset).or_default() += amount;
                    }
                }
                Err(e) => warn!(exchange = %exchange, "COORDINATOR: Balances unavailable: {}", e),
            }
        }

        let mut assets: Vec<String> = holdings.keys().cloned().collect();
        assets.extend(self.config.target_allocations.keys().cloned());
        assets.sort();
        assets.dedup();

        let mut prices = BTreeMap::new();
        for asset in assets {
            if let Some(price) = self.asset_price(&asset).await {
                prices.insert(asset, price);
            }
        }

        let values = holdings
            .into_iter()
            .filter_map(|(asset, amount)| prices.get(&asset).map(|p| (asset, amount * p)))
            .collect();
        (values, prices)
    }

    /// Price in the quote asset from the first exchange that answers
    async fn asset_price(&self, asset: &str) -> Option<f64> {
        if asset == self.config.quote_asset {
            return Some(1.0);
        }
        let pair = format!("{}-{}", asset, self.config.quote_asset);
        for exchange in self.tracker.exchanges() {
            if let Ok(price) = self.oracle.price(exchange, &pair).await {
                return Some(price);
            }
        }
        warn!(asset, "COORDINATOR: No price for {}", pair);
        None
    }

    /// Issue a buy or sell strategy for every asset off its target by more
    /// than the threshold. Deviations of the quote asset settle through the
    /// other orders.
    pub async fn rebalance(&self) -> Result<Vec<RebalanceOrder>, CoordinatorError> {
        if self.config.target_allocations.is_empty() {
            return Ok(Vec::new());
        }

        let (values, prices) = self.portfolio_values().await;
        let mut orders = plan_rebalance(
            &values,
            &prices,
            &self.config.target_allocations,
            self.config.rebalance_threshold,
        );
        if orders.is_empty() {
            debug!("portfolio within rebalance threshold");
            return Ok(orders);
        }

        let exchange = self
            .tracker
            .healthy_exchanges()
            .into_iter()
            .next()
            .ok_or_else(|| CoordinatorError::ExchangeUnavailable("no healthy exchange".to_string()))?;
        let instance_id = self.select_instance()?;

        for order in orders
            .iter_mut()
            .filter(|o| o.asset != self.config.quote_asset)
        {
            let pair = format!("{}-{}", order.asset, self.config.quote_asset);
            let definition = StrategyDefinition::new(
                &short_id("rebalance"),
                StrategyKind::Twap,
                &exchange,
                &pair,
            )
            .with_parameter("side", order.side.as_str())
            .with_parameter("target_amount", order.amount)
            .with_risk_limits(RiskLimits {
                max_position_size: order.amount,
                ..Default::default()
            })
            .with_execution(ExecutionSettings {
                order_amount: order.amount,
                paper_trading: true,
                simulation_mode: true,
                ..Default::default()
            });

            match self.bridge.deploy(&instance_id, definition).await {
                Ok(execution) => {
                    info!(
                        strategy_id = %execution.id,
                        "COORDINATOR: Rebalance {} {:.6} {} (value {:.2})",
                        order.side.as_str(),
                        order.amount,
                        order.asset,
                        order.value
                    );
                    self.metrics.rebalance_orders.inc();
                    order.strategy_id = Some(execution.id);
                }
                Err(e) => error!(asset = %order.asset, "COORDINATOR: Rebalance order failed: {}", e),
            }
        }
        Ok(orders)
    }

    // ========================================================================
    // Loops
    // ========================================================================

    pub fn spawn_health_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = self.clone();
        let period = Duration::from_secs(self.config.health_check_interval_secs.max(1));
        spawn_periodic("exchange-health", period, shutdown, move || {
            let coordinator = coordinator.clone();
            async move {
                coordinator.run_health_cycle().await;
            }
        })
    }

    /// Detect every interval; execute too when auto-execution is enabled
    pub fn spawn_arbitrage_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = self.clone();
        let period = Duration::from_secs(self.config.arbitrage_interval_secs.max(1));
        spawn_periodic("arbitrage", period, shutdown, move || {
            let coordinator = coordinator.clone();
            async move {
                let detected = coordinator.detect_arbitrage().await;
                if !coordinator.config.auto_execute_arbitrage {
                    return;
                }
                for opportunity in detected {
                    if let Err(e) = coordinator.execute_arbitrage(&opportunity).await {
                        debug!(opportunity_id = %opportunity.id, "not executed: {}", e);
                    }
                }
            }
        })
    }

    pub fn spawn_rebalance_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = self.clone();
        let period = Duration::from_secs(self.config.rebalance_interval_secs.max(1));
        spawn_periodic("rebalance", period, shutdown, move || {
            let coordinator = coordinator.clone();
            async move {
                if let Err(e) = coordinator.rebalance().await {
                    warn!("COORDINATOR: Rebalance skipped: {}", e);
                }
            }
        })
    }
}
