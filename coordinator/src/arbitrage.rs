//! Arbitrage detection, re-validation and leg construction

use botfleet_config::CoordinatorConfig;
use botfleet_types::arbitrage::spread_percent;
use botfleet_types::{
    short_id, ArbitrageOpportunity, ExecutionSettings, OpportunityStatus, RiskLimits,
    StrategyDefinition, StrategyKind,
};
use chrono::Utc;

/// Opportunities for one pair across every pair of quoted exchanges.
/// `prices` keeps configuration order; the cheaper side is always the buy side.
pub fn find_opportunities(
    trading_pair: &str,
    prices: &[(String, f64)],
    min_profit_percent: f64,
) -> Vec<ArbitrageOpportunity> {
    let mut found = Vec::new();
    for (i, (exchange_a, price_a)) in prices.iter().enumerate() {
        for (exchange_b, price_b) in &prices[i + 1..] {
            if *price_a <= 0.0 || *price_b <= 0.0 || price_a == price_b {
                continue;
            }
            let spread = spread_percent(*price_a, *price_b);
            if spread < min_profit_percent {
                continue;
            }
            let (buy_exchange, buy_price, sell_exchange, sell_price) = if price_a < price_b {
                (exchange_a, *price_a, exchange_b, *price_b)
            } else {
                (exchange_b, *price_b, exchange_a, *price_a)
            };
            found.push(ArbitrageOpportunity {
                id: short_id("arb"),
                trading_pair: trading_pair.to_string(),
                buy_exchange: buy_exchange.clone(),
                sell_exchange: sell_exchange.clone(),
                buy_price,
                sell_price,
                profit_percent: spread,
                detected_at: Utc::now(),
                status: OpportunityStatus::Detected,
            });
        }
    }
    found
}

/// Spread at current prices in the opportunity's direction, if it still
/// meets the threshold
pub fn revalidate(buy_now: f64, sell_now: f64, min_profit_percent: f64) -> Result<f64, String> {
    if buy_now <= 0.0 || sell_now <= 0.0 {
        return Err("invalid price".to_string());
    }
    if sell_now <= buy_now {
        return Err(format!(
            "spread reversed (buy {} / sell {})",
            buy_now, sell_now
        ));
    }
    let spread = spread_percent(buy_now, sell_now);
    if spread < min_profit_percent {
        return Err(format!(
            "spread {:.3}% below threshold {:.3}%",
            spread, min_profit_percent
        ));
    }
    Ok(spread)
}

/// Base units to trade: a fixed notional converted at the buy price, capped
/// at a fixed unit count
pub fn order_size(buy_price: f64, config: &CoordinatorConfig) -> f64 {
    if buy_price <= 0.0 {
        return 0.0;
    }
    (config.max_arbitrage_notional / buy_price).min(config.max_arbitrage_units)
}

fn leg(
    id: &str,
    exchange: &str,
    trading_pair: &str,
    side: &str,
    amount: f64,
    limit_price: f64,
) -> StrategyDefinition {
    StrategyDefinition::new(id, StrategyKind::Twap, exchange, trading_pair)
        .with_parameter("side", side)
        .with_parameter("target_amount", amount)
        .with_parameter("limit_price", limit_price)
        .with_risk_limits(RiskLimits {
            max_position_size: amount,
            ..Default::default()
        })
        .with_execution(ExecutionSettings {
            order_amount: amount,
            paper_trading: true,
            simulation_mode: true,
            ..Default::default()
        })
}

/// Buy and sell leg definitions for an opportunity
pub fn leg_definitions(
    opportunity: &ArbitrageOpportunity,
    amount: f64,
    buy_price: f64,
    sell_price: f64,
) -> (StrategyDefinition, StrategyDefinition) {
    let buy = leg(
        &format!("{}-buy", opportunity.id),
        &opportunity.buy_exchange,
        &opportunity.trading_pair,
        "buy",
        amount,
        buy_price,
    );
    let sell = leg(
        &format!("{}-sell", opportunity.id),
        &opportunity.sell_exchange,
        &opportunity.trading_pair,
        "sell",
        amount,
        sell_price,
    );
    (buy, sell)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices(entries: &[(&str, f64)]) -> Vec<(String, f64)> {
        entries.iter().map(|(e, p)| (e.to_string(), *p)).collect()
    }

    #[test]
    fn test_detects_spread_at_threshold() {
        let found = find_opportunities(
            "BTC-USDT",
            &prices(&[("binance", 100.0), ("kraken", 101.0), ("okx", 100.2)]),
            0.5,
        );

        // binance/kraken 1%, okx/kraken ~0.8%, binance/okx 0.2%
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].buy_exchange, "binance");
        assert_eq!(found[0].sell_exchange, "kraken");
        assert!((found[0].profit_percent - 1.0).abs() < 1e-9);
        assert_eq!(found[1].buy_exchange, "okx");
        assert_eq!(found[1].sell_exchange, "kraken");
    }

    #[test]
    fn test_buy_side_is_cheaper_regardless_of_order() {
        let found = find_opportunities("ETH-USDT", &prices(&[("kraken", 2020.0), ("binance", 2000.0)]), 0.5);
        assert_eq!(found[0].buy_exchange, "binance");
        assert_eq!(found[0].buy_price, 2000.0);
        assert_eq!(found[0].sell_price, 2020.0);
    }

    #[test]
    fn test_collapsed_spread_is_rejected() {
        assert!(revalidate(100.0, 101.0, 0.5).is_ok());
        let err = revalidate(100.0, 100.1, 0.5).unwrap_err();
        assert!(err.contains("below threshold"));
        assert!(revalidate(101.0, 100.0, 0.5).unwrap_err().contains("reversed"));
    }

    #[test]
    fn test_order_size_caps() {
        let config = CoordinatorConfig::default();
        // 1000 / 2000 = 0.5 units
        assert_eq!(order_size(2000.0, &config), 0.5);
        // 1000 / 100 = 10 units, capped at 1
        assert_eq!(order_size(100.0, &config), 1.0);
        assert_eq!(order_size(0.0, &config), 0.0);
    }

    #[test]
    fn test_legs_are_simulated_and_sized() {
        let opportunity = find_opportunities("BTC-USDT", &prices(&[("a", 100.0), ("b", 102.0)]), 0.5)
            .remove(0);
        let (buy, sell) = leg_definitions(&opportunity, 0.75, 100.0, 102.0);

        assert_eq!(buy.exchange, "a");
        assert_eq!(sell.exchange, "b");
        assert_eq!(buy.parameters["side"].as_str(), Some("buy"));
        assert_eq!(sell.parameters["target_amount"].as_f64(), Some(0.75));
        assert!(buy.execution.is_simulated() && sell.execution.is_simulated());
        assert_eq!(buy.execution.order_amount, 0.75);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_opportunities_buy_low_sell_high(
                quotes in proptest::collection::vec(1.0f64..100_000.0, 2..6),
                min in 0.01f64..5.0,
            ) {
                let named: Vec<(String, f64)> = quotes
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (format!("ex{}", i), *p))
                    .collect();
                for opp in find_opportunities("BTC-USDT", &named, min) {
                    prop_assert!(opp.buy_price < opp.sell_price);
                    prop_assert!(opp.profit_percent >= min);
                    prop_assert_ne!(&opp.buy_exchange, &opp.sell_exchange);
                }
            }
        }
    }
}
