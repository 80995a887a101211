//! Portfolio rebalancing arithmetic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// One correction toward the target allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceOrder {
    pub asset: String,
    pub side: OrderSide,
    /// Deviation in quote currency
    pub value: f64,
    /// Deviation in asset units
    pub amount: f64,
    /// Strategy issued for this order, if deployment succeeded
    pub strategy_id: Option<String>,
}

/// Orders for every targeted asset whose value deviates from its target by
/// more than `threshold × total value`.
///
/// `values` is the current quote value per held asset; `prices` converts a
/// deviation to units (assets without a price are skipped).
pub fn plan_rebalance(
    values: &BTreeMap<String, f64>,
    prices: &BTreeMap<String, f64>,
    targets: &BTreeMap<String, f64>,
    threshold: f64,
) -> Vec<RebalanceOrder> {
    let total: f64 = values.values().sum();
    if total <= 0.0 {
        return Vec::new();
    }

    let mut orders = Vec::new();
    for (asset, target) in targets {
        let current = values.get(asset).copied().unwrap_or(0.0);
        let deviation = current - target * total;
        if deviation.abs() <= threshold * total {
            continue;
        }
        let Some(price) = prices.get(asset).copied().filter(|p| *p > 0.0) else {
            continue;
        };
        orders.push(RebalanceOrder {
            asset: asset.clone(),
            side: if deviation > 0.0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            value: deviation.abs(),
            amount: deviation.abs() / price,
            strategy_id: None,
        });
    }
    orders
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_overweight_sells_underweight_buys() {
        // 70/30 held against a 50/50 target
        let orders = plan_rebalance(
            &map(&[("BTC", 7_000.0), ("USDT", 3_000.0)]),
            &map(&[("BTC", 50_000.0), ("USDT", 1.0)]),
            &map(&[("BTC", 0.5), ("USDT", 0.5)]),
            0.01,
        );

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].asset, "BTC");
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert!((orders[0].value - 2_000.0).abs() < 1e-9);
        assert!((orders[0].amount - 0.04).abs() < 1e-9);
        assert_eq!(orders[1].side, OrderSide::Buy);
    }

    #[test]
    fn test_deviation_within_threshold_is_ignored() {
        // 50.5% vs 50%: 0.5% deviation under a 1% threshold
        let orders = plan_rebalance(
            &map(&[("BTC", 5_050.0), ("USDT", 4_950.0)]),
            &map(&[("BTC", 50_000.0), ("USDT", 1.0)]),
            &map(&[("BTC", 0.5), ("USDT", 0.5)]),
            0.01,
        );
        assert!(orders.is_empty());
    }

    #[test]
    fn test_missing_asset_is_bought() {
        let orders = plan_rebalance(
            &map(&[("USDT", 10_000.0)]),
            &map(&[("ETH", 2_000.0), ("USDT", 1.0)]),
            &map(&[("ETH", 0.2)]),
            0.01,
        );
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert!((orders[0].amount - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_portfolio_has_no_orders() {
        assert!(plan_rebalance(&BTreeMap::new(), &BTreeMap::new(), &map(&[("BTC", 1.0)]), 0.01).is_empty());
    }
}
