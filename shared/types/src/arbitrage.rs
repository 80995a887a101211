//! Cross-exchange arbitrage opportunities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opportunity lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    Detected,
    Executing,
    Executed,
    Rejected,
    Failed,
}

/// A price discrepancy for one pair across two exchanges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub id: String,
    pub trading_pair: String,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub buy_price: f64,
    pub sell_price: f64,
    /// Spread in percent of the lower price
    pub profit_percent: f64,
    pub detected_at: DateTime<Utc>,
    pub status: OpportunityStatus,
}

/// Spread between two prices in percent of the lower one
pub fn spread_percent(price_a: f64, price_b: f64) -> f64 {
    let low = price_a.min(price_b);
    if low <= 0.0 {
        return 0.0;
    }
    (price_a - price_b).abs() / low * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spread_percent_symmetric() {
        assert!((spread_percent(100.0, 101.0) - 1.0).abs() < 1e-9);
        assert!((spread_percent(101.0, 100.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_spread_percent_invalid_price() {
        assert_eq!(spread_percent(0.0, 100.0), 0.0);
    }
}
