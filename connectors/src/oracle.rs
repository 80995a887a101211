//! Market data: prices and balances per exchange

use async_trait::async_trait;
use botfleet_types::Retryable;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("Market data unavailable: {0}")]
    Unavailable(String),

    #[error("No market data for {0}")]
    NotFound(String),

    #[error("Invalid market data: {0}")]
    Invalid(String),
}

impl Retryable for OracleError {
    fn is_retryable(&self) -> bool {
        matches!(self, OracleError::Unavailable(_))
    }
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OracleError::Invalid(err.to_string())
        } else {
            OracleError::Unavailable(err.to_string())
        }
    }
}

/// Current price per (exchange, trading pair)
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn price(&self, exchange: &str, trading_pair: &str) -> Result<f64, OracleError>;
}

/// Asset balances held on an exchange
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    async fn balances(&self, exchange: &str) -> Result<HashMap<String, f64>, OracleError>;
}

#[derive(Deserialize)]
struct PriceResponse {
    price: f64,
}

#[derive(Deserialize)]
struct BalancesResponse {
    balances: HashMap<String, f64>,
}

/// HTTP market data service client
pub struct HttpMarketData {
    client: Client,
    base_url: String,
}

impl HttpMarketData {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, OracleError> {
        let response = self.client.get(format!("{}{}", self.base_url, path)).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(OracleError::NotFound(path.to_string())),
            status => Err(OracleError::Unavailable(format!("{} returned {}", path, status))),
        }
    }
}

#[async_trait]
impl PriceOracle for HttpMarketData {
    async fn price(&self, exchange: &str, trading_pair: &str) -> Result<f64, OracleError> {
        let response = self
            .get(&format!("/prices/{}/{}", exchange, trading_pair))
            .await?;
        let body: PriceResponse = response.json().await?;
        if !body.price.is_finite() || body.price <= 0.0 {
            return Err(OracleError::Invalid(format!(
                "{} {} price {}",
                exchange, trading_pair, body.price
            )));
        }
        Ok(body.price)
    }
}

#[async_trait]
impl BalanceProvider for HttpMarketData {
    async fn balances(&self, exchange: &str) -> Result<HashMap<String, f64>, OracleError> {
        let response = self.get(&format!("/balances/{}", exchange)).await?;
        let body: BalancesResponse = response.json().await?;
        Ok(body.balances)
    }
}
