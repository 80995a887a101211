//! Exchange liveness probes

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("Exchange unreachable: {0}")]
    Unreachable(String),

    #[error("Probe timed out")]
    Timeout,

    #[error("Exchange returned status {0}")]
    BadStatus(u16),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),
}

/// Checks whether an exchange answers and how fast
#[async_trait]
pub trait ExchangeProbe: Send + Sync {
    /// Round-trip latency of a successful probe
    async fn probe(&self, exchange: &str) -> Result<Duration, ProbeError>;
}

/// Probes a status URL per exchange with a plain GET
pub struct HttpExchangeProbe {
    client: Client,
    urls: HashMap<String, String>,
}

impl HttpExchangeProbe {
    pub fn new(urls: HashMap<String, String>, timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        Ok(Self { client, urls })
    }
}

#[async_trait]
impl ExchangeProbe for HttpExchangeProbe {
    async fn probe(&self, exchange: &str) -> Result<Duration, ProbeError> {
        let url = self
            .urls
            .get(exchange)
            .ok_or_else(|| ProbeError::UnknownExchange(exchange.to_string()))?;

        let started = Instant::now();
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Unreachable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(ProbeError::BadStatus(response.status().as_u16()));
        }
        Ok(started.elapsed())
    }
}
