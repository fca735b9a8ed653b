//! BTC price oracle: public HTTP sources tried in order, then the last good quote.

use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::types::PriceQuote;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("price source {source_name} failed: {reason}")]
    Source { source_name: String, reason: String },

    #[error("no price available: every source failed and the cached quote is missing or stale")]
    Unavailable,
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current BTC/USD price. Never fabricated: either a live quote or a recent cached one.
    async fn get_price(&self) -> Result<PriceQuote, OracleError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// `{"symbol":"BTCUSDT","price":"50000.00"}`
    Binance,
    /// `{"data":{"base":"BTC","currency":"USD","amount":"50000.00"}}`
    Coinbase,
}

#[derive(Debug, Clone)]
pub struct PriceSource {
    pub name: String,
    pub url: String,
    pub format: SourceFormat,
}

impl PriceSource {
    pub fn defaults() -> Vec<PriceSource> {
        vec![
            PriceSource {
                name: "binance".to_string(),
                url: "https://api.binance.com/api/v3/ticker/price?symbol=BTCUSDT".to_string(),
                format: SourceFormat::Binance,
            },
            PriceSource {
                name: "coinbase".to_string(),
                url: "https://api.coinbase.com/v2/prices/BTC-USD/spot".to_string(),
                format: SourceFormat::Coinbase,
            },
        ]
    }
}

#[derive(Deserialize)]
struct BinanceTicker {
    price: String,
}

#[derive(Deserialize)]
struct CoinbaseSpot {
    data: CoinbaseAmount,
}

#[derive(Deserialize)]
struct CoinbaseAmount {
    amount: String,
}

/// Extract a positive price from a source body.
pub fn parse_price(format: SourceFormat, body: &str) -> Result<Decimal, String> {
    let raw = match format {
        SourceFormat::Binance => serde_json::from_str::<BinanceTicker>(body).map(|t| t.price),
        SourceFormat::Coinbase => serde_json::from_str::<CoinbaseSpot>(body).map(|s| s.data.amount),
    }
    .map_err(|e| format!("unexpected body: {}", e))?;

    let price = Decimal::from_str(raw.trim()).map_err(|e| format!("bad price {}: {}", raw, e))?;
    if price <= Decimal::ZERO {
        return Err(format!("non-positive price {}", price));
    }
    Ok(price)
}

pub struct HttpPriceOracle {
    client: reqwest::Client,
    sources: Vec<PriceSource>,
    timeout: Duration,
    max_staleness: chrono::Duration,
    clock: Arc<dyn Clock>,
    last_quote: RwLock<Option<PriceQuote>>,
}

impl HttpPriceOracle {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        Self::with_sources(config, clock, PriceSource::defaults())
    }

    pub fn with_sources(config: &Config, clock: Arc<dyn Clock>, sources: Vec<PriceSource>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.oracle_timeout())
            .connect_timeout(Duration::from_millis(500))
            .build()?;

        Ok(Self {
            client,
            sources,
            timeout: config.oracle_timeout(),
            max_staleness: config.price_max_staleness(),
            clock,
            last_quote: RwLock::new(None),
        })
    }

    async fn fetch(&self, source: &PriceSource) -> Result<Decimal, OracleError> {
        let failed = |reason: String| OracleError::Source { source_name: source.name.clone(), reason };

        let request = async {
            let response = self
                .client
                .get(&source.url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| failed(e.to_string()))?;
            response.text().await.map_err(|e| failed(e.to_string()))
        };

        let body = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| failed("timed out".to_string()))??;

        parse_price(source.format, &body).map_err(failed)
    }

    fn remember(&self, quote: &PriceQuote) {
        let mut last = self.last_quote.write().unwrap_or_else(|e| e.into_inner());
        *last = Some(quote.clone());
    }

    /// Last good quote if it is still within the staleness bound.
    pub fn cached_quote(&self) -> Option<PriceQuote> {
        let last = self.last_quote.read().unwrap_or_else(|e| e.into_inner());
        let quote = last.as_ref()?;
        (self.clock.now() - quote.timestamp <= self.max_staleness).then(|| quote.clone())
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn get_price(&self) -> Result<PriceQuote, OracleError> {
        for source in &self.sources {
            match self.fetch(source).await {
                Ok(price) => {
                    let quote = PriceQuote { price, timestamp: self.clock.now(), source: source.name.clone() };
                    debug!("BTC price {} from {}", price, source.name);
                    self.remember(&quote);
                    return Ok(quote);
                }
                Err(e) => warn!("{}", e),
            }
        }

        match self.cached_quote() {
            Some(quote) => {
                warn!("All price sources failed, serving cached quote from {}", quote.timestamp);
                Ok(quote)
            }
            None => Err(OracleError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_both_source_formats() {
        assert_eq!(
            parse_price(SourceFormat::Binance, r#"{"symbol":"BTCUSDT","price":"50123.45000000"}"#).unwrap(),
            dec!(50123.45)
        );
        assert_eq!(
            parse_price(SourceFormat::Coinbase, r#"{"data":{"base":"BTC","currency":"USD","amount":"51000.5"}}"#)
                .unwrap(),
            dec!(51000.5)
        );
        assert!(parse_price(SourceFormat::Binance, r#"{"price":"0"}"#).is_err());
        assert!(parse_price(SourceFormat::Coinbase, r#"{"error":"down"}"#).is_err());
    }

    #[test]
    fn cached_quote_respects_staleness() {
        let clock = Arc::new(ManualClock::default());
        let config = Config { price_max_staleness_secs: 120, ..Config::default() };
        let oracle = HttpPriceOracle::with_sources(&config, clock.clone(), vec![]).unwrap();
        assert!(oracle.cached_quote().is_none());

        oracle.remember(&PriceQuote { price: dec!(50000), timestamp: clock.now(), source: "binance".to_string() });
        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(oracle.cached_quote().map(|q| q.price), Some(dec!(50000)));

        clock.advance(chrono::Duration::seconds(1));
        assert!(oracle.cached_quote().is_none());
    }

    #[tokio::test]
    async fn no_sources_and_no_cache_is_unavailable() {
        let clock = Arc::new(ManualClock::default());
        let oracle = HttpPriceOracle::with_sources(&Config::default(), clock, vec![]).unwrap();
        assert!(matches!(oracle.get_price().await, Err(OracleError::Unavailable)));
    }
}
