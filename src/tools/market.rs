//! Market data: latest stock quotes and the `get_stock_price` tool

use super::Tool;
use crate::error::OrchestrationError;
use crate::models::{ParamType, ToolSchema};
use crate::Result;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ALPACA_DATA_URL: &str = "https://data.alpaca.markets";

#[async_trait::async_trait]
pub trait QuoteSource: Send + Sync {
    /// Latest ask price for an upper-case ticker symbol.
    async fn latest_ask(&self, symbol: &str) -> Result<f64>;
}

/// Alpaca market data `quotes/latest` endpoint.
pub struct AlpacaQuoteSource {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
}

impl AlpacaQuoteSource {
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: DEFAULT_ALPACA_DATA_URL.to_string(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct LatestQuoteResponse {
    quote: Quote,
}

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(rename = "ap")]
    ask_price: f64,
}

#[async_trait::async_trait]
impl QuoteSource for AlpacaQuoteSource {
    async fn latest_ask(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/v2/stocks/{}/quotes/latest", self.base_url, symbol);

        let response = self
            .client
            .get(url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::Capability(format!("Quote request failed for {}: {}", symbol, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestrationError::Capability(format!(
                "Market data API returned {} for {}: {}",
                status, symbol, body
            )));
        }

        let parsed: LatestQuoteResponse = response.json().await.map_err(|e| {
            OrchestrationError::Capability(format!("Invalid quote response: {}", e))
        })?;
        debug!(symbol, ask = parsed.quote.ask_price, "Fetched latest quote");
        Ok(parsed.quote.ask_price)
    }
}

/// Fixed prices, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticQuoteSource {
    prices: HashMap<String, f64>,
}

impl StaticQuoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, symbol: &str, price: f64) -> Self {
        self.prices.insert(symbol.to_ascii_uppercase(), price);
        self
    }
}

#[async_trait::async_trait]
impl QuoteSource for StaticQuoteSource {
    async fn latest_ask(&self, symbol: &str) -> Result<f64> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| OrchestrationError::Capability(format!("no quote for {}", symbol)))
    }
}

/// `get_stock_price(symbol)` answering "{SYMBOL} current ask price is ${price}".
pub struct StockPriceTool {
    schema: ToolSchema,
    source: Option<Arc<dyn QuoteSource>>,
}

impl StockPriceTool {
    /// `None` models missing market-data credentials: every call fails with a
    /// capability error.
    pub fn new(source: Option<Arc<dyn QuoteSource>>) -> Self {
        Self {
            schema: ToolSchema::new("get_stock_price", "Look up the current price of a stock.")
                .param(
                    "symbol",
                    ParamType::String,
                    "Ticker symbol, e.g. NVDA, AAPL, TSLA",
                ),
            source,
        }
    }
}

#[async_trait::async_trait]
impl Tool for StockPriceTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, arguments: &Value) -> Result<String> {
        let source = self.source.as_ref().ok_or_else(|| {
            OrchestrationError::Capability(
                "ALPACA_API_KEY / ALPACA_SECRET_KEY are not configured".to_string(),
            )
        })?;

        let symbol = arguments
            .get("symbol")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                OrchestrationError::InvalidToolInput("Expected non-empty 'symbol'".to_string())
            })?;

        let price = source.latest_ask(&symbol).await?;
        Ok(format!("{} current ask price is ${}", symbol, price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stock_price_uppercases_symbol() {
        let source: Arc<dyn QuoteSource> =
            Arc::new(StaticQuoteSource::new().with_price("nvda", 120.5));
        let tool = StockPriceTool::new(Some(source));

        let answer = tool.execute(&json!({"symbol": "nvda"})).await.unwrap();
        assert_eq!(answer, "NVDA current ask price is $120.5");
    }

    #[tokio::test]
    async fn test_missing_credentials_is_capability_error() {
        let tool = StockPriceTool::new(None);
        let result = tool.execute(&json!({"symbol": "AAPL"})).await;
        assert!(matches!(result, Err(OrchestrationError::Capability(_))));
    }

    #[test]
    fn test_quote_response_parsing() {
        let raw = json!({"symbol": "AAPL", "quote": {"ap": 189.12, "bp": 189.1, "as": 3}});
        let parsed: LatestQuoteResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.quote.ask_price, 189.12);
    }
}
