//! Environment configuration for the binaries

use crate::capability::{CapabilityConfig, DEFAULT_CAPABILITY_TIMEOUT};
use crate::error::OrchestrationError;
use crate::execution::{RunConfig, DEFAULT_RECURSION_LIMIT};
use crate::model::gemini::DEFAULT_GEMINI_MODEL;
use crate::tools::market::DEFAULT_ALPACA_DATA_URL;
use crate::tools::search::DEFAULT_SEARCH_URL;
use crate::Result;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub recursion_limit: usize,
    pub capability_timeout: Duration,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub alpaca_api_key: Option<String>,
    pub alpaca_secret_key: Option<String>,
    pub alpaca_data_url: String,
    pub search_api_url: String,
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let recursion_limit = match var("GRAPH_RECURSION_LIMIT") {
            Some(raw) => parse_number::<usize>("GRAPH_RECURSION_LIMIT", &raw)?,
            None => DEFAULT_RECURSION_LIMIT,
        };
        if recursion_limit == 0 {
            return Err(OrchestrationError::Config(
                "GRAPH_RECURSION_LIMIT must be at least 1".to_string(),
            ));
        }

        let capability_timeout = match var("CAPABILITY_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_number::<u64>("CAPABILITY_TIMEOUT_SECS", &raw)?),
            None => DEFAULT_CAPABILITY_TIMEOUT,
        };

        Ok(Self {
            recursion_limit,
            capability_timeout,
            gemini_api_key: var("GEMINI_API_KEY"),
            gemini_model: var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            alpaca_api_key: var("ALPACA_API_KEY"),
            alpaca_secret_key: var("ALPACA_SECRET_KEY"),
            alpaca_data_url: var("ALPACA_DATA_URL")
                .unwrap_or_else(|| DEFAULT_ALPACA_DATA_URL.to_string()),
            search_api_url: var("SEARCH_API_URL").unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
        })
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig::default().with_recursion_limit(self.recursion_limit)
    }

    pub fn capability_config(&self) -> CapabilityConfig {
        CapabilityConfig::with_timeout(self.capability_timeout)
    }

    /// Both market-data keys, or `None` when either is missing.
    pub fn alpaca_credentials(&self) -> Option<(&str, &str)> {
        match (&self.alpaca_api_key, &self.alpaca_secret_key) {
            (Some(key), Some(secret)) => Some((key.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| OrchestrationError::Config(format!("{} must be a whole number, got '{}'", key, raw)))
}
