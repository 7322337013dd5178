//! Upstream model catalog
//!
//! The catalog is `GET {base_url}/models`, OpenRouter format:
//! `{"data": [{"id", "name", "context_length", "pricing": {"prompt", "completion"}}]}`
//! with per-token USD prices as decimal strings.

use crate::money::parse_decimal;
use crate::pricing::models::ModelPrice;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request timed out after {0:?}")]
    Timeout(Duration),
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog returned HTTP {0}")]
    Status(u16),
    #[error("failed to parse catalog: {0}")]
    Parse(String),
}

/// Source of model prices. Substituted with a fake in tests.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Vec<ModelPrice>, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    data: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    context_length: Option<i64>,
    #[serde(default)]
    pricing: Option<CatalogPricing>,
}

#[derive(Debug, Deserialize)]
struct CatalogPricing {
    #[serde(default)]
    prompt: Option<serde_json::Value>,
    #[serde(default)]
    completion: Option<serde_json::Value>,
}

/// Prices come as strings, occasionally as bare numbers
fn price_value(value: Option<&serde_json::Value>) -> Option<Decimal> {
    match value? {
        serde_json::Value::String(s) => parse_decimal(s).ok(),
        serde_json::Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
        _ => None,
    }
}

/// Parse a catalog body. Malformed or negative entries are skipped, as are
/// free (0/0) models when `skip_free` is set.
pub fn parse_catalog(body: &str, skip_free: bool, fetched_at: DateTime<Utc>) -> Result<Vec<ModelPrice>, CatalogError> {
    let response: CatalogResponse =
        serde_json::from_str(body).map_err(|e| CatalogError::Parse(e.to_string()))?;

    let mut prices = Vec::with_capacity(response.data.len());
    let mut skipped = 0usize;

    for entry in response.data {
        let Some(pricing) = entry.pricing.as_ref() else {
            skipped += 1;
            continue;
        };
        let (Some(prompt), Some(completion)) = (
            price_value(pricing.prompt.as_ref()),
            price_value(pricing.completion.as_ref()),
        ) else {
            skipped += 1;
            continue;
        };

        if prompt.is_sign_negative() || completion.is_sign_negative() {
            skipped += 1;
            continue;
        }
        if skip_free && prompt.is_zero() && completion.is_zero() {
            skipped += 1;
            continue;
        }

        prices.push(ModelPrice {
            provider: ModelPrice::provider_of(&entry.id).to_string(),
            display_name: entry.name.unwrap_or_else(|| entry.id.clone()),
            model_id: entry.id,
            context_length: entry.context_length,
            prompt_price_per_token: prompt,
            completion_price_per_token: completion,
            fetched_at,
            is_active: true,
        });
    }

    debug!(parsed = prices.len(), skipped, "Parsed model catalog");
    Ok(prices)
}

/// Catalog served by the upstream API
pub struct OpenRouterCatalog {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    skip_free: bool,
}

impl OpenRouterCatalog {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration, skip_free: bool) -> Self {
        Self {
            client,
            url: format!("{}/models", base_url.trim_end_matches('/')),
            timeout,
            skip_free,
        }
    }
}

#[async_trait]
impl CatalogSource for OpenRouterCatalog {
    async fn fetch_catalog(&self) -> Result<Vec<ModelPrice>, CatalogError> {
        info!("Fetching model catalog from: {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CatalogError::Timeout(self.timeout)
                } else {
                    CatalogError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        parse_catalog(&body, self.skip_free, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const BODY: &str = r#"{
        "data": [
            {"id": "openai/gpt-4o", "name": "OpenAI: GPT-4o", "context_length": 128000,
             "pricing": {"prompt": "0.0000025", "completion": "0.00001"}},
            {"id": "meta-llama/llama-3-8b:free", "name": "Llama 3 8B (free)",
             "pricing": {"prompt": "0", "completion": "0"}},
            {"id": "broken/model", "pricing": {"prompt": "abc", "completion": "0.1"}},
            {"id": "no-pricing/model"},
            {"id": "router/auto", "pricing": {"prompt": "-1", "completion": "-1"}},
            {"id": "numeric/model", "pricing": {"prompt": 0.000001, "completion": 0.000002}}
        ]
    }"#;

    #[test]
    fn test_parse_catalog() {
        let prices = parse_catalog(BODY, true, Utc::now()).unwrap();
        let ids: Vec<&str> = prices.iter().map(|p| p.model_id.as_str()).collect();
        assert_eq!(ids, vec!["openai/gpt-4o", "numeric/model"]);

        let gpt = &prices[0];
        assert_eq!(gpt.provider, "openai");
        assert_eq!(gpt.display_name, "OpenAI: GPT-4o");
        assert_eq!(gpt.context_length, Some(128_000));
        assert_eq!(gpt.prompt_price_per_token, dec!(0.0000025));
        assert_eq!(gpt.completion_price_per_token, dec!(0.00001));
    }

    #[test]
    fn test_parse_catalog_keeps_free_models_when_asked() {
        let prices = parse_catalog(BODY, false, Utc::now()).unwrap();
        assert!(prices.iter().any(|p| p.model_id == "meta-llama/llama-3-8b:free"));
    }

    #[test]
    fn test_parse_catalog_rejects_garbage() {
        assert!(matches!(parse_catalog("not json", true, Utc::now()), Err(CatalogError::Parse(_))));
    }
}
