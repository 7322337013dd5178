use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-token pricing of one model as quoted by the upstream catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model_id: String,
    pub provider: String,
    pub display_name: String,
    pub context_length: Option<i64>,
    /// USD per prompt token
    #[serde(with = "rust_decimal::serde::str")]
    pub prompt_price_per_token: Decimal,
    /// USD per completion token
    #[serde(with = "rust_decimal::serde::str")]
    pub completion_price_per_token: Decimal,
    pub fetched_at: DateTime<Utc>,
    pub is_active: bool,
}

impl ModelPrice {
    /// Fresh while `now - fetched_at < ttl`
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.fetched_at) < ttl
    }

    /// Provider is the part of the model id before the first `/`
    pub fn provider_of(model_id: &str) -> &str {
        model_id.split_once('/').map(|(p, _)| p).unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn price(fetched_at: DateTime<Utc>) -> ModelPrice {
        ModelPrice {
            model_id: "openai/gpt-4o".into(),
            provider: "openai".into(),
            display_name: "GPT-4o".into(),
            context_length: Some(128_000),
            prompt_price_per_token: dec!(0.0000025),
            completion_price_per_token: dec!(0.00001),
            fetched_at,
            is_active: true,
        }
    }

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        let ttl = Duration::hours(1);

        assert!(price(now - Duration::minutes(59)).is_fresh(ttl, now));
        assert!(!price(now - Duration::hours(1)).is_fresh(ttl, now));
        assert!(!price(now - Duration::hours(2)).is_fresh(ttl, now));
    }

    #[test]
    fn test_provider_of() {
        assert_eq!(ModelPrice::provider_of("anthropic/claude-3.5-sonnet"), "anthropic");
        assert_eq!(ModelPrice::provider_of("gpt-4o"), "unknown");
    }
}
