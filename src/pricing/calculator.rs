//! Cost Calculator
//!
//! Pure functions turning token counts or an upstream-reported cost into the
//! figures a request is billed and accounted with. Every output is rounded to
//! storage precision, so `profit == client_cost - operator_cost` exactly.

use crate::accounts::models::Tier;
use crate::money::round;
use crate::pricing::models::ModelPrice;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

/// Cost/margin parameters of the funding account that paid for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierParameters {
    pub tier: Tier,
    /// Fraction of the upstream list price the operator pays
    pub cost_basis: Decimal,
    /// Fraction of the upstream list price charged to the client
    pub client_multiplier: Decimal,
    /// Investor's cut on top of cost basis (zero for operator-owned accounts)
    pub commission_rate: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSource {
    /// Token count × catalog price; only used for the reservation
    TokenEstimate,
    /// Cost reported by the upstream
    UpstreamReported,
    /// Token count × catalog price, computed from actual usage because the
    /// upstream did not report a cost
    TokenActual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CostBreakdown {
    pub upstream_cost: Decimal,
    pub operator_cost: Decimal,
    pub client_cost: Decimal,
    pub profit: Decimal,
    pub savings: Decimal,
    pub source: CostSource,
}

impl CostBreakdown {
    pub fn zero(source: CostSource) -> Self {
        Self {
            upstream_cost: Decimal::ZERO,
            operator_cost: Decimal::ZERO,
            client_cost: Decimal::ZERO,
            profit: Decimal::ZERO,
            savings: Decimal::ZERO,
            source,
        }
    }

    /// Book a settlement shortfall as operator loss
    pub fn with_shortfall(mut self, shortfall: Decimal) -> Self {
        self.profit -= shortfall;
        self
    }
}

/// Token usage reported by the upstream response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Upstream's own cost figure (includes surcharges the token formula misses)
    pub reported_cost: Option<Decimal>,
}

impl Usage {
    /// Read the `usage` block of a chat completion response
    pub fn from_response(body: &serde_json::Value) -> Self {
        let usage = &body["usage"];
        let reported_cost = match &usage["cost"] {
            serde_json::Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .filter(|cost: &Decimal| !cost.is_sign_negative());

        Self {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            reported_cost,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// `prompt_tokens × prompt_price + completion_tokens × completion_price`
pub fn token_cost(price: &ModelPrice, prompt_tokens: u64, completion_tokens: u64) -> Decimal {
    Decimal::from(prompt_tokens) * price.prompt_price_per_token
        + Decimal::from(completion_tokens) * price.completion_price_per_token
}

/// Derive operator cost, client cost, profit and savings from an upstream cost
pub fn breakdown(upstream_cost: Decimal, params: &TierParameters, source: CostSource) -> CostBreakdown {
    let upstream_cost = round(upstream_cost.max(Decimal::ZERO));
    let operator_cost = round(upstream_cost * (params.cost_basis + params.commission_rate));
    let client_cost = round(upstream_cost * params.client_multiplier);
    let savings = (upstream_cost - client_cost).max(Decimal::ZERO);

    CostBreakdown {
        upstream_cost,
        operator_cost,
        client_cost,
        profit: client_cost - operator_cost,
        savings,
        source,
    }
}

/// Pre-flight estimate used for the reservation
pub fn estimate(
    price: &ModelPrice,
    prompt_tokens: u64,
    completion_tokens: u64,
    params: &TierParameters,
) -> CostBreakdown {
    breakdown(
        token_cost(price, prompt_tokens, completion_tokens),
        params,
        CostSource::TokenEstimate,
    )
}

/// Settlement cost. The upstream-reported figure always wins over the token formula.
pub fn actual(price: &ModelPrice, usage: &Usage, params: &TierParameters) -> CostBreakdown {
    match usage.reported_cost {
        Some(cost) => breakdown(cost, params, CostSource::UpstreamReported),
        None => breakdown(
            token_cost(price, usage.prompt_tokens, usage.completion_tokens),
            params,
            CostSource::TokenActual,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn gpt4o() -> ModelPrice {
        ModelPrice {
            model_id: "openai/gpt-4o".into(),
            provider: "openai".into(),
            display_name: "GPT-4o".into(),
            context_length: None,
            prompt_price_per_token: dec!(0.0000025),
            completion_price_per_token: dec!(0.00001),
            fetched_at: Utc::now(),
            is_active: true,
        }
    }

    fn discounted() -> TierParameters {
        TierParameters {
            tier: Tier::Discounted,
            cost_basis: dec!(0.30),
            client_multiplier: dec!(0.80),
            commission_rate: Decimal::ZERO,
        }
    }

    fn investor() -> TierParameters {
        TierParameters {
            tier: Tier::Investor,
            cost_basis: dec!(0.30),
            client_multiplier: dec!(0.80),
            commission_rate: dec!(0.01),
        }
    }

    fn regular() -> TierParameters {
        TierParameters {
            tier: Tier::Regular,
            cost_basis: dec!(1.00),
            client_multiplier: dec!(1.10),
            commission_rate: Decimal::ZERO,
        }
    }

    #[test]
    fn test_token_estimate() {
        // 1000 × 0.0000025 + 500 × 0.00001 = 0.0025 + 0.005
        let cost = estimate(&gpt4o(), 1000, 500, &discounted());
        assert_eq!(cost.upstream_cost, dec!(0.0075));
        assert_eq!(cost.operator_cost, dec!(0.00225));
        assert_eq!(cost.client_cost, dec!(0.006));
        assert_eq!(cost.profit, dec!(0.00375));
        assert_eq!(cost.savings, dec!(0.0015));
        assert_eq!(cost.source, CostSource::TokenEstimate);
    }

    #[test]
    fn test_investor_commission_adds_to_operator_cost() {
        let cost = breakdown(dec!(1), &investor(), CostSource::UpstreamReported);
        assert_eq!(cost.operator_cost, dec!(0.31));
        assert_eq!(cost.client_cost, dec!(0.80));
        assert_eq!(cost.profit, dec!(0.49));
    }

    #[test]
    fn test_regular_tier_has_no_savings() {
        let cost = breakdown(dec!(1), &regular(), CostSource::UpstreamReported);
        assert_eq!(cost.client_cost, dec!(1.10));
        assert_eq!(cost.savings, Decimal::ZERO);
        assert_eq!(cost.profit, dec!(0.10));
    }

    #[test]
    fn test_reported_cost_wins() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 500,
            reported_cost: Some(dec!(0.02)),
        };
        let cost = actual(&gpt4o(), &usage, &discounted());
        assert_eq!(cost.upstream_cost, dec!(0.02));
        assert_eq!(cost.source, CostSource::UpstreamReported);

        let without = Usage { reported_cost: None, ..usage };
        let cost = actual(&gpt4o(), &without, &discounted());
        assert_eq!(cost.upstream_cost, dec!(0.0075));
        assert_eq!(cost.source, CostSource::TokenActual);
    }

    #[test]
    fn test_sub_nano_amounts_round() {
        // One prompt token of a very cheap model
        let mut price = gpt4o();
        price.prompt_price_per_token = dec!(0.0000000001);
        let cost = estimate(&price, 7, 0, &discounted());
        assert_eq!(cost.upstream_cost, dec!(0.000000001));
        assert_eq!(cost.profit, cost.client_cost - cost.operator_cost);
    }

    #[test]
    fn test_no_drift_over_many_requests() {
        let params = discounted();
        let mut total_client = Decimal::ZERO;
        for _ in 0..100_000 {
            total_client += breakdown(dec!(0.000012345), &params, CostSource::UpstreamReported).client_cost;
        }
        assert_eq!(total_client, dec!(0.9876));
    }

    #[test]
    fn test_usage_from_response() {
        let body = json!({
            "usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42, "cost": 0.00042}
        });
        let usage = Usage::from_response(&body);
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total_tokens(), 42);
        assert_eq!(usage.reported_cost, Some(dec!(0.00042)));

        let usage = Usage::from_response(&json!({"choices": []}));
        assert_eq!(usage, Usage::default());
    }

    #[test]
    fn test_shortfall_reduces_profit() {
        let cost = breakdown(dec!(1), &discounted(), CostSource::UpstreamReported).with_shortfall(dec!(0.2));
        assert_eq!(cost.profit, dec!(0.3));
    }
}
