use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::time::Duration;

/// Install the Prometheus recorder and return the render handle
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    init_metric_descriptions();

    Ok(handle)
}

fn init_metric_descriptions() {
    describe_counter!(
        "ai_router_requests_total",
        "Proxied chat completion requests by outcome"
    );
    describe_counter!(
        "ai_router_client_cost_usd_total",
        "USD charged to client balances"
    );
    describe_counter!(
        "ai_router_profit_usd_total",
        "Operator profit in USD by funding tier"
    );
    describe_histogram!(
        "ai_router_request_duration_seconds",
        "End-to-end proxied request duration"
    );
    describe_gauge!("ai_router_info", "Router version information");

    gauge!("ai_router_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Record a terminal request outcome (`success` or an error type name)
pub fn record_outcome(outcome: &'static str) {
    counter!("ai_router_requests_total", "outcome" => outcome).increment(1);
}

/// Record money movement of a settled request.
///
/// Counters are integral, so amounts are accumulated in micro-dollars.
pub fn record_settlement(tier: &'static str, client_cost: Decimal, profit: Decimal) {
    counter!("ai_router_client_cost_usd_total").increment(to_micros(client_cost));
    counter!("ai_router_profit_usd_total", "tier" => tier).increment(to_micros(profit));
}

pub fn record_duration(outcome: &'static str, duration: Duration) {
    histogram!("ai_router_request_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
}

fn to_micros(amount: Decimal) -> u64 {
    (amount * Decimal::from(1_000_000))
        .round()
        .to_u64()
        .unwrap_or(0)
}
