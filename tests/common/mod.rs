//! Shared fixtures: in-memory database, wiremock upstream, seeded key, account and prices
#![allow(dead_code)]

use ai_router::{
    accounts::{FundingAccount, NewAccount, Tier},
    config::{
        Config, DatabaseConfig, PricingConfig, SecurityConfig, SelectionConfig, ServerConfig, TiersConfig,
        UpstreamConfig,
    },
    db,
    handlers::chat_completions::AppState,
    pricing::ModelPrice,
    server,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::MockServer;

pub const ADMIN_TOKEN: &str = "admin-secret";
pub const USER_ID: &str = "user-1";
pub const DISCOUNTED_CREDENTIAL: &str = "sk-or-v1-discounted";

/// Prompt tokens are free, completions cost $0.000125 each, so a
/// request with `max_tokens: 1000` estimates to exactly $0.125 upstream
/// ($0.10 for the client on the discounted tier).
pub const METERED_MODEL: &str = "test/metered";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub upstream: MockServer,
    pub key: String,
}

pub fn test_config(upstream_uri: &str, timeout_seconds: u64) -> Config {
    Config {
        server: ServerConfig::default(),
        database: DatabaseConfig::default(),
        upstream: UpstreamConfig {
            base_url: format!("{}/api/v1", upstream_uri),
            timeout_seconds,
            site_url: "https://router.test".to_string(),
            app_name: "Router Test".to_string(),
        },
        pricing: PricingConfig::default(),
        selection: SelectionConfig::default(),
        tiers: TiersConfig::default(),
        security: SecurityConfig {
            encryption_key: "integration-test-key".to_string(),
            admin_token: Some(ADMIN_TOKEN.to_string()),
        },
    }
}

pub fn metered_price(fetched_at: DateTime<Utc>) -> ModelPrice {
    ModelPrice {
        model_id: METERED_MODEL.to_string(),
        provider: "test".to_string(),
        display_name: "Metered Test Model".to_string(),
        context_length: Some(8192),
        prompt_price_per_token: Decimal::ZERO,
        completion_price_per_token: dec!(0.000125),
        fetched_at,
        is_active: true,
    }
}

impl TestApp {
    /// App with a fresh price for the metered model and no accounts or balances
    pub async fn empty() -> Self {
        Self::with_timeout(5).await
    }

    pub async fn with_timeout(timeout_seconds: u64) -> Self {
        let upstream = MockServer::start().await;
        let config = test_config(&upstream.uri(), timeout_seconds);
        let pool = db::connect_in_memory().await.unwrap();

        let state = server::build_state(config, pool, reqwest::Client::new()).await.unwrap();
        state.pricing.insert(metered_price(Utc::now())).await.unwrap();

        let issued = state.keys.issue(USER_ID, "test key", None, None).await.unwrap();

        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let router = server::create_router(state.clone(), Arc::new(handle));

        Self {
            router,
            state,
            upstream,
            key: issued.key,
        }
    }

    /// App with a $100 discounted account and a client balance of `balance`
    pub async fn funded(balance: Decimal) -> Self {
        let app = Self::empty().await;
        app.add_account(Tier::Discounted, DISCOUNTED_CREDENTIAL, dec!(100)).await;
        app.state.ledger.deposit(USER_ID, balance).await.unwrap();
        app
    }

    pub async fn add_account(&self, tier: Tier, credential: &str, balance: Decimal) -> FundingAccount {
        self.state
            .selector
            .store()
            .create(NewAccount::new(format!("{}-account", tier), tier, credential, balance))
            .await
            .unwrap()
    }

    pub async fn balance(&self) -> Decimal {
        self.state.ledger.balance(USER_ID).await.unwrap().map(|b| b.balance).unwrap_or_default()
    }

    pub async fn record_count(&self) -> i64 {
        self.state.request_log.count_for_user(USER_ID).await.unwrap()
    }

    pub async fn chat(&self, body: Value) -> (StatusCode, Value) {
        self.chat_with_key(&self.key, body).await
    }

    pub async fn chat_with_key(&self, key: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", key))
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}

pub fn chat_body(model: &str, max_tokens: u64) -> Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "Say hello"}],
        "max_tokens": max_tokens,
    })
}

pub fn completion_response(prompt_tokens: u64, completion_tokens: u64) -> Value {
    serde_json::json!({
        "id": "gen-123",
        "object": "chat.completion",
        "model": METERED_MODEL,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello!"},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}
