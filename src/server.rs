use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::SqlitePool;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    accounts::{AccountSelector, AccountStore},
    auth::{self, AccessKeyStore},
    config::Config,
    crypto::CredentialCipher,
    db,
    handlers::{self, chat_completions::AppState},
    ledger::BalanceLedger,
    metrics,
    observability::RequestLog,
    pricing::{OpenRouterCatalog, PricingCache},
    signals::shutdown_signal,
    upstream::UpstreamClient,
};

/// Start the router server
///
/// This function:
/// 1. Initializes metrics
/// 2. Opens the database and wires the shared state
/// 3. Warms the pricing cache and starts its refresher
/// 4. Serves requests until SIGINT/SIGTERM, then drains connections
pub async fn start_server(config: Config) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics()?);

    let http_client = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;

    let pool = db::connect(&config.database.path).await?;
    let state = build_state(config, pool, http_client).await?;

    warm_pricing(&state).await?;
    let refresher = state
        .pricing
        .clone()
        .spawn_refresher(Duration::from_secs(state.config.pricing.ttl_seconds));

    let addr = SocketAddr::from((
        state.config.server.host.parse::<std::net::IpAddr>()?,
        state.config.server.port,
    ));

    info!("Starting AI Router on {}", addr);
    info!(
        "Configuration: upstream {}, {} cached prices, admin API {}",
        state.config.upstream.base_url,
        state.pricing.len(),
        if state.config.security.admin_token.is_some() { "enabled" } else { "disabled" }
    );

    let pool = state.pool.clone();
    let app = create_router(state, metrics_handle);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    refresher.abort();
    pool.close().await;
    info!("Server stopped gracefully");

    Ok(())
}

/// Wire every component around one database pool and one HTTP client
pub async fn build_state(config: Config, pool: SqlitePool, http_client: reqwest::Client) -> Result<AppState> {
    let config = Arc::new(config);

    let cipher = CredentialCipher::new(&config.security.encryption_key);
    let store = AccountStore::new(pool.clone(), cipher, config.tiers.clone());
    let selector = Arc::new(AccountSelector::new(pool.clone(), store, config.selection.clone()));

    Ok(AppState {
        pricing: Arc::new(build_pricing(&config, pool.clone(), http_client.clone())),
        upstream: UpstreamClient::new(http_client, &config.upstream),
        keys: AccessKeyStore::new(pool.clone()),
        ledger: BalanceLedger::new(pool.clone()),
        request_log: RequestLog::new(pool.clone()),
        selector,
        pool,
        config,
    })
}

/// Pricing cache backed by the upstream catalog and persisted to `model_prices`
pub fn build_pricing(config: &Config, pool: SqlitePool, http_client: reqwest::Client) -> PricingCache {
    let catalog = OpenRouterCatalog::new(
        http_client,
        &config.upstream.base_url,
        Duration::from_secs(config.pricing.refresh_timeout_seconds),
        config.pricing.skip_free_models,
    );

    PricingCache::new(
        Arc::new(catalog),
        Some(pool),
        Duration::from_secs(config.pricing.ttl_seconds),
    )
}

/// Load persisted prices, then try a full catalog sync. A failed sync is not
/// fatal: stored prices are served stale until the catalog comes back.
async fn warm_pricing(state: &AppState) -> Result<()> {
    let loaded = state.pricing.load_from_store().await?;

    if state.config.pricing.refresh_on_startup {
        if let Err(e) = state.pricing.refresh_all().await {
            warn!("Startup pricing sync failed, serving {} stored prices: {}", loaded, e);
        }
    }

    Ok(())
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: AppState, metrics_handle: Arc<PrometheusHandle>) -> Router {
    let body_limit = state.config.server.request_body_limit_bytes;

    // Authenticated client routes
    let auth_routes = Router::new()
        .route(
            "/v1/chat/completions",
            post(handlers::chat_completions::handle_chat_completions),
        )
        .route(
            "/chat/completions",
            post(handlers::chat_completions::handle_chat_completions),
        )
        .route("/v1/models", get(handlers::models::list_models))
        .layer(middleware::from_fn_with_state(
            state.keys.clone(),
            auth::auth_middleware,
        ))
        .with_state(state.clone());

    // Public endpoints (no auth required)
    let health_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .with_state(state.pool.clone());

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler::metrics))
        .with_state(metrics_handle);

    let mut app = Router::new()
        .merge(health_routes)
        .merge(metrics_routes)
        .merge(auth_routes);

    if state.config.security.admin_token.is_some() {
        let admin_routes = Router::new()
            .route("/admin/pool/stats", get(handlers::admin::pool_stats))
            .route("/admin/pool/alerts", get(handlers::admin::pool_alerts))
            .route("/admin/pool/reset-weights", post(handlers::admin::reset_weights))
            .route("/admin/users/:user_id/requests", get(handlers::admin::recent_requests))
            .route("/admin/users/:user_id/balance", get(handlers::admin::user_balance))
            .route("/admin/users/:user_id/deposit", post(handlers::admin::deposit))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                handlers::admin::admin_middleware,
            ))
            .with_state(state);
        app = app.merge(admin_routes);
    }

    app.layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}
