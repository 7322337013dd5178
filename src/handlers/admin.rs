//! Operator surface: pool health, maintenance and per-user views.
//! Mounted only when `security.admin_token` is configured.

use axum::{
    extract::{Path, Query, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use crate::{
    accounts::SelectorError,
    auth::{extract_bearer_token, hash_key},
    error::AppError,
    handlers::chat_completions::AppState,
    ledger::LedgerError,
};

const DEFAULT_RECENT_LIMIT: u32 = 20;
const MAX_RECENT_LIMIT: u32 = 200;

/// Bearer check against the configured admin token
pub async fn admin_middleware(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, AppError> {
    let expected = state
        .config
        .security
        .admin_token
        .as_deref()
        .ok_or_else(|| AppError::Forbidden("Admin API is disabled".to_string()))?;

    let token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Forbidden("Missing Authorization header".to_string()))
        .and_then(|header| {
            extract_bearer_token(header).map_err(|_| AppError::Forbidden("Bearer token required".to_string()))
        })?;

    // Compare digests so the comparison length does not depend on the secret
    if hash_key(token) != hash_key(expected) {
        tracing::warn!("Rejected admin request with wrong token");
        return Err(AppError::Forbidden("Invalid admin token".to_string()));
    }

    Ok(next.run(req).await)
}

/// GET /admin/pool/stats
pub async fn pool_stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let stats = state.selector.pool_stats().await.map_err(selector_error)?;
    Ok(Json(stats))
}

/// GET /admin/pool/alerts
pub async fn pool_alerts(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let alerts = state.selector.low_balance_alerts().await.map_err(selector_error)?;
    Ok(Json(json!({ "alerts": alerts })))
}

/// POST /admin/pool/reset-weights
pub async fn reset_weights(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let reset = state.selector.reset_usage_weights().await.map_err(selector_error)?;
    Ok(Json(json!({ "reset": reset })))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<u32>,
}

/// GET /admin/users/:user_id/requests
pub async fn recent_requests(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<RecentQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT);
    let (records, total) = futures::try_join!(
        state.request_log.recent_for_user(&user_id, limit),
        state.request_log.count_for_user(&user_id),
    )?;

    Ok(Json(json!({
        "user_id": user_id,
        "total": total,
        "requests": records,
    })))
}

/// GET /admin/users/:user_id/balance
pub async fn user_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    match state.ledger.balance(&user_id).await.map_err(ledger_error)? {
        Some(balance) => Ok(Json(json!(balance))),
        None => Err(AppError::BadRequest(format!("no balance for user '{}'", user_id))),
    }
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

/// POST /admin/users/:user_id/deposit
///
/// Entry point for the payment surface; credits through the ledger.
pub async fn deposit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<DepositRequest>,
) -> Result<impl IntoResponse, AppError> {
    let balance = state.ledger.deposit(&user_id, request.amount).await.map_err(ledger_error)?;
    Ok(Json(json!(balance)))
}

fn selector_error(e: SelectorError) -> AppError {
    tracing::error!(error = %e, "Pool query failed");
    AppError::Internal("Pool query failed".to_string())
}

fn ledger_error(e: LedgerError) -> AppError {
    match e {
        LedgerError::InvalidAmount(amount) => AppError::BadRequest(format!("invalid amount {}", amount)),
        LedgerError::Database(e) => AppError::from(e),
    }
}
