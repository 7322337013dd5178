//! Metered chat completions
//!
//! One request walks `KeyValidated → ModelAuthorized → PriceEstimated →
//! AccountSelected → BalanceReserved → UpstreamCalled → Settled → Logged`.
//! Key validation happens in the auth middleware. Once the balance is
//! reserved the request either settles or refunds, exactly once.

use crate::{
    accounts::{AccountSelector, SelectedAccount, SelectorError},
    auth::{AccessKeyStore, AuthInfo},
    config::Config,
    error::AppError,
    ledger::{BalanceLedger, LedgerError, Reservation},
    metrics,
    money::round,
    observability::request_log::{RequestLog, RequestRecord, RequestStatus},
    pricing::{
        calculator, estimate, CostBreakdown, CostSource, ModelPrice, PricingCache, PricingError, Usage,
    },
    upstream::{UpstreamClient, UpstreamError},
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn, Instrument, Span};
use uuid::Uuid;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub keys: AccessKeyStore,
    pub pricing: Arc<PricingCache>,
    pub selector: Arc<AccountSelector>,
    pub ledger: BalanceLedger,
    pub upstream: UpstreamClient,
    pub request_log: RequestLog,
}

/// Handle /v1/chat/completions (and the unversioned alias)
pub async fn handle_chat_completions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
    uri: Uri,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        user_id = %auth.user_id,
        model = tracing::field::Empty,
        tier = tracing::field::Empty,
        account = tracing::field::Empty,
    );

    let attempt = Attempt {
        request_id: request_id.clone(),
        user_id: auth.user_id.clone(),
        access_key_id: auth.key_id.clone(),
        endpoint: uri.path().to_string(),
        model: String::new(),
        start,
    };

    let result = proxy(state, auth, attempt, body).instrument(span.clone()).await;

    let outcome = match &result {
        Ok(_) => "success",
        Err(e) => e.outcome(),
    };
    metrics::record_outcome(outcome);
    metrics::record_duration(outcome, start.elapsed());

    let mut response = match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            span.in_scope(|| info!(error = %e, status = e.status_code().as_u16(), "Request failed"));
            e.into_response()
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Identity of one proxied attempt, carried into its request record
struct Attempt {
    request_id: String,
    user_id: String,
    access_key_id: String,
    endpoint: String,
    model: String,
    start: Instant,
}

impl Attempt {
    fn record(&self, selected: &SelectedAccount, status: RequestStatus, status_code: u16) -> RequestRecord {
        RequestRecord {
            request_id: self.request_id.clone(),
            user_id: self.user_id.clone(),
            access_key_id: self.access_key_id.clone(),
            funding_account_id: Some(selected.account.id.clone()),
            tier: Some(selected.params.tier),
            model: self.model.clone(),
            endpoint: self.endpoint.clone(),
            prompt_tokens: 0,
            completion_tokens: 0,
            upstream_cost: Decimal::ZERO,
            operator_cost: Decimal::ZERO,
            client_cost: Decimal::ZERO,
            profit: Decimal::ZERO,
            savings: Decimal::ZERO,
            duration_ms: self.start.elapsed().as_millis() as u64,
            status,
            status_code: Some(status_code),
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// Pre-flight token estimate, reused when the upstream reports no usage
#[derive(Clone, Copy)]
struct TokenEstimate {
    prompt: u64,
    completion: u64,
}

async fn proxy(state: AppState, auth: AuthInfo, mut attempt: Attempt, body: Bytes) -> Result<Value, AppError> {
    let request = parse_request(&body)?;
    let model = request["model"].as_str().unwrap_or_default().to_string();
    Span::current().record("model", model.as_str());
    attempt.model = model.clone();

    auth.authorize_model(&model)?;

    if request.get("stream").and_then(Value::as_bool) == Some(true) {
        return Err(AppError::BadRequest(
            "Streaming responses are not supported, set \"stream\": false".to_string(),
        ));
    }

    // PriceEstimated
    let price = state.pricing.get_price(&model).await.map_err(pricing_error)?.price;

    let tokens = TokenEstimate {
        prompt: estimate::prompt_tokens(&request),
        completion: estimate::completion_tokens(&request, state.config.pricing.default_completion_tokens),
    };
    let estimated_upstream = round(calculator::token_cost(&price, tokens.prompt, tokens.completion));

    // AccountSelected
    let selected = state
        .selector
        .select(estimated_upstream, state.config.selection.min_margin)
        .await
        .map_err(|e| match e {
            SelectorError::NoAvailableAccount => AppError::NoAccountAvailable,
            other => {
                error!(error = %other, "Account selection failed");
                AppError::Internal("Account selection failed".to_string())
            }
        })?;

    let span = Span::current();
    span.record("tier", selected.params.tier.as_str());
    span.record("account", selected.account.id.as_str());

    let estimated = calculator::estimate(&price, tokens.prompt, tokens.completion, &selected.params);

    // From the reservation on, the hold must be resolved even if the client
    // goes away, so reserving and everything after it runs on its own task.
    let task = tokio::spawn(
        reserve_call_and_settle(state, attempt, selected, price, tokens, request, estimated.client_cost)
            .in_current_span(),
    );

    match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Settlement task aborted");
            Err(AppError::Internal("Request processing failed".to_string()))
        }
    }
}

async fn reserve_call_and_settle(
    state: AppState,
    attempt: Attempt,
    selected: SelectedAccount,
    price: ModelPrice,
    tokens: TokenEstimate,
    mut request: Value,
    required: Decimal,
) -> Result<Value, AppError> {
    // BalanceReserved
    let reservation = match state
        .ledger
        .reserve(&attempt.user_id, required)
        .await
        .map_err(ledger_error)?
    {
        Some(reservation) => reservation,
        None => {
            let available = state
                .ledger
                .balance(&attempt.user_id)
                .await
                .map_err(ledger_error)?
                .map(|b| b.balance)
                .unwrap_or(Decimal::ZERO);
            return Err(AppError::InsufficientBalance { required, available });
        }
    };

    info!(
        reserved = %reservation.amount(),
        prompt_tokens = tokens.prompt,
        completion_tokens = tokens.completion,
        "Balance reserved"
    );

    if let Some(obj) = request.as_object_mut() {
        obj.entry("usage").or_insert_with(|| json!({ "include": true }));
    }

    // UpstreamCalled
    match state.upstream.chat_completion(&selected.api_key, &request).await {
        Ok(body) => Ok(settle_success(&state, &attempt, &selected, &price, tokens, reservation, body).await),
        Err(e) => Err(settle_failure(&state, &attempt, &selected, reservation, e).await),
    }
}

async fn settle_success(
    state: &AppState,
    attempt: &Attempt,
    selected: &SelectedAccount,
    price: &ModelPrice,
    tokens: TokenEstimate,
    reservation: Reservation,
    mut body: Value,
) -> Value {
    let mut usage = Usage::from_response(&body);
    if usage.total_tokens() == 0 && usage.reported_cost.is_none() {
        warn!("Upstream response carried no usage, billing the pre-flight estimate");
        usage.prompt_tokens = tokens.prompt;
        usage.completion_tokens = tokens.completion;
    }

    let cost = calculator::actual(price, &usage, &selected.params);
    let reserved = reservation.amount();

    // Settled
    let mut settle_error = None;
    let (cost, charged) = match state.ledger.settle(reservation, cost.client_cost, cost.savings).await {
        Ok(settlement) => {
            if !settlement.shortfall.is_zero() {
                warn!(shortfall = %settlement.shortfall, "Balance could not absorb the overrun, booked as operator loss");
            }
            info!(
                charged = %settlement.charged,
                refunded = %settlement.refunded,
                extra_charged = %settlement.extra_charged,
                source = ?cost.source,
                "Reservation settled"
            );
            (cost.with_shortfall(settlement.shortfall), settlement.charged)
        }
        Err(e) => {
            // The hold is taken; the refund or overrun may not have been applied
            warn!(
                error = %e,
                reserved = %reserved,
                client_cost = %cost.client_cost,
                "Settlement incomplete, request record flagged for reconciliation"
            );
            settle_error = Some(format!(
                "settlement incomplete: {}; reserved {}, computed client cost {}",
                e, reserved, cost.client_cost
            ));
            (cost, reserved)
        }
    };

    match state.selector.debit_for_use(selected, &cost).await {
        Ok(balance) => info!(account_balance = %balance, "Funding account debited"),
        Err(e) => error!(error = %e, upstream_cost = %cost.upstream_cost, "Failed to debit funding account"),
    }

    // Logged
    let mut record = attempt.record(selected, RequestStatus::Success, StatusCode::OK.as_u16()).with_cost(&cost);
    record.prompt_tokens = usage.prompt_tokens;
    record.completion_tokens = usage.completion_tokens;
    record.error_message = settle_error;
    append_record(state, &record).await;

    metrics::record_settlement(selected.params.tier.as_str(), charged, cost.profit);

    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "cost".to_string(),
            json!({
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "cost_usd": charged.to_f64().unwrap_or_default(),
                "account_type": selected.params.tier.as_str(),
                "savings_usd": cost.savings.to_f64().unwrap_or_default(),
            }),
        );
    }

    info!(
        duration_ms = attempt.start.elapsed().as_millis() as u64,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "Completed chat completion request"
    );

    body
}

async fn settle_failure(
    state: &AppState,
    attempt: &Attempt,
    selected: &SelectedAccount,
    reservation: Reservation,
    failure: UpstreamError,
) -> AppError {
    if let Err(e) = state.ledger.refund(reservation).await {
        error!(error = %e, "Failed to refund reservation after upstream failure");
    }

    if failure.rejects_credential() {
        warn!(error = %failure, "Upstream rejected the funding credential, quarantining account");
        state.selector.quarantine(&selected.account.id);
    }

    let (status, status_code, app_error) = match &failure {
        UpstreamError::Timeout(limit) => (
            RequestStatus::Timeout,
            StatusCode::GATEWAY_TIMEOUT,
            AppError::UpstreamTimeout(format!("no response within {}s", limit.as_secs())),
        ),
        UpstreamError::Status { status, message } => (
            RequestStatus::Error,
            *status,
            AppError::UpstreamError {
                status: *status,
                message: message.clone(),
            },
        ),
        other => (
            RequestStatus::Error,
            StatusCode::BAD_GATEWAY,
            AppError::UpstreamError {
                status: StatusCode::BAD_GATEWAY,
                message: other.to_string(),
            },
        ),
    };

    let mut record = attempt
        .record(selected, status, status_code.as_u16())
        .with_cost(&CostBreakdown::zero(CostSource::TokenEstimate));
    record.error_message = Some(failure.to_string());
    append_record(state, &record).await;

    app_error
}

async fn append_record(state: &AppState, record: &RequestRecord) {
    if let Err(e) = state.request_log.append(record).await {
        error!(error = %e, status = record.status.as_str(), "Failed to write request record");
    }
}

fn parse_request(body: &[u8]) -> Result<Value, AppError> {
    let request: Value =
        serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("body is not valid JSON: {}", e)))?;

    if !request.is_object() {
        return Err(AppError::BadRequest("body must be a JSON object".to_string()));
    }

    match request.get("model").and_then(Value::as_str) {
        Some(model) if !model.trim().is_empty() => {}
        _ => return Err(AppError::BadRequest("'model' is required".to_string())),
    }

    if !request.get("messages").is_some_and(Value::is_array) {
        return Err(AppError::BadRequest("'messages' must be an array".to_string()));
    }

    Ok(request)
}

fn pricing_error(e: PricingError) -> AppError {
    match e {
        PricingError::UnknownModel(model) => AppError::UnknownModel(model),
        PricingError::Unavailable { model, source } => {
            warn!(error = %source, "No price available");
            AppError::PricingUnavailable(format!("no price for '{}', catalog unreachable", model))
        }
        PricingError::Catalog(source) => AppError::PricingUnavailable(source.to_string()),
        PricingError::Database(e) => {
            error!(error = %e, "Pricing store error");
            AppError::Internal("Pricing store unavailable".to_string())
        }
    }
}

fn ledger_error(e: LedgerError) -> AppError {
    error!(error = %e, "Ledger operation failed");
    AppError::Internal("Balance ledger unavailable".to_string())
}
