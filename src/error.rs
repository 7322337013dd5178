use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::fmt;

/// Application error types
#[derive(Debug)]
pub enum AppError {
    /// Missing, unknown, expired or deactivated access key
    InvalidKey(String),
    /// Access key is restricted to a different model
    ModelRestricted { allowed: String, requested: String },
    /// Client balance cannot cover the estimated cost
    InsufficientBalance { required: Decimal, available: Decimal },
    /// No funding account in any tier can pay for the request
    NoAccountAvailable,
    /// Model is not in the upstream catalog
    UnknownModel(String),
    /// Catalog unreachable and no cached price for the model
    PricingUnavailable(String),
    /// Upstream call exceeded its hard timeout
    UpstreamTimeout(String),
    /// Transport failure or non-2xx from upstream
    UpstreamError { status: StatusCode, message: String },
    /// Malformed client request
    BadRequest(String),
    /// Admin surface denied
    Forbidden(String),
    /// Internal server error
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey(msg) => write!(f, "Invalid API key: {}", msg),
            Self::ModelRestricted { allowed, requested } => write!(
                f,
                "This API key is restricted to model '{}', requested '{}'",
                allowed, requested
            ),
            Self::InsufficientBalance { required, available } => write!(
                f,
                "Insufficient balance: required ${}, available ${}",
                required.normalize(),
                available.normalize()
            ),
            Self::NoAccountAvailable => write!(f, "No funding account available, try again later"),
            Self::UnknownModel(model) => write!(f, "Model not found: {}", model),
            Self::PricingUnavailable(msg) => write!(f, "Pricing unavailable: {}", msg),
            Self::UpstreamTimeout(msg) => write!(f, "Upstream timeout: {}", msg),
            Self::UpstreamError { status, message } => {
                write!(f, "Upstream error ({}): {}", status, message)
            }
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidKey(_) => StatusCode::UNAUTHORIZED,
            Self::ModelRestricted { .. } => StatusCode::FORBIDDEN,
            Self::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::NoAccountAvailable => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnknownModel(_) => StatusCode::BAD_REQUEST,
            Self::PricingUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Outcome label used for metrics
    pub fn outcome(&self) -> &'static str {
        error_type_name(self)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let mut error = json!({
            "message": self.to_string(),
            "type": error_type_name(&self),
        });

        match &self {
            Self::InsufficientBalance { required, available } => {
                error["required"] = json!(required.to_f64().unwrap_or_default());
                error["available"] = json!(available.to_f64().unwrap_or_default());
            }
            Self::UpstreamError { status, .. } => {
                error["upstream_status"] = json!(status.as_u16());
            }
            _ => {}
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

fn error_type_name(error: &AppError) -> &'static str {
    match error {
        AppError::InvalidKey(_) => "invalid_api_key",
        AppError::ModelRestricted { .. } => "model_restricted",
        AppError::InsufficientBalance { .. } => "insufficient_balance",
        AppError::NoAccountAvailable => "no_account_available",
        AppError::UnknownModel(_) => "model_not_found",
        AppError::PricingUnavailable(_) => "pricing_unavailable",
        AppError::UpstreamTimeout(_) => "upstream_timeout",
        AppError::UpstreamError { .. } => "upstream_error",
        AppError::BadRequest(_) => "invalid_request",
        AppError::Forbidden(_) => "forbidden",
        AppError::Internal(_) => "internal_error",
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}
