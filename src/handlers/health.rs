use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;
use sqlx::SqlitePool;

use crate::db;

/// Health check endpoint
/// Returns 200 OK if the service is running
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({
        "status": "healthy",
        "service": "ai-router",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// Readiness check endpoint
/// Returns 200 OK once the database answers, 503 otherwise
pub async fn readiness_check(State(pool): State<SqlitePool>) -> impl IntoResponse {
    match db::ping(&pool).await {
        Ok(()) => (StatusCode::OK, Json(json!({
            "status": "ready",
            "service": "ai-router",
        }))),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({
                "status": "unavailable",
                "service": "ai-router",
                "reason": "database unreachable",
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_returns_ok() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_check_returns_ok() {
        let pool = db::connect_in_memory().await.unwrap();
        let response = readiness_check(State(pool)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_check_fails_when_pool_closed() {
        let pool = db::connect_in_memory().await.unwrap();
        pool.close().await;

        let response = readiness_check(State(pool)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
