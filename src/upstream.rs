//! Upstream chat-completions client

use crate::config::UpstreamConfig;
use axum::http::StatusCode;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("upstream returned an invalid body: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// The upstream refused the funding account's credential itself
    /// (revoked key, exhausted credits, forbidden)
    pub fn rejects_credential(&self) -> bool {
        matches!(
            self,
            UpstreamError::Status { status, .. }
                if matches!(status.as_u16(), 401 | 402 | 403)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_))
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    url: String,
    timeout: Duration,
    site_url: String,
    app_name: String,
}

impl UpstreamClient {
    pub fn new(client: Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            timeout: Duration::from_secs(config.timeout_seconds),
            site_url: config.site_url.clone(),
            app_name: config.app_name.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call the upstream with the funding account's credential. The whole
    /// exchange (connect, send, read body) is bounded by the hard timeout.
    pub async fn chat_completion(&self, api_key: &str, body: &Value) -> Result<Value, UpstreamError> {
        match tokio::time::timeout(self.timeout, self.send(api_key, body)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }

    async fn send(&self, api_key: &str, body: &Value) -> Result<Value, UpstreamError> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", &self.site_url)
            .header("X-Title", &self.app_name)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(UpstreamError::Status {
                status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
                message: upstream_message(&error_text),
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        let json: Value =
            serde_json::from_slice(&bytes).map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;

        // Some upstreams report failures inside a 200
        if let Some(error) = json.get("error") {
            if json.get("choices").is_none() {
                return Err(UpstreamError::Status {
                    status: StatusCode::BAD_GATEWAY,
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("upstream error")
                        .to_string(),
                });
            }
        }

        Ok(json)
    }

    fn classify(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

/// Pull `error.message` out of an upstream error body when there is one
fn upstream_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(500).collect())
}
