use crate::error::AppError;
use crate::logging::SensitiveApiKey;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

const KEY_PREFIX: &str = "air_";

/// Authentication information attached to each authenticated request
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub key_id: String,
    pub user_id: String,
    pub key_name: String,
    /// When set, the key may only be used with this model
    pub allowed_model: Option<String>,
}

impl AuthInfo {
    /// Enforce the key's model restriction, if any
    pub fn authorize_model(&self, requested: &str) -> Result<(), AppError> {
        match &self.allowed_model {
            Some(allowed) if allowed != requested => Err(AppError::ModelRestricted {
                allowed: allowed.clone(),
                requested: requested.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// A freshly issued key. The plaintext is only ever available here.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub key: String,
    pub prefix: String,
    pub allowed_model: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct AccessKeyRow {
    id: String,
    user_id: String,
    name: String,
    allowed_model: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// End-user access keys, stored as SHA-256 hashes
#[derive(Clone)]
pub struct AccessKeyStore {
    pool: SqlitePool,
}

impl AccessKeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn issue(
        &self,
        user_id: &str,
        name: &str,
        allowed_model: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedKey, sqlx::Error> {
        let key = generate_key();
        let prefix: String = key.chars().take(8).collect();
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO access_keys (id, user_id, name, key_hash, key_prefix, allowed_model, is_active, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(name)
        .bind(hash_key(&key))
        .bind(&prefix)
        .bind(allowed_model)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        tracing::info!(key_id = %id, user_id = %user_id, prefix = %prefix, "Issued access key");

        Ok(IssuedKey {
            id,
            user_id: user_id.to_string(),
            name: name.to_string(),
            key,
            prefix,
            allowed_model: allowed_model.map(str::to_string),
            expires_at,
        })
    }

    /// Soft-delete a key. Returns false if it did not exist or was already inactive.
    pub async fn deactivate(&self, key_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE access_keys SET is_active = 0, deactivated_at = ? WHERE id = ? AND is_active = 1",
        )
        .bind(Utc::now())
        .bind(key_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Look up an active, unexpired key by its plaintext token
    pub async fn validate(&self, token: &str) -> Result<Option<AuthInfo>, sqlx::Error> {
        let row = sqlx::query_as::<_, AccessKeyRow>(
            r#"
            SELECT id, user_id, name, allowed_model, expires_at
            FROM access_keys
            WHERE key_hash = ? AND is_active = 1
            "#,
        )
        .bind(hash_key(token))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        if row.expires_at.is_some_and(|expires_at| expires_at <= Utc::now()) {
            tracing::debug!(key_id = %row.id, "Access key expired");
            return Ok(None);
        }

        Ok(Some(AuthInfo {
            key_id: row.id,
            user_id: row.user_id,
            key_name: row.name,
            allowed_model: row.allowed_model,
        }))
    }

    /// Stamp last_used_at without blocking the request
    fn touch_async(&self, key_id: String) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let result = sqlx::query("UPDATE access_keys SET last_used_at = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(&key_id)
                .execute(&pool)
                .await;

            if let Err(e) = result {
                tracing::warn!(error = %e, key_id = %key_id, "Failed to update last_used_at timestamp");
            }
        });
    }
}

/// Authentication middleware
/// Extracts the Bearer token and attaches [`AuthInfo`] to the request
pub async fn auth_middleware(
    State(keys): State<AccessKeyStore>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::InvalidKey("Missing Authorization header".to_string()))?;

    let token = extract_bearer_token(auth_header)?;

    let info = keys
        .validate(token)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Database error during authentication");
            AppError::Internal("Authentication service unavailable".to_string())
        })?
        .ok_or_else(|| {
            tracing::info!(key = %SensitiveApiKey::new(token), "Rejected access key");
            AppError::InvalidKey("Invalid, expired or deactivated API key".to_string())
        })?;

    keys.touch_async(info.key_id.clone());

    req.extensions_mut().insert(info);

    Ok(next.run(req).await)
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(auth_header: &str) -> Result<&str, AppError> {
    const BEARER_PREFIX: &str = "Bearer ";

    let token = auth_header.strip_prefix(BEARER_PREFIX).ok_or_else(|| {
        AppError::InvalidKey("Authorization header must use Bearer scheme".to_string())
    })?;

    if token.is_empty() {
        return Err(AppError::InvalidKey("Bearer token is empty".to_string()));
    }

    Ok(token)
}

pub fn hash_key(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// `air_` followed by 32 random bytes, base64url without padding
pub fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", KEY_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}
