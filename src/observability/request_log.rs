//! Request Log
//!
//! Append-only record of every proxied attempt that reached the balance
//! reservation, with its cost breakdown. Rows are never updated.

use crate::accounts::models::Tier;
use crate::money::{from_units, to_units};
use crate::pricing::calculator::CostBreakdown;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqlitePool;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Error,
    Timeout,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
            RequestStatus::Timeout => "timeout",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RequestStatus::Success),
            "error" => Ok(RequestStatus::Error),
            "timeout" => Ok(RequestStatus::Timeout),
            other => Err(format!("unknown request status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub user_id: String,
    pub access_key_id: String,
    pub funding_account_id: Option<String>,
    pub tier: Option<Tier>,
    pub model: String,
    pub endpoint: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub upstream_cost: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub operator_cost: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub client_cost: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub profit: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub savings: Decimal,
    pub duration_ms: u64,
    pub status: RequestStatus,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Copy the money figures of a breakdown onto the record
    pub fn with_cost(mut self, cost: &CostBreakdown) -> Self {
        self.upstream_cost = cost.upstream_cost;
        self.operator_cost = cost.operator_cost;
        self.client_cost = cost.client_cost;
        self.profit = cost.profit;
        self.savings = cost.savings;
        self
    }
}

#[derive(sqlx::FromRow)]
struct RequestRecordRow {
    request_id: String,
    user_id: String,
    access_key_id: String,
    funding_account_id: Option<String>,
    tier: Option<String>,
    model: String,
    endpoint: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    upstream_cost_units: i64,
    operator_cost_units: i64,
    client_cost_units: i64,
    profit_units: i64,
    savings_units: i64,
    duration_ms: i64,
    status: String,
    status_code: Option<i64>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<RequestRecordRow> for RequestRecord {
    fn from(row: RequestRecordRow) -> Self {
        Self {
            request_id: row.request_id,
            user_id: row.user_id,
            access_key_id: row.access_key_id,
            funding_account_id: row.funding_account_id,
            tier: row.tier.and_then(|t| t.parse().ok()),
            model: row.model,
            endpoint: row.endpoint,
            prompt_tokens: row.prompt_tokens.max(0) as u64,
            completion_tokens: row.completion_tokens.max(0) as u64,
            upstream_cost: from_units(row.upstream_cost_units),
            operator_cost: from_units(row.operator_cost_units),
            client_cost: from_units(row.client_cost_units),
            profit: from_units(row.profit_units),
            savings: from_units(row.savings_units),
            duration_ms: row.duration_ms.max(0) as u64,
            status: row.status.parse().unwrap_or(RequestStatus::Error),
            status_code: row.status_code.and_then(|c| u16::try_from(c).ok()),
            error_message: row.error_message,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct RequestLog {
    pool: SqlitePool,
}

impl RequestLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a record. Awaited so the record is durable before the response.
    pub async fn append(&self, record: &RequestRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO request_logs (
                request_id, user_id, access_key_id, funding_account_id, tier,
                model, endpoint, prompt_tokens, completion_tokens, total_tokens,
                upstream_cost_units, operator_cost_units, client_cost_units, profit_units, savings_units,
                duration_ms, status, status_code, error_message, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
        )
        .bind(&record.request_id)
        .bind(&record.user_id)
        .bind(&record.access_key_id)
        .bind(&record.funding_account_id)
        .bind(record.tier.map(|t| t.as_str()))
        .bind(&record.model)
        .bind(&record.endpoint)
        .bind(record.prompt_tokens as i64)
        .bind(record.completion_tokens as i64)
        .bind(record.total_tokens() as i64)
        .bind(to_units(record.upstream_cost))
        .bind(to_units(record.operator_cost))
        .bind(to_units(record.client_cost))
        .bind(to_units(record.profit))
        .bind(to_units(record.savings))
        .bind(record.duration_ms as i64)
        .bind(record.status.as_str())
        .bind(record.status_code.map(i64::from))
        .bind(&record.error_message)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Latest records of one user, newest first
    pub async fn recent_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<RequestRecord>, sqlx::Error> {
        let rows = sqlx::query_as::<_, RequestRecordRow>(
            r#"
            SELECT request_id, user_id, access_key_id, funding_account_id, tier,
                   model, endpoint, prompt_tokens, completion_tokens,
                   upstream_cost_units, operator_cost_units, client_cost_units, profit_units, savings_units,
                   duration_ms, status, status_code, error_message, created_at
            FROM request_logs
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RequestRecord::from).collect())
    }

    pub async fn count_for_user(&self, user_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM request_logs WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rust_decimal_macros::dec;

    fn record(request_id: &str, status: RequestStatus) -> RequestRecord {
        RequestRecord {
            request_id: request_id.to_string(),
            user_id: "user-1".to_string(),
            access_key_id: "key-1".to_string(),
            funding_account_id: Some("acc-1".to_string()),
            tier: Some(Tier::Discounted),
            model: "openai/gpt-4o".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            prompt_tokens: 10,
            completion_tokens: 20,
            upstream_cost: Decimal::ZERO,
            operator_cost: Decimal::ZERO,
            client_cost: Decimal::ZERO,
            profit: Decimal::ZERO,
            savings: Decimal::ZERO,
            duration_ms: 120,
            status,
            status_code: Some(200),
            error_message: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let pool = db::connect_in_memory().await.unwrap();
        let log = RequestLog::new(pool);

        let mut first = record("req-1", RequestStatus::Success);
        first.upstream_cost = dec!(0.0075);
        first.client_cost = dec!(0.006);
        first.operator_cost = dec!(0.00225);
        first.profit = dec!(0.00375);
        first.savings = dec!(0.0015);
        log.append(&first).await.unwrap();

        let mut second = record("req-2", RequestStatus::Timeout);
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        second.status_code = Some(504);
        second.error_message = Some("timed out".to_string());
        log.append(&second).await.unwrap();

        let recent = log.recent_for_user("user-1", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, "req-2");
        assert_eq!(recent[0].status, RequestStatus::Timeout);
        assert_eq!(recent[0].client_cost, Decimal::ZERO);
        assert_eq!(recent[1].client_cost, dec!(0.006));
        assert_eq!(recent[1].tier, Some(Tier::Discounted));
        assert_eq!(recent[1].total_tokens(), 30);

        assert_eq!(log.recent_for_user("user-1", 1).await.unwrap().len(), 1);
        assert_eq!(log.count_for_user("someone-else").await.unwrap(), 0);
    }
}
