//! Account Pool Selector
//!
//! Picks the funding account that pays for a request. Tiers are tried in
//! strict priority order (discounted, investor, regular), each exhausted before
//! falling through. Choosing an account and stamping it is one
//! `UPDATE ... WHERE id = (SELECT ...) RETURNING *` statement, so two
//! concurrent selections never both see the same pre-selection state.
//!
//! Accounts whose credential cannot be decrypted, or that the upstream
//! rejected, are quarantined in memory for a while and skipped.

use crate::accounts::models::{FundingAccount, FundingAccountRow, Tier};
use crate::accounts::store::{AccountError, AccountStore};
use crate::config::SelectionConfig;
use crate::money::{from_units, to_units};
use crate::pricing::calculator::{CostBreakdown, TierParameters};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("no funding account available")]
    NoAvailableAccount,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Account(#[from] AccountError),
}

/// The account chosen for a request, with its decrypted credential
pub struct SelectedAccount {
    pub account: FundingAccount,
    pub api_key: String,
    pub params: TierParameters,
}

impl fmt::Debug for SelectedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedAccount")
            .field("account_id", &self.account.id)
            .field("tier", &self.params.tier)
            .field("api_key", &crate::logging::SensitiveApiKey::new(&self.api_key).to_string())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierStatus {
    Active,
    Low,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: Tier,
    pub count: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub avg_balance: Decimal,
    pub status: TierStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub tiers: Vec<TierStats>,
    /// First tier in priority order above the active floor
    pub active_tier: Option<Tier>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_available: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolAlert {
    pub level: AlertLevel,
    /// `discounted_low`, `investor_low`, `discounted_empty` or `all_empty`
    pub code: &'static str,
    pub message: String,
    pub accounts: i64,
}

pub struct AccountSelector {
    pool: SqlitePool,
    store: AccountStore,
    quarantine: DashMap<String, Instant>,
    quarantine_for: Duration,
    settings: SelectionConfig,
}

impl AccountSelector {
    pub fn new(pool: SqlitePool, store: AccountStore, settings: SelectionConfig) -> Self {
        Self {
            pool,
            store,
            quarantine: DashMap::new(),
            quarantine_for: Duration::from_secs(settings.quarantine_seconds),
            settings,
        }
    }

    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    /// Choose a funding account able to cover `estimated_upstream_cost + min_margin`
    pub async fn select(
        &self,
        estimated_upstream_cost: Decimal,
        min_margin: Decimal,
    ) -> Result<SelectedAccount, SelectorError> {
        let required_units = to_units(estimated_upstream_cost + min_margin);
        // Accounts that failed during this call stay excluded whatever the quarantine TTL
        let mut failed: HashSet<String> = HashSet::new();

        for tier in Tier::PRIORITY {
            loop {
                let mut excluded = self.quarantined_ids();
                for id in &failed {
                    if !excluded.contains(id) {
                        excluded.push(id.clone());
                    }
                }
                let Some(account) = self.pick(tier, required_units, &excluded).await? else {
                    debug!(tier = %tier, required = %from_units(required_units), "Tier exhausted, falling through");
                    break;
                };

                match self.store.decrypt_credential(&account) {
                    Ok(api_key) => {
                        if tier != Tier::Discounted {
                            info!(tier = %tier, account_id = %account.id, "Selected account from fallback tier");
                        }
                        let params = account.tier_parameters();
                        return Ok(SelectedAccount {
                            account,
                            api_key,
                            params,
                        });
                    }
                    Err(e) => {
                        warn!(
                            account_id = %account.id,
                            tier = %tier,
                            error = %e,
                            "⚠️  Stored credential unreadable, quarantining account"
                        );
                        self.quarantine(&account.id);
                        failed.insert(account.id);
                    }
                }
            }
        }

        warn!(required = %from_units(required_units), "No funding account available in any tier");
        Err(SelectorError::NoAvailableAccount)
    }

    /// Atomically choose and stamp the best account of `tier`
    async fn pick(
        &self,
        tier: Tier,
        required_units: i64,
        excluded: &[String],
    ) -> Result<Option<FundingAccount>, SelectorError> {
        let (stamp, eligibility, order_by) = match tier {
            Tier::Discounted => (
                "usage_weight = usage_weight + 1,",
                "",
                "usage_weight ASC, balance_units DESC",
            ),
            Tier::Investor => (
                "",
                "AND balance_units > min_threshold_units",
                "total_spent_units ASC, balance_units DESC",
            ),
            Tier::Regular => ("", "", "balance_units DESC"),
        };

        let sql = format!(
            r#"
            UPDATE funding_accounts
            SET {stamp} last_selected_at = ?
            WHERE id = (
                SELECT id FROM funding_accounts
                WHERE tier = ? AND status = 'active' AND balance_units > ? {eligibility}
                  AND id NOT IN (SELECT value FROM json_each(?))
                ORDER BY {order_by}, created_at ASC
                LIMIT 1
            )
            RETURNING *
            "#
        );

        let excluded_json = serde_json::to_string(excluded).unwrap_or_else(|_| "[]".to_string());

        let row = sqlx::query_as::<_, FundingAccountRow>(&sql)
            .bind(Utc::now())
            .bind(tier.as_str())
            .bind(required_units)
            .bind(excluded_json)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| FundingAccount::try_from(row).map_err(|e| SelectorError::Account(AccountError::Corrupt(e))))
            .transpose()
    }

    /// Debit the funding account for a settled request. Returns its new balance.
    pub async fn debit_for_use(
        &self,
        selected: &SelectedAccount,
        cost: &CostBreakdown,
    ) -> Result<Decimal, SelectorError> {
        let usage = selected.account.usage_debit(cost);
        Ok(self.store.debit_for_use(&selected.account.id, usage).await?)
    }

    /// Skip this account until the quarantine period expires
    pub fn quarantine(&self, account_id: &str) {
        self.quarantine
            .insert(account_id.to_string(), Instant::now() + self.quarantine_for);
    }

    pub fn is_quarantined(&self, account_id: &str) -> bool {
        self.quarantine
            .get(account_id)
            .is_some_and(|until| *until > Instant::now())
    }

    fn quarantined_ids(&self) -> Vec<String> {
        let now = Instant::now();
        self.quarantine.retain(|_, until| *until > now);
        self.quarantine.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Reset the rotation counters. Maintenance operation, never on the hot path.
    pub async fn reset_usage_weights(&self) -> Result<u64, SelectorError> {
        let result = sqlx::query("UPDATE funding_accounts SET usage_weight = 0 WHERE usage_weight != 0")
            .execute(&self.pool)
            .await?;

        info!(accounts = result.rows_affected(), "Usage weights reset");
        Ok(result.rows_affected())
    }

    /// Aggregate balance and count per tier over active accounts
    pub async fn pool_stats(&self) -> Result<PoolStats, SelectorError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT tier, COUNT(*), COALESCE(SUM(balance_units), 0)
            FROM funding_accounts
            WHERE status = 'active'
            GROUP BY tier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tiers = Vec::with_capacity(Tier::PRIORITY.len());
        let mut active_tier = None;
        let mut total_available = Decimal::ZERO;

        for tier in Tier::PRIORITY {
            let (count, total_units) = rows
                .iter()
                .find(|(name, _, _)| name == tier.as_str())
                .map(|(_, count, total)| (*count, *total))
                .unwrap_or((0, 0));

            let total_balance = from_units(total_units);
            let avg_balance = if count > 0 {
                crate::money::round(total_balance / Decimal::from(count))
            } else {
                Decimal::ZERO
            };

            let status = if total_balance > self.settings.active_tier_floor {
                TierStatus::Active
            } else if total_balance > Decimal::ZERO {
                TierStatus::Low
            } else {
                TierStatus::Empty
            };

            if status == TierStatus::Active && active_tier.is_none() {
                active_tier = Some(tier);
            }
            if total_balance > Decimal::ZERO {
                total_available += total_balance;
            }

            tiers.push(TierStats {
                tier,
                count,
                total_balance,
                avg_balance,
                status,
            });
        }

        Ok(PoolStats {
            tiers,
            active_tier,
            total_available,
        })
    }

    /// Operational warnings about depleted tiers
    pub async fn low_balance_alerts(&self) -> Result<Vec<PoolAlert>, SelectorError> {
        let low_units = to_units(self.settings.low_balance_floor);
        let empty_units = to_units(self.settings.empty_account_floor);

        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT tier,
                   COUNT(*),
                   SUM(CASE WHEN balance_units > 0 AND balance_units < ? THEN 1 ELSE 0 END),
                   SUM(CASE WHEN balance_units > ? THEN 1 ELSE 0 END)
            FROM funding_accounts
            WHERE status = 'active'
            GROUP BY tier
            "#,
        )
        .bind(low_units)
        .bind(empty_units)
        .fetch_all(&self.pool)
        .await?;

        let counts = |tier: Tier| {
            rows.iter()
                .find(|(name, _, _, _)| name == tier.as_str())
                .map(|(_, total, low, funded)| (*total, *low, *funded))
                .unwrap_or((0, 0, 0))
        };

        let mut alerts = Vec::new();
        let (discounted_total, discounted_low, discounted_funded) = counts(Tier::Discounted);
        let (_, investor_low, investor_funded) = counts(Tier::Investor);
        let (_, _, regular_funded) = counts(Tier::Regular);

        if discounted_low > 0 {
            alerts.push(PoolAlert {
                level: AlertLevel::Warning,
                code: "discounted_low",
                message: format!(
                    "{} discounted account(s) below ${}",
                    discounted_low, self.settings.low_balance_floor
                ),
                accounts: discounted_low,
            });
        }

        if investor_low > 0 {
            alerts.push(PoolAlert {
                level: AlertLevel::Warning,
                code: "investor_low",
                message: format!(
                    "{} investor account(s) below ${}",
                    investor_low, self.settings.low_balance_floor
                ),
                accounts: investor_low,
            });
        }

        if discounted_total > 0 && discounted_funded == 0 {
            alerts.push(PoolAlert {
                level: AlertLevel::Critical,
                code: "discounted_empty",
                message: "All discounted accounts are depleted, requests fall through to costlier tiers".to_string(),
                accounts: discounted_total,
            });
        }

        if discounted_funded + investor_funded + regular_funded == 0 {
            alerts.push(PoolAlert {
                level: AlertLevel::Emergency,
                code: "all_empty",
                message: "No funded account in any tier, requests will fail".to_string(),
                accounts: 0,
            });
        }

        for alert in &alerts {
            warn!(code = alert.code, level = ?alert.level, "{}", alert.message);
        }

        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::models::AccountStatus;
    use crate::accounts::store::NewAccount;
    use crate::config::TiersConfig;
    use crate::crypto::CredentialCipher;
    use crate::db;
    use rust_decimal_macros::dec;

    async fn selector() -> AccountSelector {
        let pool = db::connect_in_memory().await.unwrap();
        let store = AccountStore::new(pool.clone(), CredentialCipher::new("test"), TiersConfig::default());
        AccountSelector::new(pool, store, SelectionConfig::default())
    }

    async fn add(selector: &AccountSelector, name: &str, tier: Tier, balance: Decimal) -> FundingAccount {
        selector
            .store()
            .create(NewAccount::new(name, tier, format!("sk-{}", name), balance))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_discounted_beats_richer_investor() {
        let selector = selector().await;
        add(&selector, "investor", Tier::Investor, dec!(500)).await;
        add(&selector, "discounted", Tier::Discounted, dec!(5)).await;

        // 5 > 1 + 1 margin
        let selected = selector.select(dec!(1), dec!(1)).await.unwrap();
        assert_eq!(selected.account.name, "discounted");
        assert_eq!(selected.params.tier, Tier::Discounted);
        assert_eq!(selected.params.client_multiplier, dec!(0.80));
        assert_eq!(selected.api_key, "sk-discounted");
    }

    #[tokio::test]
    async fn test_tier_fallthrough() {
        let selector = selector().await;
        add(&selector, "discounted", Tier::Discounted, dec!(2)).await;
        let investor = add(&selector, "investor", Tier::Investor, dec!(60)).await;
        let regular = add(&selector, "regular", Tier::Regular, dec!(100)).await;

        // Discounted balance 2 is not > 1 + 1
        let selected = selector.select(dec!(1), dec!(1)).await.unwrap();
        assert_eq!(selected.account.id, investor.id);

        // Investor balance 60 is not > 59 + 1
        let selected = selector.select(dec!(59), dec!(1)).await.unwrap();
        assert_eq!(selected.account.id, regular.id);

        assert!(matches!(
            selector.select(dec!(200), dec!(1)).await,
            Err(SelectorError::NoAvailableAccount)
        ));
    }

    #[tokio::test]
    async fn test_investor_min_threshold() {
        let selector = selector().await;
        // Well above cost + margin but below the 50 floor
        add(&selector, "investor", Tier::Investor, dec!(40)).await;

        assert!(matches!(
            selector.select(dec!(1), dec!(1)).await,
            Err(SelectorError::NoAvailableAccount)
        ));
    }

    #[tokio::test]
    async fn test_discounted_rotation() {
        let selector = selector().await;
        add(&selector, "a", Tier::Discounted, dec!(100)).await;
        add(&selector, "b", Tier::Discounted, dec!(50)).await;

        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(selector.select(dec!(0.01), dec!(1)).await.unwrap().account.name);
        }
        // Equal weights tie-break on the richer account, then alternate
        assert_eq!(picks, vec!["a", "b", "a", "b"]);

        assert_eq!(selector.reset_usage_weights().await.unwrap(), 2);
        assert_eq!(selector.select(dec!(0.01), dec!(1)).await.unwrap().account.name, "a");
    }

    #[tokio::test]
    async fn test_investor_rotation_by_total_spent() {
        let selector = selector().await;
        let rich = add(&selector, "rich", Tier::Investor, dec!(500)).await;
        add(&selector, "modest", Tier::Investor, dec!(100)).await;

        let first = selector.select(dec!(1), dec!(1)).await.unwrap();
        assert_eq!(first.account.id, rich.id);
        let cost = crate::pricing::calculator::breakdown(
            dec!(10),
            &first.params,
            crate::pricing::CostSource::UpstreamReported,
        );
        selector.debit_for_use(&first, &cost).await.unwrap();

        assert_eq!(selector.select(dec!(1), dec!(1)).await.unwrap().account.name, "modest");
    }

    #[tokio::test]
    async fn test_paused_and_revoked_are_skipped() {
        let selector = selector().await;
        let paused = add(&selector, "paused", Tier::Discounted, dec!(100)).await;
        let revoked = add(&selector, "revoked", Tier::Discounted, dec!(100)).await;
        add(&selector, "regular", Tier::Regular, dec!(100)).await;

        selector.store().set_status(&paused.id, AccountStatus::Paused).await.unwrap();
        selector.store().revoke(&revoked.id).await.unwrap();

        assert_eq!(selector.select(dec!(1), dec!(1)).await.unwrap().account.name, "regular");
    }

    #[tokio::test]
    async fn test_undecryptable_account_is_quarantined() {
        let selector = selector().await;
        let broken = add(&selector, "broken", Tier::Discounted, dec!(100)).await;
        add(&selector, "investor", Tier::Investor, dec!(100)).await;

        sqlx::query("UPDATE funding_accounts SET credential_encrypted = 'garbage' WHERE id = ?")
            .bind(&broken.id)
            .execute(&selector.pool)
            .await
            .unwrap();

        let selected = selector.select(dec!(1), dec!(1)).await.unwrap();
        assert_eq!(selected.account.name, "investor");
        assert!(selector.is_quarantined(&broken.id));
    }

    #[tokio::test]
    async fn test_zero_quarantine_still_falls_through() {
        let pool = db::connect_in_memory().await.unwrap();
        let store = AccountStore::new(pool.clone(), CredentialCipher::new("test"), TiersConfig::default());
        let settings = SelectionConfig {
            quarantine_seconds: 0,
            ..SelectionConfig::default()
        };
        let selector = AccountSelector::new(pool, store, settings);
        let broken = add(&selector, "broken", Tier::Discounted, dec!(100)).await;
        add(&selector, "investor", Tier::Investor, dec!(100)).await;

        sqlx::query("UPDATE funding_accounts SET credential_encrypted = 'garbage' WHERE id = ?")
            .bind(&broken.id)
            .execute(&selector.pool)
            .await
            .unwrap();

        let selected = tokio::time::timeout(Duration::from_secs(3), selector.select(dec!(1), dec!(1)))
            .await
            .expect("selection must terminate")
            .unwrap();
        assert_eq!(selected.account.name, "investor");

        let weight: i64 = sqlx::query_scalar("SELECT usage_weight FROM funding_accounts WHERE id = ?")
            .bind(&broken.id)
            .fetch_one(&selector.pool)
            .await
            .unwrap();
        assert_eq!(weight, 1);
    }

    #[tokio::test]
    async fn test_pool_stats_and_alerts() {
        let selector = selector().await;
        add(&selector, "d1", Tier::Discounted, dec!(3)).await;
        add(&selector, "d2", Tier::Discounted, dec!(4)).await;
        add(&selector, "i1", Tier::Investor, dec!(30)).await;
        add(&selector, "r1", Tier::Regular, dec!(200)).await;

        let stats = selector.pool_stats().await.unwrap();
        assert_eq!(stats.tiers[0].tier, Tier::Discounted);
        assert_eq!(stats.tiers[0].count, 2);
        assert_eq!(stats.tiers[0].total_balance, dec!(7));
        assert_eq!(stats.tiers[0].avg_balance, dec!(3.5));
        assert_eq!(stats.tiers[0].status, TierStatus::Low);
        assert_eq!(stats.tiers[1].status, TierStatus::Active);
        assert_eq!(stats.active_tier, Some(Tier::Investor));
        assert_eq!(stats.total_available, dec!(237));

        let alerts = selector.low_balance_alerts().await.unwrap();
        let codes: Vec<&str> = alerts.iter().map(|a| a.code).collect();
        assert_eq!(codes, vec!["discounted_low", "investor_low", "discounted_empty"]);
        assert_eq!(alerts[2].level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_all_empty_alert() {
        let selector = selector().await;
        let alerts = selector.low_balance_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, "all_empty");
        assert_eq!(alerts[0].level, AlertLevel::Emergency);

        let stats = selector.pool_stats().await.unwrap();
        assert_eq!(stats.active_tier, None);
    }
}
