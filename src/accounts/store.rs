//! Funding account CRUD and usage debits

use crate::accounts::models::{AccountStatus, FundingAccount, FundingAccountRow, Tier, UsageDebit};
use crate::config::TiersConfig;
use crate::crypto::{CredentialCipher, CryptoError};
use crate::money::to_units;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("funding account not found: {0}")]
    NotFound(String),
    #[error("funding account {0} is revoked")]
    Revoked(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(Decimal),
    #[error("corrupt account row: {0}")]
    Corrupt(String),
    #[error("credential encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Parameters for a new account. Unset rates fall back to the tier defaults.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub tier: Tier,
    /// Plaintext upstream credential; stored encrypted
    pub credential: String,
    pub balance: Decimal,
    pub owner_user_id: Option<String>,
    pub cost_basis: Option<Decimal>,
    pub client_multiplier: Option<Decimal>,
    pub commission_rate: Option<Decimal>,
    pub min_threshold: Option<Decimal>,
}

impl NewAccount {
    pub fn new(name: impl Into<String>, tier: Tier, credential: impl Into<String>, balance: Decimal) -> Self {
        Self {
            name: name.into(),
            tier,
            credential: credential.into(),
            balance,
            owner_user_id: None,
            cost_basis: None,
            client_multiplier: None,
            commission_rate: None,
            min_threshold: None,
        }
    }
}

#[derive(Clone)]
pub struct AccountStore {
    pool: SqlitePool,
    cipher: CredentialCipher,
    defaults: TiersConfig,
}

impl AccountStore {
    pub fn new(pool: SqlitePool, cipher: CredentialCipher, defaults: TiersConfig) -> Self {
        Self { pool, cipher, defaults }
    }

    pub async fn create(&self, new: NewAccount) -> Result<FundingAccount, AccountError> {
        if new.balance.is_sign_negative() {
            return Err(AccountError::InvalidAmount(new.balance));
        }

        let (kind, cost_basis, client_multiplier, commission_rate, min_threshold) = match new.tier {
            Tier::Discounted | Tier::Regular => {
                let defaults = if new.tier == Tier::Discounted {
                    &self.defaults.discounted
                } else {
                    &self.defaults.regular
                };
                (
                    "operator",
                    new.cost_basis.unwrap_or(defaults.cost_basis),
                    new.client_multiplier.unwrap_or(defaults.client_multiplier),
                    Decimal::ZERO,
                    Decimal::ZERO,
                )
            }
            Tier::Investor => {
                let defaults = &self.defaults.investor;
                (
                    "investor",
                    new.cost_basis.unwrap_or(defaults.cost_basis),
                    new.client_multiplier.unwrap_or(defaults.client_multiplier),
                    new.commission_rate.unwrap_or(defaults.commission_rate),
                    new.min_threshold.unwrap_or(defaults.min_threshold),
                )
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let credential_encrypted = self.cipher.encrypt(&new.credential)?;

        let row = sqlx::query_as::<_, FundingAccountRow>(
            r#"
            INSERT INTO funding_accounts (
                id, name, kind, tier, owner_user_id, credential_encrypted, balance_units,
                cost_basis, client_multiplier, commission_rate, min_threshold_units,
                status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(kind)
        .bind(new.tier.as_str())
        .bind(&new.owner_user_id)
        .bind(&credential_encrypted)
        .bind(to_units(new.balance))
        .bind(cost_basis.to_string())
        .bind(client_multiplier.to_string())
        .bind(commission_rate.to_string())
        .bind(to_units(min_threshold))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!(account_id = %id, tier = %new.tier, name = %new.name, "Funding account created");
        FundingAccount::try_from(row).map_err(AccountError::Corrupt)
    }

    pub async fn get(&self, id: &str) -> Result<FundingAccount, AccountError> {
        let row = sqlx::query_as::<_, FundingAccountRow>("SELECT * FROM funding_accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AccountError::NotFound(id.to_string()))?;

        FundingAccount::try_from(row).map_err(AccountError::Corrupt)
    }

    /// All accounts in tier priority order, revoked last
    pub async fn list(&self) -> Result<Vec<FundingAccount>, AccountError> {
        let rows = sqlx::query_as::<_, FundingAccountRow>(
            r#"
            SELECT * FROM funding_accounts
            ORDER BY status = 'revoked',
                     CASE tier WHEN 'discounted' THEN 0 WHEN 'investor' THEN 1 ELSE 2 END,
                     created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| FundingAccount::try_from(row).map_err(AccountError::Corrupt))
            .collect()
    }

    pub async fn top_up(&self, id: &str, amount: Decimal) -> Result<FundingAccount, AccountError> {
        if amount <= Decimal::ZERO {
            return Err(AccountError::InvalidAmount(amount));
        }

        let updated = sqlx::query(
            r#"
            UPDATE funding_accounts
            SET balance_units = balance_units + ?, updated_at = ?
            WHERE id = ? AND status != 'revoked'
            "#,
        )
        .bind(to_units(amount))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.missing_or_revoked(id).await);
        }

        info!(account_id = %id, amount = %amount, "Funding account topped up");
        self.get(id).await
    }

    /// Pause or resume. Revoked accounts stay revoked.
    pub async fn set_status(&self, id: &str, status: AccountStatus) -> Result<FundingAccount, AccountError> {
        if status == AccountStatus::Revoked {
            return self.revoke(id).await;
        }

        let updated = sqlx::query(
            "UPDATE funding_accounts SET status = ?, updated_at = ? WHERE id = ? AND status != 'revoked'",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.missing_or_revoked(id).await);
        }

        info!(account_id = %id, status = status.as_str(), "Funding account status changed");
        self.get(id).await
    }

    pub async fn revoke(&self, id: &str) -> Result<FundingAccount, AccountError> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE funding_accounts
            SET status = 'revoked', revoked_at = ?, updated_at = ?
            WHERE id = ? AND status != 'revoked'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.missing_or_revoked(id).await);
        }

        warn!(account_id = %id, "Funding account revoked");
        self.get(id).await
    }

    /// Debit a settled request's usage. Returns the new balance.
    ///
    /// Not balance-gated: the upstream has already been paid, so the ledger
    /// must reflect it even if the account overdrew.
    pub async fn debit_for_use(&self, id: &str, usage: UsageDebit) -> Result<Decimal, AccountError> {
        let debit_units = to_units(usage.debit);

        let balance_units: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE funding_accounts
            SET balance_units = balance_units - ?,
                total_spent_units = total_spent_units + ?,
                total_earned_units = total_earned_units + ?,
                updated_at = ?
            WHERE id = ?
            RETURNING balance_units
            "#,
        )
        .bind(debit_units)
        .bind(debit_units)
        .bind(to_units(usage.commission))
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let balance = crate::money::from_units(
            balance_units.ok_or_else(|| AccountError::NotFound(id.to_string()))?,
        );

        if balance.is_sign_negative() {
            warn!(account_id = %id, balance = %balance, "⚠️  Funding account overdrawn");
        }

        Ok(balance)
    }

    /// Decrypt a stored credential. Not for logging.
    pub fn decrypt_credential(&self, account: &FundingAccount) -> Result<String, CryptoError> {
        self.cipher.decrypt(&account.credential_encrypted)
    }

    async fn missing_or_revoked(&self, id: &str) -> AccountError {
        match self.get(id).await {
            Ok(_) => AccountError::Revoked(id.to_string()),
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::models::AccountKind;
    use crate::db;
    use rust_decimal_macros::dec;

    async fn store() -> AccountStore {
        let pool = db::connect_in_memory().await.unwrap();
        AccountStore::new(pool, CredentialCipher::new("test"), TiersConfig::default())
    }

    #[tokio::test]
    async fn test_create_applies_tier_defaults() {
        let store = store().await;

        let discounted = store
            .create(NewAccount::new("d1", Tier::Discounted, "sk-or-v1-d1", dec!(100)))
            .await
            .unwrap();
        assert_eq!(discounted.tier(), Tier::Discounted);
        assert_eq!(discounted.cost_basis, dec!(0.30));
        assert_eq!(discounted.client_multiplier, dec!(0.80));
        assert_eq!(discounted.balance, dec!(100));
        assert_ne!(discounted.credential_encrypted, "sk-or-v1-d1");
        assert_eq!(store.decrypt_credential(&discounted).unwrap(), "sk-or-v1-d1");

        let mut new = NewAccount::new("i1", Tier::Investor, "sk-or-v1-i1", dec!(500));
        new.owner_user_id = Some("investor-1".into());
        new.commission_rate = Some(dec!(0.02));
        let investor = store.create(new).await.unwrap();
        match &investor.kind {
            AccountKind::Investor {
                commission_rate,
                min_threshold,
                owner_user_id,
                ..
            } => {
                assert_eq!(*commission_rate, dec!(0.02));
                assert_eq!(*min_threshold, dec!(50));
                assert_eq!(owner_user_id.as_deref(), Some("investor-1"));
            }
            other => panic!("expected investor account, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = store().await;
        let acc = store
            .create(NewAccount::new("r1", Tier::Regular, "sk", dec!(10)))
            .await
            .unwrap();

        let acc = store.top_up(&acc.id, dec!(5)).await.unwrap();
        assert_eq!(acc.balance, dec!(15));

        let acc = store.set_status(&acc.id, AccountStatus::Paused).await.unwrap();
        assert_eq!(acc.status, AccountStatus::Paused);
        let acc = store.set_status(&acc.id, AccountStatus::Active).await.unwrap();
        assert_eq!(acc.status, AccountStatus::Active);

        let acc = store.revoke(&acc.id).await.unwrap();
        assert_eq!(acc.status, AccountStatus::Revoked);
        assert!(acc.revoked_at.is_some());

        // Terminal
        assert!(matches!(
            store.set_status(&acc.id, AccountStatus::Active).await,
            Err(AccountError::Revoked(_))
        ));
        assert!(matches!(store.top_up(&acc.id, dec!(1)).await, Err(AccountError::Revoked(_))));
        assert!(matches!(store.revoke("missing").await, Err(AccountError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_debit_for_use() {
        let store = store().await;
        let acc = store
            .create(NewAccount::new("i1", Tier::Investor, "sk", dec!(100)))
            .await
            .unwrap();

        let balance = store
            .debit_for_use(
                &acc.id,
                UsageDebit {
                    debit: dec!(0.62),
                    commission: dec!(0.02),
                },
            )
            .await
            .unwrap();
        assert_eq!(balance, dec!(99.38));

        let acc = store.get(&acc.id).await.unwrap();
        assert_eq!(acc.total_spent, dec!(0.62));
        match acc.kind {
            AccountKind::Investor { total_earned, .. } => assert_eq!(total_earned, dec!(0.02)),
            other => panic!("expected investor account, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_orders_by_tier() {
        let store = store().await;
        store.create(NewAccount::new("r", Tier::Regular, "sk", dec!(1))).await.unwrap();
        store.create(NewAccount::new("i", Tier::Investor, "sk", dec!(1))).await.unwrap();
        store.create(NewAccount::new("d", Tier::Discounted, "sk", dec!(1))).await.unwrap();

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["d", "i", "r"]);
    }
}
