//! Balance Ledger
//!
//! Per-user balances mutated only through single conditional UPDATE
//! statements. A [`Reservation`] is the hold taken before an upstream call; it
//! is consumed by exactly one of [`BalanceLedger::settle`] or
//! [`BalanceLedger::refund`], so a reserve can never be resolved twice.

use crate::money::{from_units, to_units};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;

/// Bounded retries for the compare-and-swap partial charge
const MAX_CHARGE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientBalance {
    pub user_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub lifetime_spent: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub lifetime_earned: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub lifetime_savings: Decimal,
    pub last_deposit_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ClientBalanceRow {
    user_id: String,
    balance_units: i64,
    lifetime_spent_units: i64,
    lifetime_earned_units: i64,
    lifetime_savings_units: i64,
    last_deposit_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<ClientBalanceRow> for ClientBalance {
    fn from(row: ClientBalanceRow) -> Self {
        Self {
            user_id: row.user_id,
            balance: from_units(row.balance_units),
            lifetime_spent: from_units(row.lifetime_spent_units),
            lifetime_earned: from_units(row.lifetime_earned_units),
            lifetime_savings: from_units(row.lifetime_savings_units),
            last_deposit_at: row.last_deposit_at,
            updated_at: row.updated_at,
        }
    }
}

/// A provisional hold on a client balance
#[derive(Debug)]
#[must_use = "a reservation must be settled or refunded"]
pub struct Reservation {
    user_id: String,
    amount: Decimal,
}

impl Reservation {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }
}

/// Result of an extra charge beyond a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeOutcome {
    pub charged: Decimal,
    /// Part of the requested amount the balance could not cover
    pub shortfall: Decimal,
}

/// How a reservation was converted into an exact charge.
///
/// `reserved == refunded + charged - extra_charged` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub reserved: Decimal,
    pub refunded: Decimal,
    pub extra_charged: Decimal,
    pub shortfall: Decimal,
    /// Total actually taken from the client for this request
    pub charged: Decimal,
}

#[derive(Clone)]
pub struct BalanceLedger {
    pool: SqlitePool,
}

impl BalanceLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn balance(&self, user_id: &str) -> Result<Option<ClientBalance>, LedgerError> {
        let row = sqlx::query_as::<_, ClientBalanceRow>("SELECT * FROM client_balances WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ClientBalance::from))
    }

    /// Credit funds from a payment. Creates the balance row on first deposit.
    pub async fn deposit(&self, user_id: &str, amount: Decimal) -> Result<ClientBalance, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let units = to_units(amount);
        let now = Utc::now();

        let row = sqlx::query_as::<_, ClientBalanceRow>(
            r#"
            INSERT INTO client_balances (user_id, balance_units, lifetime_earned_units, last_deposit_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                balance_units = balance_units + excluded.balance_units,
                lifetime_earned_units = lifetime_earned_units + excluded.lifetime_earned_units,
                last_deposit_at = excluded.last_deposit_at,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(units)
        .bind(units)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, amount = %amount, "Deposit credited");
        Ok(row.into())
    }

    /// Hold `amount` if the balance covers it. `None` means insufficient funds
    /// (or no balance row) and nothing was changed.
    pub async fn reserve(&self, user_id: &str, amount: Decimal) -> Result<Option<Reservation>, LedgerError> {
        if amount < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let units = to_units(amount);

        let result = sqlx::query(
            r#"
            UPDATE client_balances
            SET balance_units = balance_units - ?, updated_at = ?
            WHERE user_id = ? AND balance_units >= ?
            "#,
        )
        .bind(units)
        .bind(Utc::now())
        .bind(user_id)
        .bind(units)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Reservation {
            user_id: user_id.to_string(),
            amount: from_units(units),
        }))
    }

    /// Unconditionally credit `amount` back
    pub async fn release(&self, user_id: &str, amount: Decimal) -> Result<(), LedgerError> {
        if amount < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if amount.is_zero() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO client_balances (user_id, balance_units, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                balance_units = balance_units + excluded.balance_units,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(to_units(amount))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Undo a reservation in full
    pub async fn refund(&self, reservation: Reservation) -> Result<Decimal, LedgerError> {
        self.release(&reservation.user_id, reservation.amount).await?;
        tracing::info!(user_id = %reservation.user_id, amount = %reservation.amount, "Reservation refunded");
        Ok(reservation.amount)
    }

    /// Take `extra` beyond a reservation, never driving the balance below zero.
    ///
    /// Tries the full amount first; if the balance cannot absorb it, takes
    /// whatever is left with a compare-and-swap on the observed balance and
    /// reports the remainder as shortfall.
    pub async fn charge(&self, user_id: &str, extra: Decimal) -> Result<ChargeOutcome, LedgerError> {
        if extra < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(extra));
        }
        let extra_units = to_units(extra);
        if extra_units == 0 {
            return Ok(ChargeOutcome {
                charged: Decimal::ZERO,
                shortfall: Decimal::ZERO,
            });
        }

        for _ in 0..MAX_CHARGE_ATTEMPTS {
            let full = sqlx::query(
                r#"
                UPDATE client_balances
                SET balance_units = balance_units - ?, updated_at = ?
                WHERE user_id = ? AND balance_units >= ?
                "#,
            )
            .bind(extra_units)
            .bind(Utc::now())
            .bind(user_id)
            .bind(extra_units)
            .execute(&self.pool)
            .await?;

            if full.rows_affected() == 1 {
                return Ok(ChargeOutcome {
                    charged: from_units(extra_units),
                    shortfall: Decimal::ZERO,
                });
            }

            let observed: Option<i64> =
                sqlx::query_scalar("SELECT balance_units FROM client_balances WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await?;

            let observed = match observed {
                Some(units) if units >= extra_units => continue,
                Some(units) if units > 0 => units,
                _ => break,
            };

            let partial = sqlx::query(
                r#"
                UPDATE client_balances
                SET balance_units = 0, updated_at = ?
                WHERE user_id = ? AND balance_units = ?
                "#,
            )
            .bind(Utc::now())
            .bind(user_id)
            .bind(observed)
            .execute(&self.pool)
            .await?;

            if partial.rows_affected() == 1 {
                let outcome = ChargeOutcome {
                    charged: from_units(observed),
                    shortfall: from_units(extra_units - observed),
                };
                tracing::warn!(
                    user_id = %user_id,
                    charged = %outcome.charged,
                    shortfall = %outcome.shortfall,
                    "Balance could not absorb extra charge, shortfall absorbed by operator"
                );
                return Ok(outcome);
            }
        }

        tracing::warn!(user_id = %user_id, shortfall = %extra, "Extra charge not collected");
        Ok(ChargeOutcome {
            charged: Decimal::ZERO,
            shortfall: from_units(extra_units),
        })
    }

    /// Convert a reservation into the exact client cost.
    ///
    /// Refunds the unused part or charges the overrun, and updates the
    /// lifetime counters by what was actually taken.
    pub async fn settle(
        &self,
        reservation: Reservation,
        actual_client_cost: Decimal,
        savings: Decimal,
    ) -> Result<Settlement, LedgerError> {
        if actual_client_cost < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(actual_client_cost));
        }
        let reserved_units = to_units(reservation.amount);
        let actual_units = to_units(actual_client_cost);
        let savings_units = to_units(savings.max(Decimal::ZERO));

        let (refund_units, extra) = if actual_units <= reserved_units {
            (reserved_units - actual_units, None)
        } else {
            let outcome = self
                .charge(&reservation.user_id, from_units(actual_units - reserved_units))
                .await?;
            (0, Some(outcome))
        };

        let extra_units = extra.map(|o| to_units(o.charged)).unwrap_or(0);
        let charged_units = reserved_units - refund_units + extra_units;

        sqlx::query(
            r#"
            UPDATE client_balances
            SET balance_units = balance_units + ?,
                lifetime_spent_units = lifetime_spent_units + ?,
                lifetime_savings_units = lifetime_savings_units + ?,
                updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(refund_units)
        .bind(charged_units)
        .bind(savings_units)
        .bind(Utc::now())
        .bind(&reservation.user_id)
        .execute(&self.pool)
        .await?;

        Ok(Settlement {
            reserved: from_units(reserved_units),
            refunded: from_units(refund_units),
            extra_charged: from_units(extra_units),
            shortfall: extra.map(|o| o.shortfall).unwrap_or(Decimal::ZERO),
            charged: from_units(charged_units),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rust_decimal_macros::dec;

    async fn ledger_with(user: &str, amount: Decimal) -> BalanceLedger {
        let pool = db::connect_in_memory().await.unwrap();
        let ledger = BalanceLedger::new(pool);
        ledger.deposit(user, amount).await.unwrap();
        ledger
    }

    async fn balance_of(ledger: &BalanceLedger, user: &str) -> Decimal {
        ledger.balance(user).await.unwrap().unwrap().balance
    }

    #[tokio::test]
    async fn test_deposit_creates_and_accumulates() {
        let pool = db::connect_in_memory().await.unwrap();
        let ledger = BalanceLedger::new(pool);
        assert!(ledger.balance("u1").await.unwrap().is_none());

        ledger.deposit("u1", dec!(10)).await.unwrap();
        let balance = ledger.deposit("u1", dec!(2.5)).await.unwrap();

        assert_eq!(balance.balance, dec!(12.5));
        assert_eq!(balance.lifetime_earned, dec!(12.5));
        assert!(balance.last_deposit_at.is_some());
        assert!(matches!(
            ledger.deposit("u1", dec!(0)).await,
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_reserve_rejects_insufficient_balance() {
        let ledger = ledger_with("u1", dec!(0.05)).await;

        assert!(ledger.reserve("u1", dec!(0.10)).await.unwrap().is_none());
        assert_eq!(balance_of(&ledger, "u1").await, dec!(0.05));

        // No balance row at all
        assert!(ledger.reserve("nobody", dec!(0.01)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserve_exact_balance() {
        let ledger = ledger_with("u1", dec!(0.10)).await;
        let reservation = ledger.reserve("u1", dec!(0.10)).await.unwrap().unwrap();
        assert_eq!(balance_of(&ledger, "u1").await, Decimal::ZERO);
        ledger.refund(reservation).await.unwrap();
    }

    #[tokio::test]
    async fn test_refund_restores_exact_amount() {
        let ledger = ledger_with("u1", dec!(1)).await;

        let reservation = ledger.reserve("u1", dec!(0.123456789)).await.unwrap().unwrap();
        assert_eq!(balance_of(&ledger, "u1").await, dec!(0.876543211));

        let refunded = ledger.refund(reservation).await.unwrap();
        assert_eq!(refunded, dec!(0.123456789));

        let balance = ledger.balance("u1").await.unwrap().unwrap();
        assert_eq!(balance.balance, dec!(1));
        // Aborted requests never touch lifetime totals
        assert_eq!(balance.lifetime_spent, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_settle_refunds_overestimate() {
        let ledger = ledger_with("u1", dec!(1)).await;

        let reservation = ledger.reserve("u1", dec!(0.5)).await.unwrap().unwrap();
        let settlement = ledger.settle(reservation, dec!(0.2), dec!(0.05)).await.unwrap();

        assert_eq!(settlement.refunded, dec!(0.3));
        assert_eq!(settlement.charged, dec!(0.2));
        assert_eq!(settlement.reserved, settlement.refunded + settlement.charged);

        let balance = ledger.balance("u1").await.unwrap().unwrap();
        assert_eq!(balance.balance, dec!(0.8));
        assert_eq!(balance.lifetime_spent, dec!(0.2));
        assert_eq!(balance.lifetime_savings, dec!(0.05));
    }

    #[tokio::test]
    async fn test_settle_charges_underestimate() {
        let ledger = ledger_with("u1", dec!(1)).await;

        let reservation = ledger.reserve("u1", dec!(0.2)).await.unwrap().unwrap();
        let settlement = ledger.settle(reservation, dec!(0.35), Decimal::ZERO).await.unwrap();

        assert_eq!(settlement.refunded, Decimal::ZERO);
        assert_eq!(settlement.extra_charged, dec!(0.15));
        assert_eq!(settlement.shortfall, Decimal::ZERO);
        assert_eq!(settlement.charged, dec!(0.35));
        assert_eq!(balance_of(&ledger, "u1").await, dec!(0.65));
    }

    #[tokio::test]
    async fn test_settle_overrun_never_goes_negative() {
        let ledger = ledger_with("u1", dec!(0.3)).await;

        let reservation = ledger.reserve("u1", dec!(0.2)).await.unwrap().unwrap();
        let settlement = ledger.settle(reservation, dec!(0.5), Decimal::ZERO).await.unwrap();

        assert_eq!(settlement.extra_charged, dec!(0.1));
        assert_eq!(settlement.shortfall, dec!(0.2));
        assert_eq!(settlement.charged, dec!(0.3));

        let balance = ledger.balance("u1").await.unwrap().unwrap();
        assert_eq!(balance.balance, Decimal::ZERO);
        assert_eq!(balance.lifetime_spent, dec!(0.3));
    }

    #[tokio::test]
    async fn test_charge_on_empty_balance_is_all_shortfall() {
        let ledger = ledger_with("u1", dec!(0.1)).await;
        let reservation = ledger.reserve("u1", dec!(0.1)).await.unwrap().unwrap();

        let outcome = ledger.charge("u1", dec!(0.05)).await.unwrap();
        assert_eq!(outcome.charged, Decimal::ZERO);
        assert_eq!(outcome.shortfall, dec!(0.05));

        ledger.refund(reservation).await.unwrap();
        assert_eq!(balance_of(&ledger, "u1").await, dec!(0.1));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overdraw() {
        let ledger = ledger_with("u1", dec!(1)).await;

        let mut handles = Vec::new();
        for _ in 0..25 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.reserve("u1", dec!(0.07)).await.unwrap()
            }));
        }

        let mut granted = Vec::new();
        for handle in handles {
            if let Some(reservation) = handle.await.unwrap() {
                granted.push(reservation);
            }
        }

        // floor(1 / 0.07) = 14
        assert_eq!(granted.len(), 14);
        let remaining = balance_of(&ledger, "u1").await;
        assert_eq!(remaining, dec!(1) - dec!(0.07) * Decimal::from(14));
        assert!(remaining >= Decimal::ZERO);

        for reservation in granted {
            ledger.refund(reservation).await.unwrap();
        }
        assert_eq!(balance_of(&ledger, "u1").await, dec!(1));
    }
}
