use crate::money::{from_units, round};
use crate::pricing::calculator::{CostBreakdown, TierParameters};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Cost/margin class of a funding account, selected in this priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Discounted,
    Investor,
    Regular,
}

impl Tier {
    pub const PRIORITY: [Tier; 3] = [Tier::Discounted, Tier::Investor, Tier::Regular];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Discounted => "discounted",
            Tier::Investor => "investor",
            Tier::Regular => "regular",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discounted" => Ok(Tier::Discounted),
            "investor" => Ok(Tier::Investor),
            "regular" => Ok(Tier::Regular),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Paused,
    /// Terminal
    Revoked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Paused => "paused",
            AccountStatus::Revoked => "revoked",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "paused" => Ok(AccountStatus::Paused),
            "revoked" => Ok(AccountStatus::Revoked),
            other => Err(format!("unknown account status '{}'", other)),
        }
    }
}

/// Who owns the credential, and the fields that only make sense for that owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AccountKind {
    Operator {
        /// Discounted or Regular
        tier: Tier,
        /// Rotation counter within the tier
        usage_weight: i64,
    },
    Investor {
        owner_user_id: Option<String>,
        #[serde(with = "rust_decimal::serde::str")]
        commission_rate: Decimal,
        /// Balance floor below which the account is not selected
        #[serde(with = "rust_decimal::serde::str")]
        min_threshold: Decimal,
        /// Commission accrued to the investor
        #[serde(with = "rust_decimal::serde::str")]
        total_earned: Decimal,
    },
}

/// A funding account (upstream credential plus the balance it holds)
#[derive(Debug, Clone, Serialize)]
pub struct FundingAccount {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: AccountKind,
    #[serde(skip)]
    pub credential_encrypted: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub cost_basis: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub client_multiplier: Decimal,
    /// Cumulative amount debited for upstream usage
    #[serde(with = "rust_decimal::serde::str")]
    pub total_spent: Decimal,
    pub status: AccountStatus,
    pub last_selected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// What a settled request takes from the funding account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageDebit {
    /// Drained from the account balance and added to `total_spent`
    pub debit: Decimal,
    /// The investor's share of the debit, added to `total_earned`
    pub commission: Decimal,
}

impl FundingAccount {
    pub fn tier(&self) -> Tier {
        match &self.kind {
            AccountKind::Operator { tier, .. } => *tier,
            AccountKind::Investor { .. } => Tier::Investor,
        }
    }

    pub fn commission_rate(&self) -> Decimal {
        match &self.kind {
            AccountKind::Operator { .. } => Decimal::ZERO,
            AccountKind::Investor { commission_rate, .. } => *commission_rate,
        }
    }

    pub fn tier_parameters(&self) -> TierParameters {
        TierParameters {
            tier: self.tier(),
            cost_basis: self.cost_basis,
            client_multiplier: self.client_multiplier,
            commission_rate: self.commission_rate(),
        }
    }

    /// The account pays the full operator cost of a request, commission included
    pub fn usage_debit(&self, cost: &CostBreakdown) -> UsageDebit {
        UsageDebit {
            debit: cost.operator_cost,
            commission: round(cost.upstream_cost * self.commission_rate()),
        }
    }
}

/// Raw `funding_accounts` row
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FundingAccountRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub tier: String,
    pub owner_user_id: Option<String>,
    pub credential_encrypted: String,
    pub balance_units: i64,
    pub cost_basis: String,
    pub client_multiplier: String,
    pub commission_rate: String,
    pub min_threshold_units: i64,
    pub usage_weight: i64,
    pub total_spent_units: i64,
    pub total_earned_units: i64,
    pub status: String,
    pub last_selected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl TryFrom<FundingAccountRow> for FundingAccount {
    type Error = String;

    fn try_from(row: FundingAccountRow) -> Result<Self, Self::Error> {
        let parse = |field: &str, raw: &str| {
            raw.parse::<Decimal>()
                .map_err(|e| format!("account {}: invalid {} '{}': {}", row.id, field, raw, e))
        };

        let kind = match row.kind.as_str() {
            "operator" => AccountKind::Operator {
                tier: row.tier.parse()?,
                usage_weight: row.usage_weight,
            },
            "investor" => AccountKind::Investor {
                owner_user_id: row.owner_user_id.clone(),
                commission_rate: parse("commission_rate", &row.commission_rate)?,
                min_threshold: from_units(row.min_threshold_units),
                total_earned: from_units(row.total_earned_units),
            },
            other => return Err(format!("account {}: unknown kind '{}'", row.id, other)),
        };

        Ok(FundingAccount {
            cost_basis: parse("cost_basis", &row.cost_basis)?,
            client_multiplier: parse("client_multiplier", &row.client_multiplier)?,
            status: row.status.parse()?,
            id: row.id,
            name: row.name,
            kind,
            credential_encrypted: row.credential_encrypted,
            balance: from_units(row.balance_units),
            total_spent: from_units(row.total_spent_units),
            last_selected_at: row.last_selected_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            revoked_at: row.revoked_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::calculator::{breakdown, CostSource};
    use rust_decimal_macros::dec;

    fn account(kind: AccountKind, cost_basis: Decimal) -> FundingAccount {
        let now = Utc::now();
        FundingAccount {
            id: "acc".into(),
            name: "acc".into(),
            kind,
            credential_encrypted: String::new(),
            balance: dec!(100),
            cost_basis,
            client_multiplier: dec!(0.80),
            total_spent: Decimal::ZERO,
            status: AccountStatus::Active,
            last_selected_at: None,
            created_at: now,
            updated_at: now,
            revoked_at: None,
        }
    }

    #[test]
    fn test_tier_round_trips_through_str() {
        for tier in Tier::PRIORITY {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert!("gold".parse::<Tier>().is_err());
    }

    #[test]
    fn test_operator_debit() {
        let acc = account(
            AccountKind::Operator {
                tier: Tier::Discounted,
                usage_weight: 0,
            },
            dec!(0.30),
        );
        let cost = breakdown(dec!(2), &acc.tier_parameters(), CostSource::UpstreamReported);
        let debit = acc.usage_debit(&cost);
        assert_eq!(debit.debit, dec!(0.60));
        assert_eq!(debit.commission, Decimal::ZERO);
        assert_eq!(acc.tier_parameters().tier, Tier::Discounted);
    }

    #[test]
    fn test_investor_debit_includes_commission() {
        let acc = account(
            AccountKind::Investor {
                owner_user_id: Some("investor-1".into()),
                commission_rate: dec!(0.01),
                min_threshold: dec!(50),
                total_earned: Decimal::ZERO,
            },
            dec!(0.30),
        );
        let cost = breakdown(dec!(2), &acc.tier_parameters(), CostSource::UpstreamReported);
        let debit = acc.usage_debit(&cost);
        // operator cost = 2 × (0.30 + 0.01)
        assert_eq!(debit.debit, dec!(0.62));
        assert_eq!(debit.debit, cost.operator_cost);
        assert_eq!(debit.commission, dec!(0.02));

        let params = acc.tier_parameters();
        assert_eq!(params.tier, Tier::Investor);
        assert_eq!(params.commission_rate, dec!(0.01));
    }
}
