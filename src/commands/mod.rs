//! Command implementations for the CLI
//!
//! - serve: Start the router server
//! - account: Funding account administration
//! - key: Access key issuance and revocation
//! - balance: Client balance deposits and lookups
//! - pool: Pool stats, alerts and usage-weight reset
//! - pricing: Catalog sync and stored prices
//! - config: Configuration display and validation

pub mod account;
pub mod balance;
pub mod config;
pub mod key;
pub mod pool;
pub mod pricing;
pub mod serve;

use ai_router::{
    accounts::{AccountSelector, AccountStore},
    auth::AccessKeyStore,
    config::{load_config, Config},
    crypto::CredentialCipher,
    db,
    ledger::BalanceLedger,
    logging::init_tracing,
};
use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::path::Path;

/// Everything an administrative command needs: config plus stores over the database
pub struct Context {
    pub config: Config,
    pub pool: SqlitePool,
    pub selector: AccountSelector,
    pub ledger: BalanceLedger,
    pub keys: AccessKeyStore,
}

impl Context {
    pub async fn open(config_path: &Path) -> Result<Self> {
        let config = load_config(config_path)?;
        // Keep command output readable; RUST_LOG still overrides
        init_tracing("warn", &config.server.log_format);

        let pool = db::connect(&config.database.path).await?;
        let store = AccountStore::new(
            pool.clone(),
            CredentialCipher::new(&config.security.encryption_key),
            config.tiers.clone(),
        );

        Ok(Self {
            selector: AccountSelector::new(pool.clone(), store, config.selection.clone()),
            ledger: BalanceLedger::new(pool.clone()),
            keys: AccessKeyStore::new(pool.clone()),
            pool,
            config,
        })
    }

    pub fn accounts(&self) -> &AccountStore {
        self.selector.store()
    }
}

/// `$12.3400` style rendering for tables
pub fn usd(amount: Decimal) -> String {
    format!("${:.4}", amount)
}
