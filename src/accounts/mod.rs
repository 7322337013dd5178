pub mod models;
pub mod selector;
pub mod store;

pub use models::{AccountKind, AccountStatus, FundingAccount, Tier, UsageDebit};
pub use selector::{AccountSelector, PoolAlert, PoolStats, SelectedAccount, SelectorError};
pub use store::{AccountError, AccountStore, NewAccount};
