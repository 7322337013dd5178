pub mod accounts;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod money;
pub mod observability;
pub mod pricing;
pub mod server;
pub mod signals;
pub mod upstream;
