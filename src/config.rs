use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub tiers: TiersConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_body_limit")]
    pub request_body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            request_body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Upstream LLM API (OpenRouter-compatible)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    /// Hard timeout for a proxied chat completion
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
    /// Sent as `HTTP-Referer` for upstream attribution
    #[serde(default = "default_site_url")]
    pub site_url: String,
    /// Sent as `X-Title` for upstream attribution
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            timeout_seconds: default_upstream_timeout(),
            site_url: default_site_url(),
            app_name: default_app_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingConfig {
    /// Freshness window for cached model prices (default: 1 hour)
    #[serde(default = "default_pricing_ttl")]
    pub ttl_seconds: u64,
    /// Timeout for a catalog refresh, shorter than the proxy timeout
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub refresh_on_startup: bool,
    /// Completion budget assumed for estimation when the request sets no `max_tokens`
    #[serde(default = "default_completion_tokens")]
    pub default_completion_tokens: u32,
    /// Skip catalog entries priced at zero for both prompt and completion
    #[serde(default = "default_true")]
    pub skip_free_models: bool,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_pricing_ttl(),
            refresh_timeout_seconds: default_refresh_timeout(),
            refresh_on_startup: true,
            default_completion_tokens: default_completion_tokens(),
            skip_free_models: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectionConfig {
    /// Headroom an account must keep above the estimated upstream cost
    #[serde(default = "default_min_margin")]
    pub min_margin: Decimal,
    /// How long an account with an unusable credential is skipped
    #[serde(default = "default_quarantine_seconds")]
    pub quarantine_seconds: u64,
    /// A tier whose total balance exceeds this is considered active
    #[serde(default = "default_active_tier_floor")]
    pub active_tier_floor: Decimal,
    /// Accounts below this balance raise a low-balance warning
    #[serde(default = "default_low_balance_floor")]
    pub low_balance_floor: Decimal,
    /// Accounts at or below this balance count as empty
    #[serde(default = "default_empty_account_floor")]
    pub empty_account_floor: Decimal,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_margin: default_min_margin(),
            quarantine_seconds: default_quarantine_seconds(),
            active_tier_floor: default_active_tier_floor(),
            low_balance_floor: default_low_balance_floor(),
            empty_account_floor: default_empty_account_floor(),
        }
    }
}

/// Defaults applied to newly created funding accounts, per tier
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TiersConfig {
    #[serde(default = "default_discounted_tier")]
    pub discounted: TierDefaults,
    #[serde(default = "default_regular_tier")]
    pub regular: TierDefaults,
    #[serde(default = "default_investor_tier")]
    pub investor: InvestorTierDefaults,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            discounted: default_discounted_tier(),
            regular: default_regular_tier(),
            investor: default_investor_tier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierDefaults {
    /// Fraction of the upstream list price the operator pays
    pub cost_basis: Decimal,
    /// Fraction of the upstream list price charged to the client
    pub client_multiplier: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvestorTierDefaults {
    pub cost_basis: Decimal,
    pub client_multiplier: Decimal,
    /// Investor's cut, as a fraction of the upstream list price
    pub commission_rate: Decimal,
    /// Balance floor below which the account is not selected
    pub min_threshold: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Secret used to derive the AES-256-GCM key for stored upstream credentials
    pub encryption_key: String,
    /// Bearer token for the /admin routes (disabled when absent)
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

fn default_database_path() -> String {
    "./data/ai-router.db".to_string()
}

fn default_upstream_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_site_url() -> String {
    "https://airouter.host".to_string()
}

fn default_app_name() -> String {
    "AI Router".to_string()
}

fn default_pricing_ttl() -> u64 {
    3600
}

fn default_refresh_timeout() -> u64 {
    15
}

fn default_completion_tokens() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_min_margin() -> Decimal {
    dec!(1.0)
}

fn default_quarantine_seconds() -> u64 {
    300
}

fn default_active_tier_floor() -> Decimal {
    dec!(10)
}

fn default_low_balance_floor() -> Decimal {
    dec!(50)
}

fn default_empty_account_floor() -> Decimal {
    dec!(5)
}

fn default_discounted_tier() -> TierDefaults {
    TierDefaults {
        cost_basis: dec!(0.30),
        client_multiplier: dec!(0.80),
    }
}

fn default_regular_tier() -> TierDefaults {
    TierDefaults {
        cost_basis: dec!(1.00),
        client_multiplier: dec!(1.05),
    }
}

fn default_investor_tier() -> InvestorTierDefaults {
    InvestorTierDefaults {
        cost_basis: dec!(0.30),
        client_multiplier: dec!(0.80),
        commission_rate: dec!(0.01),
        min_threshold: dec!(50),
    }
}

/// Load configuration from a TOML file layered with `AI_ROUTER__*` environment variables
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(config::Environment::with_prefix("AI_ROUTER").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.security.encryption_key.trim().is_empty() {
        anyhow::bail!("security.encryption_key cannot be empty");
    }

    if cfg.upstream.timeout_seconds == 0 {
        anyhow::bail!("upstream.timeout_seconds must be > 0");
    }
    if cfg.pricing.ttl_seconds == 0 || cfg.pricing.refresh_timeout_seconds == 0 {
        anyhow::bail!("pricing.ttl_seconds and pricing.refresh_timeout_seconds must be > 0");
    }

    if cfg.selection.min_margin.is_sign_negative() {
        anyhow::bail!("selection.min_margin cannot be negative");
    }
    if cfg.selection.quarantine_seconds == 0 {
        anyhow::bail!("selection.quarantine_seconds must be > 0");
    }

    validate_tier("discounted", &cfg.tiers.discounted.cost_basis, &cfg.tiers.discounted.client_multiplier)?;
    validate_tier("regular", &cfg.tiers.regular.cost_basis, &cfg.tiers.regular.client_multiplier)?;
    validate_tier("investor", &cfg.tiers.investor.cost_basis, &cfg.tiers.investor.client_multiplier)?;

    if cfg.tiers.investor.commission_rate.is_sign_negative() {
        anyhow::bail!("tiers.investor.commission_rate cannot be negative");
    }
    if cfg.tiers.investor.min_threshold.is_sign_negative() {
        anyhow::bail!("tiers.investor.min_threshold cannot be negative");
    }

    Ok(())
}

fn validate_tier(name: &str, cost_basis: &Decimal, client_multiplier: &Decimal) -> anyhow::Result<()> {
    if *cost_basis <= Decimal::ZERO || *cost_basis > dec!(10) {
        anyhow::bail!("tiers.{}.cost_basis must be in (0, 10], got {}", name, cost_basis);
    }
    if *client_multiplier <= Decimal::ZERO {
        anyhow::bail!("tiers.{}.client_multiplier must be > 0, got {}", name, client_multiplier);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        server: ServerConfig::default(),
        database: DatabaseConfig::default(),
        upstream: UpstreamConfig::default(),
        pricing: PricingConfig::default(),
        selection: SelectionConfig::default(),
        tiers: TiersConfig::default(),
        security: SecurityConfig {
            encryption_key: "test-encryption-key".to_string(),
            admin_token: Some("admin-secret".to_string()),
        },
    }
}
