use ai_router::accounts::Tier;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ai-router", version, about = "Metered AI API router")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true, env = "AI_ROUTER_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the router server (default)
    Serve,

    /// Manage funding accounts
    Account {
        #[command(subcommand)]
        action: AccountCommands,
    },

    /// Manage client access keys
    Key {
        #[command(subcommand)]
        action: KeyCommands,
    },

    /// Client balances
    Balance {
        #[command(subcommand)]
        action: BalanceCommands,
    },

    /// Funding pool health and maintenance
    Pool {
        #[command(subcommand)]
        action: PoolCommands,
    },

    /// Model pricing catalog
    Pricing {
        #[command(subcommand)]
        action: PricingCommands,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum AccountCommands {
    /// Register a funding account
    Add {
        #[arg(long)]
        name: String,

        /// discounted, investor or regular
        #[arg(long)]
        tier: Tier,

        /// Upstream API key, stored encrypted
        #[arg(long, env = "AI_ROUTER_ACCOUNT_CREDENTIAL", hide_env_values = true)]
        credential: String,

        /// Opening balance in USD
        #[arg(long, default_value = "0")]
        balance: Decimal,

        /// Owning user (investor accounts)
        #[arg(long)]
        owner: Option<String>,

        #[arg(long)]
        cost_basis: Option<Decimal>,

        #[arg(long)]
        client_multiplier: Option<Decimal>,

        #[arg(long)]
        commission_rate: Option<Decimal>,

        #[arg(long)]
        min_threshold: Option<Decimal>,
    },

    /// List funding accounts
    List,

    /// Add funds to an account
    TopUp { id: String, amount: Decimal },

    /// Take an account out of rotation
    Pause { id: String },

    /// Put a paused account back into rotation
    Resume { id: String },

    /// Permanently retire an account
    Revoke { id: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum KeyCommands {
    /// Issue a new access key (printed once)
    Issue {
        #[arg(long)]
        user: String,

        #[arg(long)]
        name: String,

        /// Restrict the key to a single model
        #[arg(long)]
        model: Option<String>,

        /// Expire the key after this many days
        #[arg(long)]
        expires_in_days: Option<i64>,
    },

    /// Deactivate an access key
    Revoke { id: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum BalanceCommands {
    /// Credit a client balance
    Deposit { user: String, amount: Decimal },

    /// Show a client balance
    Show { user: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PoolCommands {
    /// Per-tier totals and the active tier
    Stats,

    /// Low-balance alerts
    Alerts,

    /// Reset the discounted-tier rotation counters
    ResetWeights,
}

#[derive(Subcommand, Debug, Clone)]
pub enum PricingCommands {
    /// Fetch the upstream catalog and store every price
    Sync,

    /// List stored prices
    List,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display current configuration (with secrets masked)
    Show,

    /// Validate configuration file
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Serve if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli {
            config: PathBuf::from("config.toml"),
            command: None,
        };

        assert!(matches!(cli.get_command(), Commands::Serve));
    }

    #[test]
    fn test_cli_parsing_account_add() {
        let args = vec![
            "ai-router",
            "account",
            "add",
            "--name",
            "pool-1",
            "--tier",
            "investor",
            "--credential",
            "sk-or-v1-abc",
            "--balance",
            "250.50",
            "--owner",
            "user-7",
        ];
        let cli = Cli::try_parse_from(args).unwrap();

        match cli.get_command() {
            Commands::Account {
                action: AccountCommands::Add { tier, balance, owner, cost_basis, .. },
            } => {
                assert_eq!(tier, Tier::Investor);
                assert_eq!(balance, dec!(250.50));
                assert_eq!(owner.as_deref(), Some("user-7"));
                assert!(cost_basis.is_none());
            }
            other => panic!("Expected Account Add command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_tier() {
        let args = vec!["ai-router", "account", "add", "--name", "x", "--tier", "gold", "--credential", "k"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_cli_parsing_balance_deposit() {
        let cli = Cli::try_parse_from(["ai-router", "balance", "deposit", "user-1", "10"]).unwrap();

        match cli.get_command() {
            Commands::Balance {
                action: BalanceCommands::Deposit { user, amount },
            } => {
                assert_eq!(user, "user-1");
                assert_eq!(amount, dec!(10));
            }
            other => panic!("Expected Balance Deposit command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parsing_pool_reset_weights() {
        let cli = Cli::try_parse_from(["ai-router", "-c", "router.toml", "pool", "reset-weights"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("router.toml"));
        assert!(matches!(
            cli.get_command(),
            Commands::Pool {
                action: PoolCommands::ResetWeights
            }
        ));
    }
}
