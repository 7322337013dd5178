use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{AccountCommands, BalanceCommands, Commands, ConfigCommands, KeyCommands, PoolCommands, PricingCommands};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let config_path = args.config.clone();

    // Dispatch to appropriate command handler
    match args.get_command() {
        Commands::Serve => commands::serve::execute(&config_path).await?,
        Commands::Account { action } => {
            let ctx = commands::Context::open(&config_path).await?;
            match action {
                AccountCommands::Add {
                    name,
                    tier,
                    credential,
                    balance,
                    owner,
                    cost_basis,
                    client_multiplier,
                    commission_rate,
                    min_threshold,
                } => {
                    let mut new = ai_router::accounts::NewAccount::new(name, tier, credential, balance);
                    new.owner_user_id = owner;
                    new.cost_basis = cost_basis;
                    new.client_multiplier = client_multiplier;
                    new.commission_rate = commission_rate;
                    new.min_threshold = min_threshold;
                    commands::account::add(&ctx, new).await?
                }
                AccountCommands::List => commands::account::list(&ctx).await?,
                AccountCommands::TopUp { id, amount } => commands::account::top_up(&ctx, &id, amount).await?,
                AccountCommands::Pause { id } => commands::account::pause(&ctx, &id).await?,
                AccountCommands::Resume { id } => commands::account::resume(&ctx, &id).await?,
                AccountCommands::Revoke { id } => commands::account::revoke(&ctx, &id).await?,
            }
        }
        Commands::Key { action } => {
            let ctx = commands::Context::open(&config_path).await?;
            match action {
                KeyCommands::Issue {
                    user,
                    name,
                    model,
                    expires_in_days,
                } => commands::key::issue(&ctx, &user, &name, model.as_deref(), expires_in_days).await?,
                KeyCommands::Revoke { id } => commands::key::revoke(&ctx, &id).await?,
            }
        }
        Commands::Balance { action } => {
            let ctx = commands::Context::open(&config_path).await?;
            match action {
                BalanceCommands::Deposit { user, amount } => commands::balance::deposit(&ctx, &user, amount).await?,
                BalanceCommands::Show { user } => commands::balance::show(&ctx, &user).await?,
            }
        }
        Commands::Pool { action } => {
            let ctx = commands::Context::open(&config_path).await?;
            match action {
                PoolCommands::Stats => commands::pool::stats(&ctx).await?,
                PoolCommands::Alerts => commands::pool::alerts(&ctx).await?,
                PoolCommands::ResetWeights => commands::pool::reset_weights(&ctx).await?,
            }
        }
        Commands::Pricing { action } => {
            let ctx = commands::Context::open(&config_path).await?;
            match action {
                PricingCommands::Sync => commands::pricing::sync(&ctx).await?,
                PricingCommands::List => commands::pricing::list(&ctx).await?,
            }
        }
        Commands::Config { action } => match action {
            ConfigCommands::Show => commands::config::show(&config_path)?,
            ConfigCommands::Validate => commands::config::validate(&config_path)?,
        },
        Commands::Version => {
            println!("AI Router v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
