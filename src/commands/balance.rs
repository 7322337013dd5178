use anyhow::{Context as _, Result};
use colored::Colorize;
use rust_decimal::Decimal;

use super::{usd, Context};

pub async fn deposit(ctx: &Context, user_id: &str, amount: Decimal) -> Result<()> {
    let balance = ctx.ledger.deposit(user_id, amount).await?;

    println!(
        "{}",
        format!("✓ Deposited {} for {}", usd(amount), user_id).green()
    );
    println!("  Balance: {}", usd(balance.balance));
    Ok(())
}

pub async fn show(ctx: &Context, user_id: &str) -> Result<()> {
    let balance = ctx
        .ledger
        .balance(user_id)
        .await?
        .with_context(|| format!("no balance recorded for '{}'", user_id))?;

    println!("{}", format!("Balance of {}", balance.user_id).bold());
    println!("  Available:        {}", usd(balance.balance));
    println!("  Lifetime spent:   {}", usd(balance.lifetime_spent));
    println!("  Lifetime savings: {}", usd(balance.lifetime_savings));
    println!("  Lifetime funded:  {}", usd(balance.lifetime_earned));
    if let Some(at) = balance.last_deposit_at {
        println!("  Last deposit:     {}", at.format("%Y-%m-%d %H:%M UTC"));
    }
    Ok(())
}
