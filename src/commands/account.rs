use ai_router::accounts::{AccountKind, AccountStatus, FundingAccount, NewAccount};
use anyhow::Result;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use rust_decimal::Decimal;

use super::{usd, Context};

pub async fn add(ctx: &Context, new: NewAccount) -> Result<()> {
    let account = ctx.accounts().create(new).await?;

    println!(
        "{}",
        format!("✓ Funding account '{}' created in tier {}", account.name, account.tier()).green()
    );
    println!("  ID:      {}", account.id);
    println!("  Balance: {}", usd(account.balance));
    Ok(())
}

pub async fn list(ctx: &Context) -> Result<()> {
    let accounts = ctx.accounts().list().await?;
    if accounts.is_empty() {
        println!("{}", "No funding accounts registered".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "ID", "Name", "Tier", "Status", "Balance", "Cost basis", "Multiplier", "Spent", "Weight / Earned",
    ]);

    for account in &accounts {
        table.add_row(account_row(account));
    }

    println!("{table}");
    Ok(())
}

fn account_row(account: &FundingAccount) -> Vec<Cell> {
    let status_color = match account.status {
        AccountStatus::Active => Color::Green,
        AccountStatus::Paused => Color::Yellow,
        AccountStatus::Revoked => Color::Red,
    };
    let rotation = match &account.kind {
        AccountKind::Operator { usage_weight, .. } => usage_weight.to_string(),
        AccountKind::Investor { total_earned, .. } => usd(*total_earned),
    };

    vec![
        Cell::new(&account.id),
        Cell::new(&account.name),
        Cell::new(account.tier()),
        Cell::new(account.status.as_str()).fg(status_color),
        Cell::new(usd(account.balance)),
        Cell::new(account.cost_basis.normalize()),
        Cell::new(account.client_multiplier.normalize()),
        Cell::new(usd(account.total_spent)),
        Cell::new(rotation),
    ]
}

pub async fn top_up(ctx: &Context, id: &str, amount: Decimal) -> Result<()> {
    let account = ctx.accounts().top_up(id, amount).await?;
    println!(
        "{}",
        format!("✓ Added {} to '{}', balance now {}", usd(amount), account.name, usd(account.balance)).green()
    );
    Ok(())
}

pub async fn pause(ctx: &Context, id: &str) -> Result<()> {
    let account = ctx.accounts().set_status(id, AccountStatus::Paused).await?;
    println!("{}", format!("✓ '{}' paused", account.name).yellow());
    Ok(())
}

pub async fn resume(ctx: &Context, id: &str) -> Result<()> {
    let account = ctx.accounts().set_status(id, AccountStatus::Active).await?;
    println!("{}", format!("✓ '{}' back in rotation", account.name).green());
    Ok(())
}

pub async fn revoke(ctx: &Context, id: &str) -> Result<()> {
    let account = ctx.accounts().revoke(id).await?;
    println!("{}", format!("✓ '{}' revoked permanently", account.name).red());
    Ok(())
}
