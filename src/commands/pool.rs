use ai_router::accounts::{selector::AlertLevel, selector::TierStatus};
use anyhow::Result;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};

use super::{usd, Context};

pub async fn stats(ctx: &Context) -> Result<()> {
    let stats = ctx.selector.pool_stats().await?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Tier", "Accounts", "Total", "Average", "Status"]);

    for tier in &stats.tiers {
        let color = match tier.status {
            TierStatus::Active => Color::Green,
            TierStatus::Low => Color::Yellow,
            TierStatus::Empty => Color::Red,
        };
        table.add_row(vec![
            Cell::new(tier.tier),
            Cell::new(tier.count),
            Cell::new(usd(tier.total_balance)),
            Cell::new(usd(tier.avg_balance)),
            Cell::new(format!("{:?}", tier.status).to_lowercase()).fg(color),
        ]);
    }

    println!("{table}");
    println!(
        "Active tier: {}   Total available: {}",
        stats
            .active_tier
            .map(|t| t.to_string().bold().to_string())
            .unwrap_or_else(|| "none".red().to_string()),
        usd(stats.total_available)
    );
    Ok(())
}

pub async fn alerts(ctx: &Context) -> Result<()> {
    let alerts = ctx.selector.low_balance_alerts().await?;
    if alerts.is_empty() {
        println!("{}", "✓ No pool alerts".green());
        return Ok(());
    }

    for alert in alerts {
        let label = match alert.level {
            AlertLevel::Warning => "WARNING".yellow(),
            AlertLevel::Critical => "CRITICAL".red(),
            AlertLevel::Emergency => "EMERGENCY".red().bold(),
        };
        println!("[{}] {} ({}): {}", label, alert.code, alert.accounts, alert.message);
    }
    Ok(())
}

pub async fn reset_weights(ctx: &Context) -> Result<()> {
    let reset = ctx.selector.reset_usage_weights().await?;
    println!("{}", format!("✓ Usage weights reset on {} accounts", reset).green());
    Ok(())
}
