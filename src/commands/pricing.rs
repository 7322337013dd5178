use ai_router::server::build_pricing;
use anyhow::{Context as _, Result};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, ContentArrangement, Table};
use rust_decimal::Decimal;

use super::Context;

/// Fetch the catalog once and persist every price
pub async fn sync(ctx: &Context) -> Result<()> {
    println!("{}", format!("Fetching catalog from {}...", ctx.config.upstream.base_url).yellow());

    let client = reqwest::Client::builder().build().context("Failed to build HTTP client")?;
    let pricing = build_pricing(&ctx.config, ctx.pool.clone(), client);
    pricing.load_from_store().await?;
    let synced = pricing.refresh_all().await?;

    println!("{}", format!("✓ {} model prices stored", synced).green());
    Ok(())
}

pub async fn list(ctx: &Context) -> Result<()> {
    let client = reqwest::Client::new();
    let pricing = build_pricing(&ctx.config, ctx.pool.clone(), client);
    pricing.load_from_store().await?;

    let prices = pricing.list_active();
    if prices.is_empty() {
        println!("{}", "No stored prices, run `ai-router pricing sync`".yellow());
        return Ok(());
    }

    let per_million = Decimal::from(1_000_000);
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Model", "Prompt $/M", "Completion $/M", "Fetched"]);

    for price in &prices {
        table.add_row(vec![
            Cell::new(&price.model_id),
            Cell::new(format!("{:.4}", price.prompt_price_per_token * per_million)),
            Cell::new(format!("{:.4}", price.completion_price_per_token * per_million)),
            Cell::new(price.fetched_at.format("%Y-%m-%d %H:%M")),
        ]);
    }

    println!("{table}");
    Ok(())
}
