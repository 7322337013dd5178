use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use colored::Colorize;

use super::Context;

/// Issue a key and print it. The plaintext is never shown again.
pub async fn issue(
    ctx: &Context,
    user_id: &str,
    name: &str,
    allowed_model: Option<&str>,
    expires_in_days: Option<i64>,
) -> Result<()> {
    let expires_at = match expires_in_days {
        Some(days) if days <= 0 => bail!("--expires-in-days must be positive"),
        Some(days) => Some(Utc::now() + Duration::days(days)),
        None => None,
    };

    let issued = ctx.keys.issue(user_id, name, allowed_model, expires_at).await?;

    println!("{}", "✓ Access key issued".green());
    println!("  ID:      {}", issued.id);
    println!("  User:    {}", issued.user_id);
    println!("  Model:   {}", issued.allowed_model.as_deref().unwrap_or("any"));
    if let Some(expires_at) = issued.expires_at {
        println!("  Expires: {}", expires_at.format("%Y-%m-%d %H:%M UTC"));
    }
    println!();
    println!("  {}", issued.key.bold());
    println!("{}", "  Store this key now, it cannot be displayed again.".yellow());

    Ok(())
}

pub async fn revoke(ctx: &Context, key_id: &str) -> Result<()> {
    if ctx.keys.deactivate(key_id).await? {
        println!("{}", format!("✓ Access key {} deactivated", key_id).green());
    } else {
        bail!("no active access key with id '{}'", key_id);
    }
    Ok(())
}
