use ai_router::config::{self, Config};
use anyhow::Result;
use colored::Colorize;
use std::path::Path;

/// Execute the config show command
///
/// Displays the current configuration with secrets masked
pub fn show(config_path: &Path) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());

    let cfg = config::load_config(config_path)?;
    let sanitized = sanitize_secrets(&cfg);

    println!("{}", "Current Configuration:".green().bold());
    println!();
    println!("{}", serde_json::to_string_pretty(&sanitized)?);

    Ok(())
}

/// Execute the config validate command
pub fn validate(config_path: &Path) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());

    let cfg = config::load_config(config_path)?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Listen: {}:{}", cfg.server.host, cfg.server.port);
    println!("  Database: {}", cfg.database.path);
    println!("  Upstream: {}", cfg.upstream.base_url);
    println!("  Pricing TTL: {}s", cfg.pricing.ttl_seconds);
    println!(
        "  Admin API: {}",
        if cfg.security.admin_token.is_some() { "enabled" } else { "disabled" }
    );

    Ok(())
}

/// Sanitize secrets in configuration for safe display
fn sanitize_secrets(cfg: &Config) -> Config {
    let mut sanitized = cfg.clone();
    sanitized.security.encryption_key = mask_secret(&sanitized.security.encryption_key);
    sanitized.security.admin_token = sanitized.security.admin_token.as_deref().map(mask_secret);
    sanitized
}

/// Mask a secret for safe display
///
/// Shows first 4 and last 4 characters with asterisks in between
/// Example: "supersecretvalue" -> "supe...alue"
fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 11 {
        return "***".to_string();
    }

    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("supersecretvalue"), "supe...alue");
        assert_eq!(mask_secret("short"), "***");
    }
}
