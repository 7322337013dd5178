use ai_router::{config, logging::init_tracing, server};
use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use tracing::info;

/// Execute the serve command
///
/// Loads the configuration, installs logging as configured and runs the
/// server until a shutdown signal arrives.
pub async fn execute(config_path: &Path) -> Result<()> {
    println!("{}", "Starting AI Router...".green());

    let cfg = config::load_config(config_path)?;
    init_tracing(&cfg.server.log_level, &cfg.server.log_format);

    info!(config = %config_path.display(), "Configuration loaded");

    server::start_server(cfg).await
}
