//! Kestrel - administration CLI over the conversation store and result cache

use anyhow::Result;

use kestrel::cli::{Cli, Commands};
use kestrel::commands;
use kestrel::config::Config;
use kestrel::logging::init_tracing;

fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    init_tracing(&config.logging)?;
    tracing::debug!(db_path = %config.storage.db_path.display(), "Configuration loaded");

    match cli.command {
        Commands::History { command } => {
            tracing::info!("Running history command");
            commands::handle_history(command, &config.storage)
        }
        Commands::Cache { command } => {
            tracing::info!("Running cache command");
            commands::handle_cache(command, &config)
        }
    }
}
