use crate::cli::CacheCommand;
use crate::config::Config;
use crate::error::Result;
use crate::storage::{CacheStore, Database};
use colored::Colorize;

/// Handle cache maintenance commands
///
/// Works regardless of `cache.enabled`: maintenance on a disabled cache is
/// still meaningful for rows written while it was enabled.
pub fn handle_cache(command: CacheCommand, config: &Config) -> Result<()> {
    let db = Database::open(&config.storage.db_path, &config.storage)?;
    let cache = CacheStore::new(db, &config.cache, config.storage.retry_policy());

    match command {
        CacheCommand::Prune => {
            let removed = cache.prune_expired();
            println!("{}", format!("Removed {} expired cache entries", removed).green());
        }
        CacheCommand::Clear => {
            let removed = cache.clear();
            println!("{}", format!("Removed {} cache entries", removed).green());
        }
    }

    Ok(())
}
