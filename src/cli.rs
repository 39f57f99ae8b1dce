//! Command-line interface definition for Kestrel
//!
//! The binary is an administration front-end over the persisted state:
//! conversation history and the fetch/search cache.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Kestrel - turn orchestration and persistence engine for a coding agent
#[derive(Parser, Debug, Clone)]
#[command(name = "kestrel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Override the conversation database path
    #[arg(long, env = "KESTREL_DB")]
    pub db_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Kestrel
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Inspect or delete stored conversations
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },

    /// Maintain the web fetch/search cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

/// History subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// List stored sessions, most recently updated first
    List,

    /// Print every message of a session
    Show {
        /// Session ID (full UUID or 8-char prefix)
        id: String,
    },

    /// Delete a session and all of its messages
    Delete {
        /// Session ID (full UUID or 8-char prefix)
        id: String,
    },
}

/// Cache subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommand {
    /// Remove entries whose TTL has elapsed
    Prune,

    /// Remove every cached entry
    Clear,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_history_list() {
        let cli = Cli::try_parse_from(["kestrel", "history", "list"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::History {
                command: HistoryCommand::List
            }
        ));
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_parse_history_show_with_prefix() {
        let cli = Cli::try_parse_from(["kestrel", "history", "show", "abcdef12"]).expect("parse");
        match cli.command {
            Commands::History {
                command: HistoryCommand::Show { id },
            } => assert_eq!(id, "abcdef12"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_cache_prune_with_db_override() {
        let cli = Cli::try_parse_from(["kestrel", "--db-path", "/tmp/x.db", "cache", "prune"])
            .expect("parse");
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(
            cli.command,
            Commands::Cache {
                command: CacheCommand::Prune
            }
        ));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["kestrel"]).is_err());
    }
}
