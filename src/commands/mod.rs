//! Command handlers for the CLI
//!
//! - `history` - list, show and delete stored conversations
//! - `cache`   - prune or clear the fetch/search cache

pub mod cache;
pub mod history;

pub use cache::handle_cache;
pub use history::handle_history;
