//! Kestrel - turn orchestration and persistence engine for a terminal coding agent
//!
//! The library runs one conversation turn at a time as background work,
//! delivers its events to a single owner of conversation state, records the
//! conversation durably in SQLite and can undo a whole turn: files, history
//! and stored messages together.
//!
//! # Architecture
//!
//! - `agent`: turn engine, event queue, processors and the turn controller
//! - `storage`: database handle, session store, result cache, write-behind queue
//! - `delta`: per-turn file snapshots used by undo
//! - `providers`: message model and the provider seam
//! - `tools`: tool executor seam, registry and read tracking
//! - `config`, `cli`, `logging`, `error`: ambient plumbing
//!
//! # Example
//!
//! ```no_run
//! use kestrel::agent::{AgentLoop, TurnController};
//! use kestrel::config::Config;
//! use kestrel::storage::{SessionStore, WriteBehindQueue};
//! use kestrel::tools::ToolRegistry;
//! use std::sync::Arc;
//!
//! # async fn run(provider: Arc<dyn kestrel::providers::Provider>) -> anyhow::Result<()> {
//! let config = Config::default();
//! let store = SessionStore::open(&config.storage)?;
//! let session = store.create_session("demo")?;
//! let queue = Arc::new(WriteBehindQueue::spawn(
//!     Arc::new(store.clone()),
//!     config.storage.write_queue_capacity,
//! ));
//! let agent = AgentLoop::new(provider, ToolRegistry::new(), config.turn.max_steps);
//!
//! let mut controller =
//!     TurnController::new(session.id, store, queue, Arc::new(agent), config.turn.clone());
//! controller.submit("explain src/main.rs")?;
//! while let Some(update) = controller.next_update().await {
//!     println!("{:?}", update);
//! }
//! controller.shutdown(config.storage.drain_timeout()).await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cli;
pub mod commands;
pub mod config;
pub mod delta;
pub mod error;
pub mod logging;
pub mod providers;
pub mod storage;
pub mod tools;

// Re-export commonly used types
pub use agent::{TurnController, TurnProcessor};
pub use config::Config;
pub use error::{KestrelError, Result};
