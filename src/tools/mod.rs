//! Tools module for Kestrel
//!
//! Concrete tools (file read/edit, grep, web fetch) live outside the engine.
//! This module defines the dispatch seam they plug into, plus the shared
//! read-tracking state that undo resets.

pub mod read_tracker;

pub use read_tracker::ReadTracker;

use crate::error::Result;
use crate::providers::ToolCall;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tool result structure
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Whether the tool execution succeeded
    pub success: bool,
    /// Output from the tool
    pub output: String,
    /// Error message if execution failed
    pub error: Option<String>,
    /// Whether the output was truncated
    pub truncated: bool,
}

impl ToolResult {
    /// Create a successful tool result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            truncated: false,
        }
    }

    /// Create a failed tool result
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            truncated: false,
        }
    }

    /// Truncate output if it exceeds the maximum size
    ///
    /// Truncation happens on a char boundary at or below `max_size` bytes.
    pub fn truncate_if_needed(mut self, max_size: usize) -> Self {
        if self.output.len() > max_size {
            let mut cut = max_size;
            while !self.output.is_char_boundary(cut) {
                cut -= 1;
            }
            self.output.truncate(cut);
            self.output.push_str("\n... (truncated)");
            self.truncated = true;
        }
        self
    }

    /// Convert to a message string for the conversation
    pub fn to_message(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("Unknown error")
            )
        }
    }
}

/// Tool executor trait for implementing tool execution logic
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Returns the tool definition as a JSON value (function-calling schema)
    fn tool_definition(&self) -> serde_json::Value;

    /// Executes the tool with the given arguments
    ///
    /// # Errors
    ///
    /// Returns error if execution fails; the registry turns it into a
    /// failed [`ToolResult`] so the model sees the failure.
    async fn execute(&self, args: serde_json::Value) -> Result<ToolResult>;
}

/// Tool registry for managing available tools
///
/// Tools are kept in name order so the definitions sent to the provider are
/// stable between calls.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool executor in the registry
    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn ToolExecutor>) {
        self.tools.insert(name.into(), executor);
    }

    /// Get a tool executor by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).cloned()
    }

    /// Get all tool definitions as JSON values
    pub fn all_definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|executor| executor.tool_definition())
            .collect()
    }

    /// Dispatch a tool call
    ///
    /// Unknown tools and executor errors become failed results rather than
    /// errors, keeping every tool call answered.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        let Some(executor) = self.get(&call.name) else {
            tracing::warn!(tool = %call.name, "Model requested unknown tool");
            return ToolResult::error(format!("Unknown tool: {}", call.name));
        };

        match executor.execute(call.arguments.clone()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(tool = %call.name, error = %e, "Tool execution failed");
                ToolResult::error(e.to_string())
            }
        }
    }

    /// Get the number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
