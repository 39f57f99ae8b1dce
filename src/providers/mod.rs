//! Provider module for Kestrel
//!
//! The model-calling protocol lives outside this crate. This module only
//! defines the conversation message model and the `Provider` seam the agent
//! loop drives.

pub mod base;

pub use base::{
    unanswered_tool_calls, validate_message_sequence, CompletionResponse, DeltaKind, Message,
    Provider, Role, StreamChunk, StreamDelta, TokenUsage, ToolCall,
};
