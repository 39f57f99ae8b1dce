//! Base provider trait and conversation message types
//!
//! This module defines the message model shared by the turn engine, the
//! session store and every provider, plus the `Provider` trait that the
//! agent loop drives.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt or injected context
    System,
    /// Human input
    User,
    /// Model output
    Assistant,
    /// Tool execution result
    Tool,
}

impl Role {
    /// Wire/storage spelling of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = crate::error::KestrelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(crate::error::KestrelError::Storage(format!(
                "unknown message role: {}",
                other
            ))),
        }
    }
}

/// Tool call requested by the model
///
/// Stored as part of an ordered JSON array in the `tool_calls` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call
    pub id: String,
    /// Name of the tool to invoke
    pub name: String,
    /// Arguments as a JSON value
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Creates a tool call
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Message structure for conversation
///
/// Messages are immutable once written to the session store. The row id
/// assigned by the store, not `created_at`, is the authoritative order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Visible content of the message
    #[serde(default)]
    pub content: String,
    /// Model reasoning that accompanied the content
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    /// Ordered tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool call this message answers (tool results only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Unix seconds
    pub created_at: i64,
    /// Prompt tokens billed for the call that produced this message
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens billed for the call that produced this message
    #[serde(default)]
    pub output_tokens: u64,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: chrono::Utc::now().timestamp(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Creates a new user message
    ///
    /// # Examples
    ///
    /// ```
    /// use kestrel::providers::{Message, Role};
    ///
    /// let msg = Message::user("Hello, assistant!");
    /// assert_eq!(msg.role, Role::User);
    /// ```
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a new tool result message
    ///
    /// # Examples
    ///
    /// ```
    /// use kestrel::providers::{Message, Role};
    ///
    /// let msg = Message::tool_result("call_123", "File contents...");
    /// assert_eq!(msg.role, Role::Tool);
    /// assert_eq!(msg.tool_call_id, Some("call_123".to_string()));
    /// ```
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Creates an assistant message with tool calls
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// Attaches reasoning text
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// Attaches the token usage of the call that produced this message
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.input_tokens = usage.input_tokens;
        self.output_tokens = usage.output_tokens;
        self
    }

    /// Returns true when this is an assistant message requesting tools
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// Token usage reported by one model call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Create a new TokenUsage instance
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// Which part of a streamed reply a delta belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    /// Hidden reasoning tokens
    Reasoning,
    /// Visible reply tokens
    Content,
}

/// Partial token output from a streaming model call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Reasoning or content
    pub kind: DeltaKind,
    /// Text fragment
    pub text: String,
}

impl StreamDelta {
    /// Content fragment
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            kind: DeltaKind::Content,
            text: text.into(),
        }
    }

    /// Reasoning fragment
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: DeltaKind::Reasoning,
            text: text.into(),
        }
    }
}

/// Completion response with message and optional token usage
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// The response message from the AI
    pub message: Message,
    /// Optional token usage information
    pub usage: Option<TokenUsage>,
}

impl CompletionResponse {
    /// Create a new CompletionResponse
    pub fn new(message: Message) -> Self {
        Self {
            message,
            usage: None,
        }
    }

    /// Create a new CompletionResponse with token usage
    pub fn with_usage(message: Message, usage: TokenUsage) -> Self {
        Self {
            message,
            usage: Some(usage),
        }
    }
}

/// One item of a streamed completion
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Partial reasoning or content
    Delta(StreamDelta),
    /// Final assembled response; always the last item
    Done(CompletionResponse),
}

/// Provider trait for AI providers
///
/// Implementations own the wire protocol. The engine only needs a complete
/// response per call; providers that can stream override [`Provider::stream`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Completes a conversation with the given messages and available tools
    ///
    /// # Errors
    ///
    /// Returns error if the API call fails or response is invalid
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
    ) -> Result<CompletionResponse>;

    /// Streams a completion as deltas followed by a final [`StreamChunk::Done`]
    ///
    /// The default implementation calls [`Provider::complete`] and replays the
    /// reasoning and content as one delta each.
    async fn stream(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let response = self.complete(messages, tools).await?;
        let mut chunks = Vec::new();
        if !response.message.reasoning.is_empty() {
            chunks.push(Ok(StreamChunk::Delta(StreamDelta::reasoning(
                response.message.reasoning.clone(),
            ))));
        }
        if !response.message.content.is_empty() {
            chunks.push(Ok(StreamChunk::Delta(StreamDelta::content(
                response.message.content.clone(),
            ))));
        }
        chunks.push(Ok(StreamChunk::Done(response)));
        Ok(stream::iter(chunks).boxed())
    }
}

/// Validates message sequence and removes orphan tool messages
///
/// An orphan is a tool message whose `tool_call_id` is missing or does not
/// match any earlier assistant tool call. Sending one makes most provider
/// APIs reject the request.
///
/// # Examples
///
/// ```
/// use kestrel::providers::{Message, validate_message_sequence};
///
/// let messages = vec![
///     Message::user("Do something"),
///     Message::tool_result("call_123", "Result"),
/// ];
/// let validated = validate_message_sequence(&messages);
/// assert_eq!(validated.len(), 1);
/// ```
pub fn validate_message_sequence(messages: &[Message]) -> Vec<Message> {
    let mut valid_tool_ids: HashSet<&str> = HashSet::new();

    messages
        .iter()
        .filter(|message| {
            if message.role == Role::Assistant {
                valid_tool_ids.extend(message.tool_calls.iter().map(|c| c.id.as_str()));
                return true;
            }
            if message.role != Role::Tool {
                return true;
            }
            match message.tool_call_id.as_deref() {
                Some(id) if valid_tool_ids.contains(id) => true,
                Some(id) => {
                    tracing::warn!("Dropping orphan tool message with tool_call_id: {}", id);
                    false
                }
                None => {
                    tracing::warn!("Dropping tool message without tool_call_id");
                    false
                }
            }
        })
        .cloned()
        .collect()
}

/// Tool calls that never received a tool result message
///
/// Returned in request order. A non-empty result means the history is not
/// well-formed for the next provider call.
pub fn unanswered_tool_calls(messages: &[Message]) -> Vec<ToolCall> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter())
        .filter(|call| !answered.contains(call.id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_user() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
        assert!(msg.tool_calls.is_empty());
        assert!(msg.tool_call_id.is_none());
        assert!(msg.created_at > 0);
    }

    #[test]
    fn test_message_tool_result() {
        let msg = Message::tool_result("call_123", "result");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_123"));
    }

    #[test]
    fn test_message_with_usage_and_reasoning() {
        let msg = Message::assistant("answer")
            .with_reasoning("thinking")
            .with_usage(TokenUsage::new(10, 3));
        assert_eq!(msg.reasoning, "thinking");
        assert_eq!(msg.input_tokens, 10);
        assert_eq!(msg.output_tokens, 3);
    }

    #[test]
    fn test_role_parse_and_display() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
            assert_eq!(role.to_string(), role.as_str());
        }
        assert!("moderator".parse::<Role>().is_err());
    }

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let json = serde_json::to_string(&Message::user("Test")).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("reasoning"));
    }

    #[test]
    fn test_tool_call_json_shape() {
        let call = ToolCall::new("call_1", "read_file", json!({"path": "a.rs"}));
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(
            value,
            json!({"id": "call_1", "name": "read_file", "arguments": {"path": "a.rs"}})
        );
    }

    #[test]
    fn test_validate_message_sequence_keeps_matched_results() {
        let call = ToolCall::new("call_1", "read_file", json!({}));
        let messages = vec![
            Message::user("go"),
            Message::assistant_with_tools("", vec![call]),
            Message::tool_result("call_1", "ok"),
            Message::tool_result("call_2", "orphan"),
        ];
        let validated = validate_message_sequence(&messages);
        assert_eq!(validated.len(), 3);
        assert_eq!(validated[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_validate_message_sequence_drops_result_before_call() {
        let messages = vec![
            Message::tool_result("call_1", "early"),
            Message::assistant_with_tools("", vec![ToolCall::new("call_1", "x", json!({}))]),
        ];
        assert_eq!(validate_message_sequence(&messages).len(), 1);
    }

    #[test]
    fn test_unanswered_tool_calls() {
        let messages = vec![
            Message::assistant_with_tools(
                "",
                vec![
                    ToolCall::new("a", "read_file", json!({})),
                    ToolCall::new("b", "grep", json!({})),
                ],
            ),
            Message::tool_result("a", "done"),
        ];
        let pending = unanswered_tool_calls(&messages);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
    }

    struct FixedProvider;

    #[async_trait]
    impl Provider for FixedProvider {
        async fn complete(
            &self,
            _messages: &[Message],
            _tools: &[serde_json::Value],
        ) -> Result<CompletionResponse> {
            Ok(CompletionResponse::with_usage(
                Message::assistant("hi").with_reasoning("hmm"),
                TokenUsage::new(5, 1),
            ))
        }
    }

    #[tokio::test]
    async fn test_default_stream_replays_completion() {
        let chunks: Vec<_> = FixedProvider
            .stream(&[Message::user("hello")], &[])
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        assert!(matches!(
            &chunks[0],
            Ok(StreamChunk::Delta(d)) if d.kind == DeltaKind::Reasoning && d.text == "hmm"
        ));
        assert!(matches!(
            &chunks[1],
            Ok(StreamChunk::Delta(d)) if d.kind == DeltaKind::Content && d.text == "hi"
        ));
        assert!(matches!(&chunks[2], Ok(StreamChunk::Done(r)) if r.usage.is_some()));
    }
}
