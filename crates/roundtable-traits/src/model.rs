//! Model client trait and the conversation data model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;
use crate::tool::ToolSpec;

/// Chat message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Channel a message belongs to. Messages on the `Analysis` channel are
/// internal scratch content and are filtered out of the context window
/// before each model call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageChannel {
    Conversation,
    Analysis,
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool calls made by the assistant (for assistant messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<MessageChannel>,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: None,
            channel: None,
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: None,
            channel: None,
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: None,
            channel: None,
        }
    }

    /// Create an assistant message carrying tool calls. Content may be empty
    /// when the model issued only tool calls.
    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.unwrap_or_default(),
            tool_call_id: None,
            name: None,
            tool_calls: Some(tool_calls),
            channel: None,
        }
    }

    /// Create a tool result message tagged with its originating call.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            tool_calls: None,
            channel: None,
        }
    }

    /// Create an internal analysis-channel message. Never sent to the model.
    pub fn analysis(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: None,
            channel: Some(MessageChannel::Analysis),
        }
    }

    /// Whether this message belongs to the internal analysis channel.
    pub fn is_analysis(&self) -> bool {
        matches!(self.channel, Some(MessageChannel::Analysis))
    }
}

/// Tool call request from the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Reason the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    MaxTokens,
    Error,
}

/// Model completion response
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

/// Validate a model response at the client boundary. Loosely-shaped provider
/// output (empty call ids, empty names, non-object arguments) becomes a typed
/// `ProviderError::Validation` instead of flowing downstream.
pub fn validate_response(response: &ModelResponse) -> Result<(), ProviderError> {
    for call in &response.tool_calls {
        if call.id.trim().is_empty() {
            return Err(ProviderError::Validation(format!(
                "tool call '{}' has an empty id",
                call.name
            )));
        }
        if call.name.trim().is_empty() {
            return Err(ProviderError::Validation(format!(
                "tool call '{}' has an empty name",
                call.id
            )));
        }
        if !call.arguments.is_object() && !call.arguments.is_null() {
            return Err(ProviderError::Validation(format!(
                "tool call '{}' arguments are not an object",
                call.name
            )));
        }
    }
    Ok(())
}

/// Model client trait. The transport, token accounting, and prompt templating
/// behind it are out of scope for the engine.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider name for diagnostics.
    fn provider(&self) -> &str;

    /// Complete a chat request. `tools` is empty when tool use is disabled.
    async fn call(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<ModelResponse, ProviderError>;
}
