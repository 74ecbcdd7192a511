//! Canonical conversation-history assembly for model calls.
//!
//! Providers require tool messages to immediately follow the assistant
//! message that issued the calls they answer, so results are interleaved
//! there rather than appended at the end.

use roundtable_traits::{Message, ToolCall, ToolResult};

/// A tool message rejected during assembly. Valid messages from the same
/// batch are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryViolation {
    pub tool_call_id: String,
    pub reason: String,
}

/// Output of one assembly pass.
#[derive(Debug, Clone)]
pub struct HistoryBuild {
    pub messages: Vec<Message>,
    pub violations: Vec<HistoryViolation>,
}

/// Assembles the message sequence sent to the model.
#[derive(Debug, Clone)]
pub struct ConversationHistoryBuilder {
    /// Maximum prior conversation messages kept in the context window.
    window: usize,
}

impl ConversationHistoryBuilder {
    pub const DEFAULT_WINDOW: usize = 40;

    pub fn new(window: usize) -> Self {
        Self { window }
    }

    /// Build the outgoing message list.
    ///
    /// - `system_content` is omitted entirely when empty, never sent blank.
    /// - `prior` is bounded to the most recent window, with analysis-channel
    ///   messages dropped first.
    /// - `user_message` is present only when the round was triggered by fresh
    ///   user input.
    /// - When `tool_calls` is non-empty, the assistant message carrying them
    ///   is appended, immediately followed by one tool message per result.
    pub fn build(
        &self,
        system_content: Option<&str>,
        prior: &[Message],
        user_message: Option<&str>,
        assistant_content: Option<String>,
        tool_calls: &[ToolCall],
        results: &[ToolResult],
    ) -> HistoryBuild {
        let mut messages = Vec::new();
        let mut violations = Vec::new();

        if let Some(system) = system_content
            && !system.trim().is_empty()
        {
            messages.push(Message::system(system));
        }

        let visible: Vec<&Message> = prior.iter().filter(|m| !m.is_analysis()).collect();
        let start = visible.len().saturating_sub(self.window);
        if start > 0 {
            tracing::debug!(
                dropped = start,
                kept = self.window,
                "trimmed prior conversation to context window"
            );
        }
        messages.extend(visible[start..].iter().map(|m| (*m).clone()));

        if let Some(user) = user_message
            && !user.trim().is_empty()
        {
            messages.push(Message::user(user));
        }

        if !tool_calls.is_empty() {
            messages.push(Message::assistant_with_tool_calls(
                assistant_content,
                tool_calls.to_vec(),
            ));

            for result in results {
                match tool_message(result) {
                    Ok(message) => messages.push(message),
                    Err(violation) => violations.push(violation),
                }
            }
        }

        HistoryBuild {
            messages,
            violations,
        }
    }
}

impl Default for ConversationHistoryBuilder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

/// Render one tool result as a tool message, rejecting results that would
/// produce an unanswerable message.
fn tool_message(result: &ToolResult) -> Result<Message, HistoryViolation> {
    if result.tool_call_id.trim().is_empty() {
        return Err(HistoryViolation {
            tool_call_id: result.tool_call_id.clone(),
            reason: format!("tool result for '{}' is missing its call id", result.name),
        });
    }
    if result.name.trim().is_empty() {
        return Err(HistoryViolation {
            tool_call_id: result.tool_call_id.clone(),
            reason: "tool result is missing its tool name".to_string(),
        });
    }

    let content = if result.success {
        if result.content.is_null() {
            return Err(HistoryViolation {
                tool_call_id: result.tool_call_id.clone(),
                reason: format!("successful result for '{}' has no content", result.name),
            });
        }
        serde_json::to_string(&result.content).unwrap_or_default()
    } else {
        format!(
            "Error: {}",
            result.error.as_deref().unwrap_or("unknown error")
        )
    };

    Ok(Message::tool_result(
        &result.tool_call_id,
        &result.name,
        content,
    ))
}
