//! Deterministic scripted model client for orchestration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use roundtable_traits::{
    FinishReason, Message, ModelClient, ModelResponse, ProviderError, Role, ToolCall, ToolSpec,
};
use tokio::time::{Duration, sleep};

/// Deterministic step for scripted mock completions.
#[derive(Debug, Clone)]
pub enum MockStepKind {
    /// Return a plain assistant message.
    Text(String),
    /// Return a tool-call response.
    ToolCalls(Vec<ToolCall>),
    /// Return a provider error.
    Error(ProviderError),
}

/// Scripted completion step with optional delay.
#[derive(Debug, Clone)]
pub struct MockStep {
    pub delay_ms: u64,
    pub kind: MockStepKind,
}

impl MockStep {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            delay_ms: 0,
            kind: MockStepKind::Text(content.into()),
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::tool_calls(vec![ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }])
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            delay_ms: 0,
            kind: MockStepKind::ToolCalls(calls),
        }
    }

    pub fn error(error: ProviderError) -> Self {
        Self {
            delay_ms: 0,
            kind: MockStepKind::Error(error),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// One captured model request: the outgoing messages and whether tools
/// were offered.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub messages: Vec<Message>,
    pub tool_count: usize,
}

/// A deterministic mock model client driven by scripted steps. Unscripted
/// calls echo the latest user message.
#[derive(Debug, Clone, Default)]
pub struct MockModelClient {
    script: Arc<Mutex<VecDeque<MockStep>>>,
    call_count: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<MockStep>) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::from(steps))),
            call_count: Arc::new(AtomicUsize::new(0)),
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push_step(&self, step: MockStep) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(step);
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn captured_requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .map(|captured| captured.clone())
            .unwrap_or_default()
    }

    fn next_step(&self) -> Option<MockStep> {
        self.script.lock().ok().and_then(|mut script| script.pop_front())
    }

    fn fallback_response(messages: &[Message]) -> ModelResponse {
        let text = messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| format!("mock-echo: {}", message.content))
            .unwrap_or_else(|| "mock-ok".to_string());

        ModelResponse {
            content: Some(text),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
        }
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn provider(&self) -> &str {
        "mock"
    }

    async fn call(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<ModelResponse, ProviderError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut captured) = self.captured.lock() {
            captured.push(CapturedRequest {
                messages: messages.clone(),
                tool_count: tools.len(),
            });
        }

        let Some(step) = self.next_step() else {
            return Ok(Self::fallback_response(&messages));
        };

        if step.delay_ms > 0 {
            sleep(Duration::from_millis(step.delay_ms)).await;
        }

        match step.kind {
            MockStepKind::Text(content) => Ok(ModelResponse {
                content: Some(content),
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
            }),
            MockStepKind::ToolCalls(tool_calls) => Ok(ModelResponse {
                content: None,
                tool_calls,
                finish_reason: FinishReason::ToolCalls,
            }),
            MockStepKind::Error(error) => Err(error),
        }
    }
}
