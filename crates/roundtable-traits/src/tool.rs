//! Tool catalog types, the invoker trait, and tool results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InvokeError;

/// Where a tool is resolved. Decided once when the catalog is built,
/// never re-inferred per call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSource {
    /// Tool served by the application's own back-end.
    Direct { endpoint: String },
    /// Tool served by an external server.
    External { server_label: String },
}

/// One entry of the tool catalog handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema object for the tool's parameters.
    pub parameters: Value,
    pub source: ToolSource,
}

/// Catalog of tools available to one round.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    specs: Vec<ToolSpec>,
}

impl ToolCatalog {
    pub fn new(specs: Vec<ToolSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Outcome of executing one tool call. Every requested call produces exactly
/// one result before the round advances, including calls skipped after a
/// critical failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the result was served from the result cache.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_hit: bool,
    pub timestamp: DateTime<Utc>,
}

impl ToolResult {
    /// Create a successful result.
    pub fn success(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content,
            success: true,
            error: None,
            cache_hit: false,
            timestamp: Utc::now(),
        }
    }

    /// Create a failed result.
    pub fn failure(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: Value::Null,
            success: false,
            error: Some(error.into()),
            cache_hit: false,
            timestamp: Utc::now(),
        }
    }

    /// Create a skipped result referencing the failure that triggered the skip.
    pub fn skipped(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        triggered_by: &str,
    ) -> Self {
        Self::failure(
            tool_call_id,
            name,
            format!("skipped: aborted after critical failure of '{triggered_by}'"),
        )
    }

    /// Mark this result as a cache hit.
    pub fn with_cache_hit(mut self) -> Self {
        self.cache_hit = true;
        self
    }
}

/// Tool back-end trait. One invoker serves all catalog tools; the engine
/// treats every back-end uniformly through tool metadata.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke a tool by name. `caller_token` is an opaque credential passed
    /// through from the caller, never interpreted by the engine.
    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        caller_token: Option<&str>,
    ) -> Result<Value, InvokeError>;
}
