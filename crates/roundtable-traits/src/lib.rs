//! Roundtable Traits - Shared contracts for the round-orchestration engine.
//!
//! This crate provides the boundary interfaces the engine depends on:
//! - `ModelClient` trait plus the message/tool-call data model
//! - `ToolInvoker` trait for tool back-ends
//! - `ThreadStore` trait for the batch-persistence boundary
//! - Tool catalog types (`ToolSpec`, `ToolSource`) and `ToolResult`
//! - Boundary error enums (`ProviderError`, `InvokeError`, `StoreError`)

pub mod error;
pub mod model;
pub mod store;
pub mod tool;

// ── Top-level re-exports ─────────────────────────────────────────────

pub use error::{InvokeError, ProviderError, StoreError};

pub use model::{
    FinishReason, Message, MessageChannel, ModelClient, ModelResponse, Role, ToolCall,
    validate_response,
};

pub use store::{BatchOperation, CommitReceipt, ThreadSnapshot, ThreadStore};

pub use tool::{ToolCatalog, ToolInvoker, ToolResult, ToolSource, ToolSpec};
