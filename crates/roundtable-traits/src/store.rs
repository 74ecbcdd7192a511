//! Thread persistence boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::Message;

/// Unit sent to the persistence boundary: one round's assistant message plus
/// its tool results, committed atomically. Retried commits of the same
/// logical operation reuse the same `operation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOperation {
    /// Idempotency key, stable across retries of the same logical commit.
    pub operation_id: String,
    pub session_id: String,
    pub round_id: String,
    /// Assistant-with-tool-calls message followed by one tool message per result.
    pub messages: Vec<Message>,
}

/// Result of a commit attempt.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    /// False when the operation id had already been applied (no-op replay).
    pub applied: bool,
    /// Tool-call ids of the messages persisted by this attempt.
    pub applied_message_ids: Vec<String>,
    /// Store sequence after the commit.
    pub sequence: u64,
}

/// Current state of a session thread.
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub messages: Vec<Message>,
    pub version: u64,
}

/// Persistence boundary for session threads. Implementations must append
/// messages atomically, enforce the optimistic-concurrency precondition,
/// and remember applied operation ids for idempotent replay.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Append the operation's messages if `expected_version` matches the
    /// store's current version. A mismatch fails with `StoreError::Conflict`.
    async fn commit_batch(
        &self,
        operation: &BatchOperation,
        expected_version: u64,
    ) -> Result<CommitReceipt, StoreError>;

    /// Load the committed thread for a session.
    async fn reload(&self, session_id: &str) -> Result<ThreadSnapshot, StoreError>;

    /// Whether an operation id was already applied to this session.
    async fn check_applied(
        &self,
        session_id: &str,
        operation_id: &str,
    ) -> Result<bool, StoreError>;
}
