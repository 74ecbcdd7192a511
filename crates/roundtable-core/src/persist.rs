//! Batch persistence with idempotent replay under optimistic concurrency.
//!
//! The session advisory lock keeps two rounds from committing concurrently
//! in the common case; the conflict path here guards against lock-expiry
//! races and external writers.

use std::collections::HashSet;
use std::sync::Arc;

use roundtable_traits::{BatchOperation, Message, Role, StoreError, ThreadStore};

/// Result of a logical commit, after any conflict resolution.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// False when the operation had already been applied (no-op replay).
    pub applied: bool,
    pub applied_message_ids: Vec<String>,
    pub sequence: u64,
}

/// Commits a round's assistant+tool messages as one atomic, idempotent
/// operation, resolving version conflicts by refetch-and-replay-missing-only.
pub struct BatchPersistenceClient {
    store: Arc<dyn ThreadStore>,
    max_conflict_retries: usize,
}

impl BatchPersistenceClient {
    pub const DEFAULT_CONFLICT_RETRIES: usize = 3;

    pub fn new(store: Arc<dyn ThreadStore>) -> Self {
        Self {
            store,
            max_conflict_retries: Self::DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, max_conflict_retries: usize) -> Self {
        self.max_conflict_retries = max_conflict_retries;
        self
    }

    /// Commit the operation against the last-known session version.
    /// Re-submitting the same `operation_id` never duplicates messages.
    pub async fn commit(
        &self,
        operation: &BatchOperation,
        last_known_version: u64,
    ) -> Result<CommitOutcome, StoreError> {
        let mut current = operation.clone();
        let mut version = last_known_version;

        for attempt in 0..=self.max_conflict_retries {
            match self.store.commit_batch(&current, version).await {
                Ok(receipt) => {
                    return Ok(CommitOutcome {
                        applied: receipt.applied,
                        applied_message_ids: receipt.applied_message_ids,
                        sequence: receipt.sequence,
                    });
                }
                Err(StoreError::Conflict { current: store_at, .. }) => {
                    tracing::info!(
                        session = %operation.session_id,
                        operation = %operation.operation_id,
                        attempt,
                        store_version = store_at,
                        "commit conflict, refetching session state"
                    );

                    let snapshot = self.store.reload(&operation.session_id).await?;

                    // Safe no-op replay when this exact operation already landed.
                    if self
                        .store
                        .check_applied(&operation.session_id, &operation.operation_id)
                        .await?
                    {
                        return Ok(CommitOutcome {
                            applied: false,
                            applied_message_ids: Vec::new(),
                            sequence: snapshot.version,
                        });
                    }

                    let missing = missing_messages(&operation.messages, &snapshot.messages);
                    if missing.is_empty() {
                        // Everything is already present; nothing left to write.
                        return Ok(CommitOutcome {
                            applied: false,
                            applied_message_ids: Vec::new(),
                            sequence: snapshot.version,
                        });
                    }

                    current = BatchOperation {
                        messages: missing,
                        ..operation.clone()
                    };
                    version = snapshot.version;
                }
                Err(other) => return Err(other),
            }
        }

        Err(StoreError::Unavailable(format!(
            "commit of operation {} did not converge after {} conflict retries",
            operation.operation_id, self.max_conflict_retries
        )))
    }
}

/// Messages of the operation not yet present in the persisted thread,
/// compared by tool-call id.
fn missing_messages(requested: &[Message], persisted: &[Message]) -> Vec<Message> {
    let mut persisted_tool_ids: HashSet<&str> = HashSet::new();
    let mut persisted_call_ids: HashSet<&str> = HashSet::new();

    for message in persisted {
        if message.role == Role::Tool
            && let Some(id) = &message.tool_call_id
        {
            persisted_tool_ids.insert(id.as_str());
        }
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                persisted_call_ids.insert(call.id.as_str());
            }
        }
    }

    requested
        .iter()
        .filter(|message| {
            if message.role == Role::Tool {
                return message
                    .tool_call_id
                    .as_deref()
                    .is_none_or(|id| !persisted_tool_ids.contains(id));
            }
            if let Some(calls) = &message.tool_calls {
                return calls.iter().any(|call| !persisted_call_ids.contains(call.id.as_str()));
            }
            // Plain messages have no id to compare; resubmit them only when
            // nothing from this batch has landed at all.
            persisted_tool_ids.is_empty() && persisted_call_ids.is_empty()
        })
        .cloned()
        .collect()
}
