//! In-memory `ThreadStore`: versioned, idempotency-aware reference
//! implementation used in tests and single-process deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use roundtable_traits::{
    BatchOperation, CommitReceipt, Message, Role, StoreError, ThreadSnapshot, ThreadStore,
};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct SessionRecord {
    messages: Vec<Message>,
    version: u64,
    applied: HashMap<String, AppliedRecord>,
}

#[derive(Debug, Clone)]
struct AppliedRecord {
    message_ids: Vec<String>,
    sequence: u64,
}

/// Thread store backed by a concurrent map. Unknown sessions read as empty
/// threads at version 0 and are created on first commit.
#[derive(Debug, Default)]
pub struct InMemoryThreadStore {
    sessions: DashMap<String, SessionRecord>,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message outside any batch operation, bumping the version.
    /// Simulates an external writer racing the engine.
    pub fn inject_external_message(&self, session_id: &str, message: Message) {
        let mut record = self.sessions.entry(session_id.to_string()).or_default();
        record.messages.push(message);
        record.version += 1;
    }

    /// Number of persisted messages for a session.
    pub fn message_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|record| record.messages.len())
            .unwrap_or(0)
    }
}

fn tool_message_ids(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|message| message.role == Role::Tool)
        .filter_map(|message| message.tool_call_id.clone())
        .collect()
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn commit_batch(
        &self,
        operation: &BatchOperation,
        expected_version: u64,
    ) -> Result<CommitReceipt, StoreError> {
        let mut record = self
            .sessions
            .entry(operation.session_id.clone())
            .or_default();

        // Idempotent replay: an already-applied operation is a safe no-op.
        if let Some(previous) = record.applied.get(&operation.operation_id) {
            return Ok(CommitReceipt {
                applied: false,
                applied_message_ids: previous.message_ids.clone(),
                sequence: previous.sequence,
            });
        }

        if record.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                current: record.version,
            });
        }

        record.messages.extend(operation.messages.iter().cloned());
        record.version += 1;
        let receipt = AppliedRecord {
            message_ids: tool_message_ids(&operation.messages),
            sequence: record.version,
        };
        record
            .applied
            .insert(operation.operation_id.clone(), receipt.clone());

        Ok(CommitReceipt {
            applied: true,
            applied_message_ids: receipt.message_ids,
            sequence: receipt.sequence,
        })
    }

    async fn reload(&self, session_id: &str) -> Result<ThreadSnapshot, StoreError> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|record| ThreadSnapshot {
                messages: record.messages.clone(),
                version: record.version,
            })
            .unwrap_or(ThreadSnapshot {
                messages: Vec::new(),
                version: 0,
            }))
    }

    async fn check_applied(
        &self,
        session_id: &str,
        operation_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .sessions
            .get(session_id)
            .is_some_and(|record| record.applied.contains_key(operation_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(op_id: &str, session: &str, messages: Vec<Message>) -> BatchOperation {
        BatchOperation {
            operation_id: op_id.to_string(),
            session_id: session.to_string(),
            round_id: "round-1".to_string(),
            messages,
        }
    }

    #[tokio::test]
    async fn commit_appends_and_bumps_version() {
        let store = InMemoryThreadStore::new();
        let receipt = store
            .commit_batch(
                &operation(
                    "op-1",
                    "s-1",
                    vec![
                        Message::assistant("working"),
                        Message::tool_result("c1", "get_note", "{}"),
                    ],
                ),
                0,
            )
            .await
            .expect("commit");

        assert!(receipt.applied);
        assert_eq!(receipt.sequence, 1);
        assert_eq!(receipt.applied_message_ids, vec!["c1".to_string()]);

        let snapshot = store.reload("s-1").await.expect("reload");
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn replayed_operation_is_a_no_op() {
        let store = InMemoryThreadStore::new();
        let op = operation(
            "op-1",
            "s-1",
            vec![Message::tool_result("c1", "get_note", "{}")],
        );
        store.commit_batch(&op, 0).await.expect("first commit");

        // Same operation id, even with a stale version, replays safely
        let replay = store.commit_batch(&op, 0).await.expect("replay");
        assert!(!replay.applied);
        assert_eq!(store.message_count("s-1"), 1);
        assert!(store.check_applied("s-1", "op-1").await.expect("check"));
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = InMemoryThreadStore::new();
        store.inject_external_message("s-1", Message::user("external"));

        let result = store
            .commit_batch(&operation("op-1", "s-1", vec![Message::assistant("x")]), 0)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Conflict {
                expected: 0,
                current: 1
            })
        ));
    }

    #[tokio::test]
    async fn unknown_session_reads_as_empty() {
        let store = InMemoryThreadStore::new();
        let snapshot = store.reload("missing").await.expect("reload");
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.version, 0);
        assert!(!store.check_applied("missing", "op-1").await.expect("check"));
    }
}
