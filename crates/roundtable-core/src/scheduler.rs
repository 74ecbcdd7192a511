//! Partitioning, deduplication and loop detection for tool-call batches.
//!
//! The scheduler is session-scoped: dedup keys and round signatures
//! accumulate across rounds so a call executed in round 1 is never
//! re-executed in round 3, and a model cycling through the same batch is
//! caught before it burns the round budget.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use roundtable_traits::ToolCall;

use crate::metadata::ToolMetadataRegistry;
use crate::normalize::canonical_key;

/// Information about a detected request loop.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    /// Sorted multiset of tool names that keeps recurring.
    pub signature: Vec<String>,
    pub occurrences: usize,
}

/// Result of scheduling one round's tool-call batch.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    /// Parallel-eligible calls, ascending by priority.
    pub parallel: Vec<ToolCall>,
    /// Must-be-sequential calls, ascending by priority.
    pub sequential: Vec<ToolCall>,
    /// Calls dropped because the same canonical key already executed
    /// earlier in this session.
    pub duplicates: Vec<ToolCall>,
    /// True when every new call was a duplicate: the orchestrator should
    /// force a final answer instead of re-issuing the same tools.
    pub no_new_work: bool,
    /// Set when the same round signature recurred past the threshold.
    pub loop_detected: Option<LoopInfo>,
}

impl ScheduleOutcome {
    /// Calls that will actually execute, in scheduling order.
    pub fn scheduled_len(&self) -> usize {
        self.parallel.len() + self.sequential.len()
    }
}

/// Session-scoped tool-call scheduler.
pub struct ToolCallScheduler {
    registry: Arc<ToolMetadataRegistry>,
    /// Canonical keys of every call scheduled earlier in the session.
    seen_keys: HashSet<String>,
    /// Occurrences of each order-independent round signature.
    signature_counts: HashMap<Vec<String>, usize>,
    /// Number of repeats (beyond the first occurrence) that signals a loop.
    loop_repeat_threshold: usize,
}

impl ToolCallScheduler {
    /// Default: 2 repeats, i.e. 3 total occurrences of the same signature.
    pub const DEFAULT_LOOP_REPEATS: usize = 2;

    pub fn new(registry: Arc<ToolMetadataRegistry>) -> Self {
        Self::with_loop_threshold(registry, Self::DEFAULT_LOOP_REPEATS)
    }

    pub fn with_loop_threshold(
        registry: Arc<ToolMetadataRegistry>,
        loop_repeat_threshold: usize,
    ) -> Self {
        Self {
            registry,
            seen_keys: HashSet::new(),
            signature_counts: HashMap::new(),
            loop_repeat_threshold,
        }
    }

    /// Record a call executed outside this scheduler (e.g. replayed from a
    /// reloaded thread) so it participates in dedup.
    pub fn record_prior(&mut self, call: &ToolCall) {
        self.seen_keys
            .insert(canonical_key(&call.name, &call.arguments));
    }

    /// Classify one round's batch into parallel/sequential subsets,
    /// dropping duplicates and checking for request loops.
    pub fn schedule(&mut self, new_calls: &[ToolCall]) -> ScheduleOutcome {
        let mut outcome = ScheduleOutcome::default();
        if new_calls.is_empty() {
            return outcome;
        }

        outcome.loop_detected = self.record_signature(new_calls);

        for call in new_calls {
            let key = canonical_key(&call.name, &call.arguments);
            if !self.seen_keys.insert(key) {
                tracing::debug!(
                    tool = %call.name,
                    call_id = %call.id,
                    "dropping duplicate tool call"
                );
                outcome.duplicates.push(call.clone());
                continue;
            }

            let metadata = self.registry.resolve(&call.name);
            if metadata.parallelizable {
                outcome.parallel.push(call.clone());
            } else {
                outcome.sequential.push(call.clone());
            }
        }

        let priority = |call: &ToolCall| self.registry.resolve(&call.name).priority;
        outcome.parallel.sort_by_key(priority);
        outcome.sequential.sort_by_key(priority);

        outcome.no_new_work = outcome.scheduled_len() == 0;
        if outcome.no_new_work {
            tracing::info!(
                duplicates = outcome.duplicates.len(),
                "all requested tool calls are duplicates, no new work"
            );
        }

        outcome
    }

    /// Track the order-independent signature of this round's batch.
    fn record_signature(&mut self, calls: &[ToolCall]) -> Option<LoopInfo> {
        let mut signature: Vec<String> = calls.iter().map(|call| call.name.clone()).collect();
        signature.sort();

        let count = self
            .signature_counts
            .entry(signature.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);

        if *count > self.loop_repeat_threshold {
            tracing::warn!(
                signature = ?signature,
                occurrences = *count,
                "repeated tool batch detected, signalling loop"
            );
            Some(LoopInfo {
                signature,
                occurrences: *count,
            })
        } else {
            None
        }
    }
}
