//! Orchestrator configuration.

use std::time::Duration;

use crate::breaker::CircuitBreaker;
use crate::executor::{DEFAULT_MAX_TOOL_CONCURRENCY, RetryPolicy};
use crate::history::ConversationHistoryBuilder;
use crate::scheduler::ToolCallScheduler;

/// Configuration for one orchestrator instance. Constructed per
/// request/session; never a shared global.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum model-tool-model rounds per user turn.
    pub max_rounds: usize,
    /// Cumulative tool-call budget across rounds.
    pub max_tool_calls: usize,
    /// Maximum prior conversation messages sent to the model.
    pub history_window: usize,
    /// Retry policy for tool invocations.
    pub retry: RetryPolicy,
    /// Signature repeats (beyond the first occurrence) that signal a loop.
    pub loop_repeats: usize,
    /// Corrective retries after a provider validation rejection.
    pub validation_retries: u32,
    /// Session advisory lock TTL; expired locks are reclaimed.
    pub lock_ttl: Duration,
    /// Wall-clock deadline for a whole round.
    pub round_deadline: Duration,
    /// Consecutive server-busy failures that open the circuit breaker.
    pub breaker_threshold: u32,
    /// Cooldown before the open breaker admits a trial call.
    pub breaker_cooldown: Duration,
    /// Result cache TTL.
    pub cache_ttl: Duration,
    /// Result cache capacity (FIFO eviction beyond this).
    pub cache_capacity: usize,
    /// Maximum concurrently executing tool calls.
    pub max_tool_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            max_tool_calls: 30,
            history_window: ConversationHistoryBuilder::DEFAULT_WINDOW,
            retry: RetryPolicy::default(),
            loop_repeats: ToolCallScheduler::DEFAULT_LOOP_REPEATS,
            validation_retries: 1,
            lock_ttl: Duration::from_secs(120),
            round_deadline: Duration::from_secs(300),
            breaker_threshold: CircuitBreaker::DEFAULT_FAILURE_THRESHOLD,
            breaker_cooldown: CircuitBreaker::DEFAULT_COOLDOWN,
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 256,
            max_tool_concurrency: DEFAULT_MAX_TOOL_CONCURRENCY,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_max_tool_calls(mut self, max_tool_calls: usize) -> Self {
        self.max_tool_calls = max_tool_calls;
        self
    }

    pub fn with_history_window(mut self, history_window: usize) -> Self {
        self.history_window = history_window;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_loop_repeats(mut self, loop_repeats: usize) -> Self {
        self.loop_repeats = loop_repeats;
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_round_deadline(mut self, round_deadline: Duration) -> Self {
        self.round_deadline = round_deadline;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_cooldown = cooldown;
        self
    }

    pub fn with_cache(mut self, ttl: Duration, capacity: usize) -> Self {
        self.cache_ttl = ttl;
        self.cache_capacity = capacity;
        self
    }

    pub fn with_max_tool_concurrency(mut self, max_tool_concurrency: usize) -> Self {
        self.max_tool_concurrency = max_tool_concurrency.max(1);
        self
    }
}
