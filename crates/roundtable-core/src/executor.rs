//! Tool execution with timeout, caching, retry, fallback substitution and
//! critical-failure short-circuiting.
//!
//! The parallel subset fans out to independent tasks and fans back in via an
//! ordered join; the sequential subset runs strictly in order, each call
//! completing (or being skipped) before the next starts. Results are always
//! reassembled into the order of the original tool-call list, so the
//! caller-visible order is deterministic regardless of completion order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesOrdered;
use roundtable_traits::{ToolCall, ToolInvoker, ToolResult};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::cache::ResultCache;
use crate::metadata::ToolMetadataRegistry;
use crate::normalize::canonical_key;

/// Default maximum number of tool calls that can execute concurrently.
pub const DEFAULT_MAX_TOOL_CONCURRENCY: usize = 16;

/// Backoff shape between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// `min(initial * 2^attempt, max)`
    Exponential,
    /// `initial * (attempt + 1)`, capped at max
    Linear,
}

/// Per-deployment retry policy for tool invocations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffKind,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff: BackoffKind::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffKind::Exponential => self
                .initial_delay_ms
                .saturating_mul(1u64 << attempt.min(32)),
            BackoffKind::Linear => self.initial_delay_ms.saturating_mul(attempt as u64 + 1),
        };
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Aborts the wrapped tasks when dropped.
struct AbortOnDrop(Vec<tokio::task::AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Executes tool calls against the injected invoker. Idempotent at the cache
/// layer, never assumed idempotent at the tool layer.
#[derive(Clone)]
pub struct ToolExecutionService {
    invoker: Arc<dyn ToolInvoker>,
    registry: Arc<ToolMetadataRegistry>,
    cache: Arc<ResultCache>,
    retry: RetryPolicy,
    max_concurrency: usize,
}

impl ToolExecutionService {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        registry: Arc<ToolMetadataRegistry>,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            invoker,
            registry,
            cache,
            retry: RetryPolicy::default(),
            max_concurrency: DEFAULT_MAX_TOOL_CONCURRENCY,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Execute one round's scheduled calls: the parallel subset concurrently,
    /// the sequential subset in order with critical-failure short-circuit.
    /// Returns one result per call in `original_order`.
    pub async fn execute_round(
        &self,
        parallel: &[ToolCall],
        sequential: &[ToolCall],
        original_order: &[ToolCall],
        caller_token: Option<&str>,
    ) -> Vec<ToolResult> {
        let mut by_id: HashMap<String, ToolResult> = HashMap::new();

        for result in self.execute_parallel(parallel, caller_token).await {
            by_id.insert(result.tool_call_id.clone(), result);
        }
        for result in self.execute_sequential(sequential, caller_token).await {
            by_id.insert(result.tool_call_id.clone(), result);
        }

        // Reassemble into the original request order. Calls the scheduler
        // dropped as duplicates answer with a pointer to the earlier result.
        original_order
            .iter()
            .map(|call| {
                by_id.remove(&call.id).unwrap_or_else(|| {
                    ToolResult::success(
                        &call.id,
                        &call.name,
                        serde_json::Value::String(
                            "duplicate of an earlier call in this session; see its previous result"
                                .to_string(),
                        ),
                    )
                })
            })
            .collect()
    }

    /// Execute a single tool call through cache, timeout, retry and fallback.
    pub async fn execute(&self, call: &ToolCall, caller_token: Option<&str>) -> ToolResult {
        let metadata = self.registry.resolve(&call.name);
        let key = canonical_key(&call.name, &call.arguments);

        if metadata.cacheable
            && let Some(hit) = self.cache.get(&key)
        {
            tracing::debug!(tool = %call.name, call_id = %call.id, "tool result served from cache");
            return ToolResult {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                ..hit
            };
        }

        let timeout = Duration::from_millis(metadata.timeout_ms);
        let mut outcome = self
            .invoke_with_retries(&call.name, &call.arguments, timeout, caller_token)
            .await;

        // One fallback substitution per tool, restarted from attempt 0.
        if let Err(last_error) = &outcome
            && let Some(fallback) = self.registry.fallback_for(&call.name)
        {
            tracing::warn!(
                tool = %call.name,
                fallback = %fallback,
                error = %last_error,
                "retries exhausted, substituting fallback tool"
            );
            let fallback_timeout =
                Duration::from_millis(self.registry.resolve(&fallback).timeout_ms);
            outcome = self
                .invoke_with_retries(&fallback, &call.arguments, fallback_timeout, caller_token)
                .await;
        }

        match outcome {
            Ok(content) => {
                let result = ToolResult::success(&call.id, &call.name, content);
                if metadata.cacheable {
                    self.cache.put(key, result.clone());
                }
                result
            }
            Err(error) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %error, "tool call failed");
                ToolResult::failure(&call.id, &call.name, error)
            }
        }
    }

    async fn execute_parallel(
        &self,
        calls: &[ToolCall],
        caller_token: Option<&str>,
    ) -> Vec<ToolResult> {
        if calls.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut ordered = FuturesOrdered::new();
        let mut abort_handles = Vec::with_capacity(calls.len());

        for call in calls {
            let service = self.clone();
            let sem = Arc::clone(&semaphore);
            let token = caller_token.map(str::to_string);
            let call_id = call.id.clone();
            let call_name = call.name.clone();
            let call = call.clone();

            let handle: JoinHandle<ToolResult> = tokio::spawn(async move {
                let _permit = sem.acquire().await;
                service.execute(&call, token.as_deref()).await
            });
            abort_handles.push(handle.abort_handle());

            ordered.push_back(async move {
                match handle.await {
                    Ok(result) => result,
                    Err(join_error) => ToolResult::failure(
                        call_id,
                        call_name,
                        format!("tool task panicked: {join_error}"),
                    ),
                }
            });
        }

        // If the round is cancelled (deadline) while tools are in flight,
        // the guard aborts the spawned tasks instead of leaking them.
        let _abort_guard = AbortOnDrop(abort_handles);

        // A failure in one parallel call does not cancel the others; the
        // join waits for all of them to settle.
        ordered.collect().await
    }

    async fn execute_sequential(
        &self,
        calls: &[ToolCall],
        caller_token: Option<&str>,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        let mut aborted_by: Option<String> = None;

        for call in calls {
            if let Some(trigger) = &aborted_by {
                results.push(ToolResult::skipped(&call.id, &call.name, trigger));
                continue;
            }

            let result = self.execute(call, caller_token).await;
            let critical = self.registry.resolve(&call.name).category.is_critical();
            if !result.success && critical {
                tracing::warn!(
                    tool = %call.name,
                    call_id = %call.id,
                    "critical tool failed, aborting remaining sequential calls"
                );
                aborted_by = Some(call.name.clone());
            }
            results.push(result);
        }

        results
    }

    async fn invoke_with_retries(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        timeout: Duration,
        caller_token: Option<&str>,
    ) -> Result<serde_json::Value, String> {
        let mut last_error = String::new();

        for attempt in 0..=self.retry.max_retries {
            let invocation = self.invoker.invoke(name, arguments.clone(), caller_token);
            match tokio::time::timeout(timeout, invocation).await {
                Ok(Ok(content)) => return Ok(content),
                Ok(Err(error)) => last_error = error.to_string(),
                Err(_) => last_error = format!("tool '{name}' timed out after {timeout:?}"),
            }

            if attempt < self.retry.max_retries {
                sleep(self.retry.delay_for(attempt)).await;
            }
        }

        Err(last_error)
    }
}
