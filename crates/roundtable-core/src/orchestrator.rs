//! Round orchestration driver.
//!
//! Drives the model-tools-model cycle for one user turn: call the model,
//! schedule and execute the requested tools, persist the batch, reload the
//! committed thread, and call the model again until it answers in text or a
//! budget forces a final answer. One orchestrator instance serves one
//! request; shared state (lock table, breaker, cache) is injected.

use std::sync::Arc;

use roundtable_traits::{
    BatchOperation, Message, ModelClient, ModelResponse, ProviderError, ThreadStore, ToolCall,
    ToolCatalog, ToolInvoker, ToolResult, ToolSpec, validate_response,
};

use crate::breaker::CircuitBreaker;
use crate::cache::ResultCache;
use crate::config::OrchestratorConfig;
use crate::error::{EngineError, Result};
use crate::executor::ToolExecutionService;
use crate::history::ConversationHistoryBuilder;
use crate::lock::SessionLockTable;
use crate::metadata::ToolMetadataRegistry;
use crate::persist::BatchPersistenceClient;
use crate::round::{RoundState, RoundStateMachine};
use crate::scheduler::ToolCallScheduler;

/// Why the turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundFinishReason {
    /// The model answered in plain text.
    Answered,
    /// The same tool batch kept recurring; a final answer was forced.
    LoopDetected,
    /// Every requested call was a duplicate of earlier work.
    NoNewWork,
    /// Round or tool-call budget ran out.
    BudgetExhausted,
    /// Provider trouble (rate limit, overload); partial results returned.
    Degraded,
    /// Unrecoverable failure.
    Error,
}

/// What the caller gets back for one user turn, including every tool call
/// requested and every result produced across all rounds.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub rounds: usize,
    pub finish_reason: RoundFinishReason,
}

/// Result of driving one round to its terminal state.
enum RoundStep {
    Final {
        reason: RoundFinishReason,
        content: Option<String>,
    },
    /// The follow-up model call requested more tools; they seed the next round.
    Continue(ModelResponse),
}

pub struct Orchestrator {
    model: Arc<dyn ModelClient>,
    executor: ToolExecutionService,
    store: Arc<dyn ThreadStore>,
    persistence: BatchPersistenceClient,
    registry: Arc<ToolMetadataRegistry>,
    history: ConversationHistoryBuilder,
    locks: Arc<SessionLockTable>,
    breaker: Arc<CircuitBreaker>,
    caller_token: Option<String>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        invoker: Arc<dyn ToolInvoker>,
        store: Arc<dyn ThreadStore>,
        registry: Arc<ToolMetadataRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let cache = Arc::new(ResultCache::new(config.cache_ttl, config.cache_capacity));
        let executor = ToolExecutionService::new(invoker, Arc::clone(&registry), cache)
            .with_retry_policy(config.retry.clone())
            .with_max_concurrency(config.max_tool_concurrency);

        Self {
            model,
            executor,
            store: Arc::clone(&store),
            persistence: BatchPersistenceClient::new(store),
            registry,
            history: ConversationHistoryBuilder::new(config.history_window),
            locks: Arc::new(SessionLockTable::new(config.lock_ttl)),
            breaker: Arc::new(CircuitBreaker::new(
                config.breaker_threshold,
                config.breaker_cooldown,
            )),
            caller_token: None,
            config,
        }
    }

    /// Share a lock table across orchestrator instances serving the same
    /// process, so concurrent requests for one session contend properly.
    pub fn with_lock_table(mut self, locks: Arc<SessionLockTable>) -> Self {
        self.locks = locks;
        self
    }

    /// Share a provider circuit breaker across instances.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Opaque credential forwarded to the tool invoker on every call.
    pub fn with_caller_token(mut self, caller_token: impl Into<String>) -> Self {
        self.caller_token = Some(caller_token.into());
        self
    }

    /// Run one user turn to completion.
    ///
    /// The only error surfaced to the caller is a live session lock held by
    /// another round; everything else is folded into the outcome so partial
    /// tool results are never lost.
    pub async fn run_round(
        &self,
        session_id: &str,
        user_message: &str,
        system_content: Option<&str>,
        catalog: &ToolCatalog,
    ) -> Result<RoundOutcome> {
        let mut scheduler =
            ToolCallScheduler::with_loop_threshold(Arc::clone(&self.registry), self.config.loop_repeats);
        let mut all_calls: Vec<ToolCall> = Vec::new();
        let mut all_results: Vec<ToolResult> = Vec::new();
        let mut user_pending = Some(user_message);
        let mut carried: Option<ModelResponse> = None;
        let mut rounds = 0;

        loop {
            rounds += 1;
            let mut machine = RoundStateMachine::new(session_id);
            let round_id = machine.round_id().to_string();

            if !self.locks.try_acquire(session_id, &round_id) {
                return Err(EngineError::SessionLocked(session_id.to_string()));
            }

            let step = tokio::time::timeout(
                self.config.round_deadline,
                self.run_one_round(
                    &mut machine,
                    &mut scheduler,
                    session_id,
                    system_content,
                    user_pending.take(),
                    carried.take(),
                    catalog,
                    rounds,
                    &mut all_calls,
                    &mut all_results,
                ),
            )
            .await;
            self.locks.release(session_id, &round_id);

            let step = match step {
                Ok(step) => step,
                Err(_elapsed) => {
                    let _ = machine.transition_to(RoundState::Error);
                    tracing::error!(session = %session_id, round = %round_id, "round deadline exceeded");
                    return Ok(self.finish(
                        RoundFinishReason::Error,
                        Some("The request could not be completed before its deadline.".to_string()),
                        all_calls,
                        all_results,
                        rounds,
                    ));
                }
            };

            match step {
                Ok(RoundStep::Final { reason, content }) => {
                    return Ok(self.finish(reason, content, all_calls, all_results, rounds));
                }
                Ok(RoundStep::Continue(response)) => {
                    carried = Some(response);
                }
                Err(err) => {
                    let (reason, content) = outcome_for_error(&err);
                    tracing::error!(session = %session_id, round = %round_id, error = %err, "round failed");
                    return Ok(self.finish(reason, Some(content), all_calls, all_results, rounds));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_round(
        &self,
        machine: &mut RoundStateMachine,
        scheduler: &mut ToolCallScheduler,
        session_id: &str,
        system_content: Option<&str>,
        user_message: Option<&str>,
        carried: Option<ModelResponse>,
        catalog: &ToolCatalog,
        round_index: usize,
        all_calls: &mut Vec<ToolCall>,
        all_results: &mut Vec<ToolResult>,
    ) -> Result<RoundStep> {
        machine.transition_to(RoundState::CallModel1)?;
        let snapshot = self.store.reload(session_id).await?;

        // Seed dedup with the calls already persisted for this session, so a
        // tool executed in an earlier turn is never re-executed.
        for message in &snapshot.messages {
            if let Some(calls) = &message.tool_calls {
                for prior in calls {
                    scheduler.record_prior(prior);
                }
            }
        }

        // A follow-up response carried over from the previous round's second
        // model call stands in for this round's first call.
        let response = match carried {
            Some(response) => response,
            None => {
                let build = self.history.build(
                    system_content,
                    &snapshot.messages,
                    user_message,
                    None,
                    &[],
                    &[],
                );
                match self.call_model(build.messages, catalog.specs().to_vec()).await {
                    Ok(response) => response,
                    Err(err) => {
                        let _ = machine.transition_to(RoundState::Error);
                        return Ok(RoundStep::Final {
                            reason: reason_for_provider(&err),
                            content: Some(degraded_message(&err)),
                        });
                    }
                }
            }
        };

        if response.tool_calls.is_empty() {
            machine.transition_to(RoundState::Done)?;
            return Ok(RoundStep::Final {
                reason: RoundFinishReason::Answered,
                content: response.content,
            });
        }

        let schedule = scheduler.schedule(&response.tool_calls);

        if let Some(loop_info) = &schedule.loop_detected {
            tracing::warn!(
                session = %session_id,
                signature = ?loop_info.signature,
                occurrences = loop_info.occurrences,
                "request loop detected, forcing final answer"
            );
            let content = self
                .forced_final(
                    &snapshot.messages,
                    system_content,
                    "You have requested the same set of tools repeatedly. Tool use is now \
                     disabled. Give your best final answer from the results gathered so far.",
                )
                .await;
            machine.transition_to(RoundState::Done)?;
            return Ok(RoundStep::Final {
                reason: RoundFinishReason::LoopDetected,
                content,
            });
        }

        if schedule.no_new_work {
            let content = self
                .forced_final(
                    &snapshot.messages,
                    system_content,
                    "Every tool call you requested has already been executed in this \
                     conversation. Tool use is now disabled. Answer using the earlier results.",
                )
                .await;
            machine.transition_to(RoundState::Done)?;
            return Ok(RoundStep::Final {
                reason: RoundFinishReason::NoNewWork,
                content,
            });
        }

        let budget_left = self.config.max_tool_calls.saturating_sub(all_calls.len());
        if round_index > self.config.max_rounds || schedule.scheduled_len() > budget_left {
            tracing::warn!(
                session = %session_id,
                round_index,
                budget_left,
                requested = schedule.scheduled_len(),
                "round or tool budget exhausted, forcing final answer"
            );
            let content = self
                .forced_final(
                    &snapshot.messages,
                    system_content,
                    "The tool budget for this turn is exhausted. Tool use is now disabled. \
                     Give your best final answer from the results gathered so far.",
                )
                .await;
            machine.transition_to(RoundState::Done)?;
            return Ok(RoundStep::Final {
                reason: RoundFinishReason::BudgetExhausted,
                content,
            });
        }

        machine.transition_to(RoundState::ExecuteTools)?;
        let results = self
            .executor
            .execute_round(
                &schedule.parallel,
                &schedule.sequential,
                &response.tool_calls,
                self.caller_token.as_deref(),
            )
            .await;
        all_calls.extend(response.tool_calls.iter().cloned());
        all_results.extend(results.iter().cloned());

        machine.transition_to(RoundState::PersistToolsBatch)?;
        let batch = self
            .history
            .build(None, &[], None, response.content.clone(), &response.tool_calls, &results);
        for violation in &batch.violations {
            tracing::warn!(
                session = %session_id,
                call_id = %violation.tool_call_id,
                reason = %violation.reason,
                "dropping malformed tool message from batch"
            );
        }
        let operation = BatchOperation {
            // Stable per round, so commit retries replay instead of duplicating.
            operation_id: format!("op-{}", machine.round_id()),
            session_id: session_id.to_string(),
            round_id: machine.round_id().to_string(),
            messages: batch.messages,
        };
        let commit = self.persistence.commit(&operation, snapshot.version).await?;
        tracing::info!(
            session = %session_id,
            operation = %operation.operation_id,
            applied = commit.applied,
            sequence = commit.sequence,
            "round batch committed"
        );

        machine.transition_to(RoundState::ReloadThread)?;
        let reloaded = self.store.reload(session_id).await?;

        machine.transition_to(RoundState::CallModel2)?;
        let build = self
            .history
            .build(system_content, &reloaded.messages, None, None, &[], &[]);
        let followup = match self.call_model(build.messages, catalog.specs().to_vec()).await {
            Ok(response) => response,
            Err(err) => {
                let _ = machine.transition_to(RoundState::Error);
                return Ok(RoundStep::Final {
                    reason: reason_for_provider(&err),
                    content: Some(degraded_message(&err)),
                });
            }
        };

        machine.transition_to(RoundState::Done)?;
        if followup.tool_calls.is_empty() {
            Ok(RoundStep::Final {
                reason: RoundFinishReason::Answered,
                content: followup.content,
            })
        } else {
            Ok(RoundStep::Continue(followup))
        }
    }

    /// One model call through the circuit breaker, with boundary validation
    /// and a corrective retry when the provider rejects the payload shape.
    async fn call_model(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> std::result::Result<ModelResponse, ProviderError> {
        if !self.breaker.allow_call() {
            return Err(ProviderError::ServerBusy(
                "model provider circuit breaker is open".to_string(),
            ));
        }

        let mut messages = messages;
        let mut corrections_left = self.config.validation_retries;

        loop {
            let result = self
                .model
                .call(messages.clone(), tools.clone())
                .await
                .and_then(|response| {
                    validate_response(&response)?;
                    Ok(response)
                });

            match result {
                Ok(response) => {
                    self.breaker.record_success();
                    return Ok(response);
                }
                Err(ProviderError::Validation(detail)) if corrections_left > 0 => {
                    corrections_left -= 1;
                    tracing::warn!(
                        provider = %self.model.provider(),
                        detail = %detail,
                        "model response rejected, retrying with corrective note"
                    );
                    messages.push(Message::system(format!(
                        "Your previous response was rejected: {detail}. Re-issue it with \
                         well-formed tool calls (non-empty id and name, object arguments)."
                    )));
                }
                Err(err @ ProviderError::ServerBusy(_)) => {
                    self.breaker.record_failure();
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Ask the model for a final answer with tool use disabled. Provider
    /// failure here degrades to an apology rather than failing the turn.
    async fn forced_final(
        &self,
        prior: &[Message],
        system_content: Option<&str>,
        note: &str,
    ) -> Option<String> {
        let mut build = self.history.build(system_content, prior, None, None, &[], &[]);
        build.messages.push(Message::system(note));

        match self.call_model(build.messages, Vec::new()).await {
            Ok(response) => response.content,
            Err(err) => Some(degraded_message(&err)),
        }
    }

    fn finish(
        &self,
        finish_reason: RoundFinishReason,
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
        tool_results: Vec<ToolResult>,
        rounds: usize,
    ) -> RoundOutcome {
        RoundOutcome {
            content,
            tool_calls,
            tool_results,
            rounds,
            finish_reason,
        }
    }
}

fn reason_for_provider(err: &ProviderError) -> RoundFinishReason {
    match err {
        ProviderError::Fatal(_) => RoundFinishReason::Error,
        _ => RoundFinishReason::Degraded,
    }
}

/// User-facing text for a round that ended on a provider error.
fn degraded_message(err: &ProviderError) -> String {
    match err {
        ProviderError::Fatal(detail) => {
            format!("The model provider rejected the request: {detail}")
        }
        ProviderError::RateLimited {
            retry_after_secs: Some(secs),
            ..
        } => format!(
            "The model provider is rate limiting requests. Please try again in {secs} seconds."
        ),
        ProviderError::RateLimited { .. } => {
            "The model provider is rate limiting requests. Please try again shortly.".to_string()
        }
        ProviderError::ServerBusy(_) => {
            "The model provider is overloaded. Please try again shortly.".to_string()
        }
        ProviderError::Validation(detail) => format!(
            "The model could not produce a well-formed response: {detail}"
        ),
    }
}

/// Fold an internal failure into a caller-visible outcome.
fn outcome_for_error(err: &EngineError) -> (RoundFinishReason, String) {
    match err {
        EngineError::Store(store_err) => (
            RoundFinishReason::Degraded,
            format!("Conversation storage is unavailable: {store_err}"),
        ),
        EngineError::Provider(provider_err) => (
            reason_for_provider(provider_err),
            degraded_message(provider_err),
        ),
        other => (
            RoundFinishReason::Error,
            format!("The request failed: {other}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BackoffKind, RetryPolicy};
    use crate::metadata::ToolCategory;
    use crate::mock::{MockModelClient, MockStep};
    use crate::store_mem::InMemoryThreadStore;
    use async_trait::async_trait;
    use roundtable_traits::{InvokeError, Role, ToolSource};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct RecordingInvoker {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingInvoker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
        }
    }

    #[async_trait]
    impl ToolInvoker for RecordingInvoker {
        async fn invoke(
            &self,
            name: &str,
            arguments: Value,
            _caller_token: Option<&str>,
        ) -> std::result::Result<Value, InvokeError> {
            self.calls.lock().unwrap().push(name.to_string());
            Ok(json!({"echo": arguments}))
        }
    }

    fn registry() -> Arc<ToolMetadataRegistry> {
        let mut registry = ToolMetadataRegistry::new();
        registry.register_category("get_note", ToolCategory::Read);
        registry.register_category("search_notes", ToolCategory::Search);
        registry.register_category("create_folder", ToolCategory::Write);
        registry.register_category("create_note", ToolCategory::Write);
        Arc::new(registry)
    }

    fn catalog() -> ToolCatalog {
        let spec = |name: &str| ToolSpec {
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters: json!({"type": "object", "properties": {}}),
            source: ToolSource::Direct {
                endpoint: format!("/api/{name}"),
            },
        };
        ToolCatalog::new(vec![
            spec("get_note"),
            spec("search_notes"),
            spec("create_folder"),
            spec("create_note"),
        ])
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig::new().with_retry_policy(RetryPolicy {
            max_retries: 0,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff: BackoffKind::Exponential,
        })
    }

    struct Harness {
        model: MockModelClient,
        invoker: Arc<RecordingInvoker>,
        store: Arc<InMemoryThreadStore>,
        orchestrator: Orchestrator,
    }

    fn harness(steps: Vec<MockStep>, config: OrchestratorConfig) -> Harness {
        let model = MockModelClient::from_steps(steps);
        let invoker = Arc::new(RecordingInvoker::new());
        let store = Arc::new(InMemoryThreadStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(model.clone()),
            Arc::clone(&invoker) as Arc<dyn ToolInvoker>,
            Arc::clone(&store) as Arc<dyn ThreadStore>,
            registry(),
            config,
        );
        Harness {
            model,
            invoker,
            store,
            orchestrator,
        }
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn answered_without_tools() {
        let h = harness(vec![MockStep::text("plain answer")], fast_config());

        let outcome = h
            .orchestrator
            .run_round("s-1", "hello", Some("be helpful"), &catalog())
            .await
            .expect("outcome");

        assert_eq!(outcome.finish_reason, RoundFinishReason::Answered);
        assert_eq!(outcome.content.as_deref(), Some("plain answer"));
        assert!(outcome.tool_results.is_empty());
        assert_eq!(outcome.rounds, 1);
        // Nothing to persist on the no-tools path
        assert_eq!(h.store.message_count("s-1"), 0);
    }

    #[tokio::test]
    async fn sequential_writes_then_final_text() {
        let h = harness(
            vec![
                MockStep::tool_calls(vec![
                    call("c1", "create_folder", json!({"name": "X"})),
                    call("c2", "create_note", json!({"folder": "X", "title": "Y"})),
                ]),
                MockStep::text("Created folder X with note Y"),
            ],
            fast_config(),
        );

        let outcome = h
            .orchestrator
            .run_round("s-1", "create folder X with note Y", None, &catalog())
            .await
            .expect("outcome");

        assert_eq!(outcome.finish_reason, RoundFinishReason::Answered);
        assert_eq!(outcome.content.as_deref(), Some("Created folder X with note Y"));
        assert_eq!(outcome.tool_results.len(), 2);
        assert!(outcome.tool_results.iter().all(|r| r.success));
        // Writes are sequential and keep request order
        assert_eq!(h.invoker.calls(), vec!["create_folder", "create_note"]);
        // Assistant message plus one tool message per result, committed once
        assert_eq!(h.store.message_count("s-1"), 3);
        let snapshot = h.store.reload("s-1").await.expect("snapshot");
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn third_identical_signature_forces_tools_disabled_final() {
        // Same tool-name set three rounds running, different arguments each
        // time so dedup never kicks in.
        let batch = |round: u32| {
            MockStep::tool_calls(vec![call(
                &format!("c{round}"),
                "search_notes",
                json!({"query": format!("attempt {round}")}),
            )])
        };
        let h = harness(
            vec![batch(1), batch(2), batch(3), MockStep::text("best effort answer")],
            fast_config(),
        );

        let outcome = h
            .orchestrator
            .run_round("s-1", "find it", None, &catalog())
            .await
            .expect("outcome");

        assert_eq!(outcome.finish_reason, RoundFinishReason::LoopDetected);
        assert_eq!(outcome.content.as_deref(), Some("best effort answer"));
        // The third batch is never executed
        assert_eq!(h.invoker.calls_for("search_notes"), 2);
        // The forced final call offers no tools
        let captured = h.model.captured_requests();
        assert_eq!(captured.last().map(|r| r.tool_count), Some(0));
    }

    #[tokio::test]
    async fn duplicate_only_batch_forces_final_answer() {
        let read = || call("c-dup", "get_note", json!({"id": "n-1"}));
        let h = harness(
            vec![
                MockStep::tool_calls(vec![read()]),
                MockStep::tool_calls(vec![read()]),
                MockStep::text("already covered"),
            ],
            fast_config(),
        );

        let outcome = h
            .orchestrator
            .run_round("s-1", "read the note", None, &catalog())
            .await
            .expect("outcome");

        assert_eq!(outcome.finish_reason, RoundFinishReason::NoNewWork);
        assert_eq!(outcome.content.as_deref(), Some("already covered"));
        // The duplicate round never reaches the invoker
        assert_eq!(h.invoker.calls_for("get_note"), 1);
    }

    #[tokio::test]
    async fn identical_call_across_turns_is_not_re_executed() {
        let h = harness(
            vec![
                MockStep::tool_call("c1", "create_note", json!({"title": "X"})),
                MockStep::text("created"),
                MockStep::tool_call("c2", "create_note", json!({"title": "X"})),
                MockStep::text("it already exists"),
            ],
            fast_config(),
        );

        let first = h
            .orchestrator
            .run_round("s-1", "create note X", None, &catalog())
            .await
            .expect("first turn");
        assert_eq!(first.finish_reason, RoundFinishReason::Answered);

        // A later turn in the same session re-requests the identical write;
        // the persisted thread seeds dedup, so the tool does not run again.
        let second = h
            .orchestrator
            .run_round("s-1", "create note X again", None, &catalog())
            .await
            .expect("second turn");
        assert_eq!(second.finish_reason, RoundFinishReason::NoNewWork);
        assert_eq!(second.content.as_deref(), Some("it already exists"));
        assert_eq!(h.invoker.calls_for("create_note"), 1);
    }

    #[tokio::test]
    async fn round_deadline_aborts_in_flight_tools() {
        struct SlowInvoker {
            completed: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl ToolInvoker for SlowInvoker {
            async fn invoke(
                &self,
                _name: &str,
                _arguments: Value,
                _caller_token: Option<&str>,
            ) -> std::result::Result<Value, InvokeError> {
                tokio::time::sleep(Duration::from_millis(400)).await;
                self.completed.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        }

        let completed = Arc::new(AtomicUsize::new(0));
        let model = MockModelClient::from_steps(vec![MockStep::tool_call(
            "c1",
            "get_note",
            json!({"id": "n-1"}),
        )]);
        let orchestrator = Orchestrator::new(
            Arc::new(model),
            Arc::new(SlowInvoker {
                completed: Arc::clone(&completed),
            }),
            Arc::new(InMemoryThreadStore::new()) as Arc<dyn ThreadStore>,
            registry(),
            fast_config().with_round_deadline(Duration::from_millis(50)),
        );

        let outcome = orchestrator
            .run_round("s-1", "read the note", None, &catalog())
            .await
            .expect("outcome");
        assert_eq!(outcome.finish_reason, RoundFinishReason::Error);
        assert!(
            outcome
                .content
                .as_deref()
                .is_some_and(|c| c.contains("deadline"))
        );

        // The in-flight tool task was aborted, not left running detached
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn round_budget_exhaustion_forces_final_answer() {
        let h = harness(
            vec![
                MockStep::tool_call("c1", "get_note", json!({"id": "n-1"})),
                MockStep::tool_call("c2", "get_note", json!({"id": "n-2"})),
                MockStep::text("stopping here"),
            ],
            fast_config().with_max_rounds(1),
        );

        let outcome = h
            .orchestrator
            .run_round("s-1", "read everything", None, &catalog())
            .await
            .expect("outcome");

        assert_eq!(outcome.finish_reason, RoundFinishReason::BudgetExhausted);
        assert_eq!(outcome.content.as_deref(), Some("stopping here"));
        // Only the first round's call executed
        assert_eq!(h.invoker.calls_for("get_note"), 1);
        assert_eq!(outcome.tool_results.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_degrades_with_retry_hint() {
        let h = harness(
            vec![MockStep::error(ProviderError::RateLimited {
                message: "slow down".into(),
                retry_after_secs: Some(30),
            })],
            fast_config(),
        );

        let outcome = h
            .orchestrator
            .run_round("s-1", "hello", None, &catalog())
            .await
            .expect("outcome");

        assert_eq!(outcome.finish_reason, RoundFinishReason::Degraded);
        assert!(
            outcome
                .content
                .as_deref()
                .is_some_and(|c| c.contains("30 seconds"))
        );
        // Lock released on the degraded path too
        let second = h
            .orchestrator
            .run_round("s-1", "hello again", None, &catalog())
            .await
            .expect("second outcome");
        assert_eq!(second.finish_reason, RoundFinishReason::Answered);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_provider() {
        let h = harness(
            vec![MockStep::error(ProviderError::ServerBusy("overloaded".into()))],
            fast_config().with_breaker(1, Duration::from_secs(60)),
        );

        let first = h
            .orchestrator
            .run_round("s-1", "hello", None, &catalog())
            .await
            .expect("first outcome");
        assert_eq!(first.finish_reason, RoundFinishReason::Degraded);
        assert_eq!(h.model.call_count(), 1);

        let second = h
            .orchestrator
            .run_round("s-2", "hello", None, &catalog())
            .await
            .expect("second outcome");
        assert_eq!(second.finish_reason, RoundFinishReason::Degraded);
        // Breaker is open: the provider is not called again
        assert_eq!(h.model.call_count(), 1);
    }

    #[tokio::test]
    async fn validation_rejection_retried_with_corrective_note() {
        let h = harness(
            vec![
                MockStep::error(ProviderError::Validation("empty tool call id".into())),
                MockStep::text("corrected answer"),
            ],
            fast_config(),
        );

        let outcome = h
            .orchestrator
            .run_round("s-1", "hello", None, &catalog())
            .await
            .expect("outcome");

        assert_eq!(outcome.finish_reason, RoundFinishReason::Answered);
        assert_eq!(outcome.content.as_deref(), Some("corrected answer"));

        let captured = h.model.captured_requests();
        assert_eq!(captured.len(), 2);
        let corrective = captured[1].messages.last().expect("corrective note");
        assert_eq!(corrective.role, Role::System);
        assert!(corrective.content.contains("empty tool call id"));
    }

    #[tokio::test]
    async fn locked_session_is_rejected() {
        let locks = Arc::new(SessionLockTable::new(Duration::from_secs(60)));
        assert!(locks.try_acquire("s-1", "other-round"));

        let model = MockModelClient::from_steps(vec![MockStep::text("answer")]);
        let orchestrator = Orchestrator::new(
            Arc::new(model),
            Arc::new(RecordingInvoker::new()) as Arc<dyn ToolInvoker>,
            Arc::new(InMemoryThreadStore::new()) as Arc<dyn ThreadStore>,
            registry(),
            fast_config(),
        )
        .with_lock_table(Arc::clone(&locks));

        let err = orchestrator
            .run_round("s-1", "hello", None, &catalog())
            .await
            .expect_err("session is locked");
        assert!(matches!(err, EngineError::SessionLocked(_)));

        // An unrelated session is unaffected
        let outcome = orchestrator
            .run_round("s-2", "hello", None, &catalog())
            .await
            .expect("outcome");
        assert_eq!(outcome.finish_reason, RoundFinishReason::Answered);
    }

    #[tokio::test]
    async fn follow_up_round_sees_persisted_tool_results() {
        let h = harness(
            vec![
                MockStep::tool_call("c1", "get_note", json!({"id": "n-1"})),
                MockStep::text("the note says hi"),
            ],
            fast_config(),
        );

        let outcome = h
            .orchestrator
            .run_round("s-1", "what does the note say?", None, &catalog())
            .await
            .expect("outcome");
        assert_eq!(outcome.finish_reason, RoundFinishReason::Answered);

        // The second model call sees the assistant tool-call message and its
        // tool result from the committed thread.
        let captured = h.model.captured_requests();
        assert_eq!(captured.len(), 2);
        let follow_up = &captured[1];
        assert!(follow_up.messages.iter().any(|m| m.tool_calls.is_some()));
        assert!(
            follow_up
                .messages
                .iter()
                .any(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some("c1"))
        );
    }
}
