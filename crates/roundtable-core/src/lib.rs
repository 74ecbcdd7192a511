//! Roundtable Core - The round-orchestration engine.
//!
//! One round is one model-tools-model cycle: call the model, execute the
//! tool calls it requests, persist the batch, reload the committed thread,
//! and call the model again. `Orchestrator::run_round` drives a whole user
//! turn through as many rounds as the budgets allow.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod lock;
pub mod metadata;
pub mod mock;
pub mod normalize;
pub mod orchestrator;
pub mod persist;
pub mod round;
pub mod scheduler;
pub mod store_mem;

// ── Top-level re-exports ─────────────────────────────────────────────

pub use breaker::CircuitBreaker;
pub use cache::ResultCache;
pub use config::OrchestratorConfig;
pub use error::{EngineError, Result};
pub use executor::{BackoffKind, RetryPolicy, ToolExecutionService};
pub use history::{ConversationHistoryBuilder, HistoryBuild, HistoryViolation};
pub use lock::SessionLockTable;
pub use metadata::{ToolCategory, ToolMetadata, ToolMetadataRegistry};
pub use mock::{CapturedRequest, MockModelClient, MockStep, MockStepKind};
pub use normalize::{canonical_key, normalize};
pub use orchestrator::{Orchestrator, RoundFinishReason, RoundOutcome};
pub use persist::{BatchPersistenceClient, CommitOutcome};
pub use round::{RoundState, RoundStateMachine, StateEntry};
pub use scheduler::{LoopInfo, ScheduleOutcome, ToolCallScheduler};
pub use store_mem::InMemoryThreadStore;
