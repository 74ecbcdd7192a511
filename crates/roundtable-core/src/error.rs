//! Error types for the orchestration engine

use roundtable_traits::{ProviderError, StoreError};
use thiserror::Error;

use crate::round::RoundState;

/// Engine error taxonomy. Tool-level and persistence-level failures are
/// recovered locally and encoded as data (failed `ToolResult`s, replay
/// receipts); only state-machine violations and fatal provider errors
/// propagate through this type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Illegal state transition. Programmer/data error, always fatal.
    #[error("illegal state transition: {from:?} -> {to:?}")]
    StateTransition { from: RoundState, to: RoundState },

    /// State machine exceeded its transition safety bound.
    #[error("transition bound exceeded after {0} transitions")]
    TransitionBound(usize),

    /// Session advisory lock held by another live round.
    #[error("session {0} is locked by another round")]
    SessionLocked(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
