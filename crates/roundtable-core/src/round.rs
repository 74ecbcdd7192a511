//! Round state machine.
//!
//! One round is one model-tool-model cycle. Only the transitions in the
//! fixed table are legal; an attempted illegal transition fails with a
//! `StateTransition` error and forces the machine into `Error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Round lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Idle,
    CallModel1,
    ExecuteTools,
    PersistToolsBatch,
    ReloadThread,
    CallModel2,
    Done,
    Error,
}

impl RoundState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundState::Done | RoundState::Error)
    }
}

/// Whether `from -> to` appears in the fixed transition table. Any
/// non-terminal state may fail into `Error`.
fn transition_allowed(from: RoundState, to: RoundState) -> bool {
    use RoundState::*;
    if from.is_terminal() {
        return false;
    }
    if to == Error {
        return true;
    }
    matches!(
        (from, to),
        (Idle, CallModel1)
            // Answered without tools: the common path
            | (CallModel1, Done)
            | (CallModel1, ExecuteTools)
            | (ExecuteTools, PersistToolsBatch)
            | (PersistToolsBatch, ReloadThread)
            | (ReloadThread, CallModel2)
            | (CallModel2, Done)
    )
}

/// One entry of the monotonically appended state history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: RoundState,
    pub at: DateTime<Utc>,
}

/// Drives one orchestration round through the fixed state sequence.
/// Owned exclusively by the orchestrator executing the round.
#[derive(Debug, Clone)]
pub struct RoundStateMachine {
    round_id: String,
    session_id: String,
    state: RoundState,
    state_history: Vec<StateEntry>,
    transitions: usize,
    max_transitions: usize,
}

impl RoundStateMachine {
    /// Safety bound on transitions per round. The longest legal path takes
    /// six; anything near the bound is a state-handler bug, not real work.
    pub const DEFAULT_MAX_TRANSITIONS: usize = 16;

    pub fn new(session_id: impl Into<String>) -> Self {
        let state = RoundState::Idle;
        Self {
            round_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            state,
            state_history: vec![StateEntry {
                state,
                at: Utc::now(),
            }],
            transitions: 0,
            max_transitions: Self::DEFAULT_MAX_TRANSITIONS,
        }
    }

    pub fn with_max_transitions(mut self, max_transitions: usize) -> Self {
        self.max_transitions = max_transitions;
        self
    }

    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn state_history(&self) -> &[StateEntry] {
        &self.state_history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Take one transition. Illegal transitions and transition-bound
    /// violations force the machine into `Error` and return the violation.
    pub fn transition_to(&mut self, next: RoundState) -> Result<()> {
        if self.transitions >= self.max_transitions {
            self.force_error();
            return Err(EngineError::TransitionBound(self.transitions));
        }

        if !transition_allowed(self.state, next) {
            let from = self.state;
            tracing::error!(
                round = %self.round_id,
                from = ?from,
                to = ?next,
                "illegal state transition attempted"
            );
            self.force_error();
            return Err(EngineError::StateTransition { from, to: next });
        }

        self.state = next;
        self.transitions += 1;
        self.state_history.push(StateEntry {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    fn force_error(&mut self) {
        if self.state != RoundState::Error {
            self.state = RoundState::Error;
            self.transitions += 1;
            self.state_history.push(StateEntry {
                state: RoundState::Error,
                at: Utc::now(),
            });
        }
    }
}
