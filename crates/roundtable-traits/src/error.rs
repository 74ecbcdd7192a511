//! Boundary error types shared across the workspace.

use thiserror::Error;

/// Errors surfaced by a model provider through `ModelClient`.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Bad credentials or configuration. Never retried.
    #[error("fatal provider error: {0}")]
    Fatal(String),

    /// Provider rate limit hit. The round aborts with a retry-later message.
    #[error("provider rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Provider overloaded (5xx / overloaded). Drives the circuit breaker.
    #[error("provider busy: {0}")]
    ServerBusy(String),

    /// Provider rejected a malformed payload. The model can self-correct,
    /// so the orchestrator feeds this back as a corrective note and retries.
    #[error("provider validation error: {0}")]
    Validation(String),
}

impl ProviderError {
    /// Whether the orchestrator may retry the call at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::ServerBusy(_) | ProviderError::Validation(_)
        )
    }

    /// Whether this error should terminate the round immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProviderError::Fatal(_) | ProviderError::RateLimited { .. }
        )
    }
}

/// Errors raised by a tool back-end through `ToolInvoker`.
#[derive(Error, Debug, Clone)]
pub enum InvokeError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool execution failed: {0}")]
    Execution(String),

    #[error("tool rejected arguments: {0}")]
    InvalidArguments(String),
}

/// Errors raised by the persistence boundary through `ThreadStore`.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Optimistic-concurrency precondition failed. Carries the store's
    /// current version so the caller can refetch and replay.
    #[error("version conflict: expected {expected}, store is at {current}")]
    Conflict { expected: u64, current: u64 },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_classification() {
        assert!(ProviderError::Fatal("bad key".into()).is_fatal());
        assert!(
            ProviderError::RateLimited {
                message: "slow down".into(),
                retry_after_secs: Some(30),
            }
            .is_fatal()
        );
        assert!(ProviderError::ServerBusy("overloaded".into()).is_retryable());
        assert!(ProviderError::Validation("bad tool payload".into()).is_retryable());
        assert!(!ProviderError::Fatal("bad key".into()).is_retryable());
    }

    #[test]
    fn conflict_carries_versions() {
        let err = StoreError::Conflict {
            expected: 3,
            current: 5,
        };
        assert!(err.to_string().contains("expected 3"));
        assert!(err.to_string().contains("at 5"));
    }
}
