//! Circuit breaker for a busy model provider.
//!
//! Repeated server-busy failures open the breaker; while open, model calls
//! are short-circuited with an immediate degraded response instead of
//! hitting the provider. After the cooldown one trial call is allowed.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Provider-scoped circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                open_until: None,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether a provider call may proceed. While open, returns false until
    /// the cooldown elapses, then admits a single trial call.
    pub fn allow_call(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let expired = inner
                    .open_until
                    .is_none_or(|until| until <= Instant::now());
                if expired {
                    // Half-open: admit one trial, stay open until it succeeds
                    inner.open_until = Some(Instant::now() + self.cooldown);
                    tracing::info!("circuit breaker cooldown elapsed, admitting trial call");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            tracing::info!("circuit breaker closed after successful trial call");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold
            && inner.state == BreakerState::Closed
        {
            tracing::warn!(
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
            inner.state = BreakerState::Open;
        }
        if inner.state == BreakerState::Open {
            inner.open_until = Some(Instant::now() + self.cooldown);
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().state == BreakerState::Open
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FAILURE_THRESHOLD, Self::DEFAULT_COOLDOWN)
    }
}
