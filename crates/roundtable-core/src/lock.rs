//! Per-session advisory locks with expiry-based reclaim.
//!
//! One entry per session; unrelated sessions never contend. A lock held past
//! its expiry is considered abandoned and may be reclaimed by a new round.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
struct LockEntry {
    round_id: String,
    expires_at: Instant,
}

/// Key-scoped advisory lock table shared across concurrent rounds.
#[derive(Debug)]
pub struct SessionLockTable {
    locks: DashMap<String, LockEntry>,
    ttl: Duration,
}

impl SessionLockTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            ttl,
        }
    }

    /// Acquire the session lock for a round. Succeeds when the session is
    /// unlocked, the round already holds it, or the previous holder expired.
    pub fn try_acquire(&self, session_id: &str, round_id: &str) -> bool {
        let now = Instant::now();
        let mut acquired = false;

        self.locks
            .entry(session_id.to_string())
            .and_modify(|entry| {
                if entry.round_id == round_id || entry.expires_at <= now {
                    if entry.expires_at <= now {
                        tracing::warn!(
                            session = %session_id,
                            abandoned_round = %entry.round_id,
                            new_round = %round_id,
                            "reclaiming abandoned session lock"
                        );
                    }
                    entry.round_id = round_id.to_string();
                    entry.expires_at = now + self.ttl;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockEntry {
                    round_id: round_id.to_string(),
                    expires_at: now + self.ttl,
                }
            });

        acquired
    }

    /// Release the lock if this round still holds it.
    pub fn release(&self, session_id: &str, round_id: &str) -> bool {
        self.locks
            .remove_if(session_id, |_, entry| entry.round_id == round_id)
            .is_some()
    }

    /// Whether a live lock is held for the session.
    pub fn is_locked(&self, session_id: &str) -> bool {
        self.locks
            .get(session_id)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }
}
