//! TTL-based memoization of cacheable tool results.
//!
//! Entries are keyed by the canonical argument key and evicted on TTL expiry
//! or FIFO once the cache exceeds its capacity. This is an at-least-as-fresh
//! cache, not a correctness guarantee: write-like tools are never cacheable.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use roundtable_traits::ToolResult;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: ToolResult,
    created_at: Instant,
    hits: u64,
}

/// Bounded, TTL-based result cache shared across calls within a process
/// lifetime. Entry access is key-scoped; unrelated keys never contend.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    insertion_order: Mutex<VecDeque<String>>,
    ttl: Duration,
    capacity: usize,
    total_hits: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::with_capacity(capacity)),
            ttl,
            capacity,
            total_hits: AtomicU64::new(0),
        }
    }

    /// Look up a live entry. Expired entries are removed on access. The
    /// returned result carries the cache-hit flag.
    pub fn get(&self, key: &str) -> Option<ToolResult> {
        let mut expired = false;
        let result = self.entries.get_mut(key).and_then(|mut entry| {
            if entry.created_at.elapsed() < self.ttl {
                entry.hits += 1;
                Some(entry.result.clone().with_cache_hit())
            } else {
                expired = true;
                None
            }
        });

        if expired {
            self.entries.remove(key);
            // Keep the eviction queue in sync, or it grows by one stale key
            // per expired insert over the process lifetime.
            let mut order = match self.insertion_order.lock() {
                Ok(order) => order,
                Err(poisoned) => poisoned.into_inner(),
            };
            order.retain(|queued| queued != key);
        }
        if result.is_some() {
            self.total_hits.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Store a result. Oldest entries are evicted first once the cache is
    /// at capacity.
    pub fn put(&self, key: impl Into<String>, result: ToolResult) {
        let key = key.into();
        let mut order = match self.insertion_order.lock() {
            Ok(order) => order,
            Err(poisoned) => poisoned.into_inner(),
        };

        while self.entries.len() >= self.capacity {
            match order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        if self
            .entries
            .insert(
                key.clone(),
                CacheEntry {
                    result,
                    created_at: Instant::now(),
                    hits: 0,
                },
            )
            .is_none()
        {
            order.push_back(key);
        }
    }

    /// Total cache hits over the cache's lifetime.
    pub fn hit_count(&self) -> u64 {
        self.total_hits.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
