//! Counter store backends.
//!
//! The counter store is the single point of external I/O on the hot path.
//! It provides atomic increment-with-expiry for fixed-window counters plus
//! the key-value operations the blocklist and the admin resets need.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;

use crate::error::Result;

/// Result of one counter increment: the post-increment count and when the
/// window the counter lives in expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Count after this increment, including it.
    pub count: u64,
    /// Epoch milliseconds at which the counter's window ends.
    pub expires_at_ms: u64,
}

/// Trait for counter store backends.
///
/// Every method is bounded by the backend's per-call timeout; a timeout is
/// reported as `StoreUnavailable`, identical to a connection failure. All
/// calls go through the circuit breaker, never directly.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment a bucketed counter and set its expiry to the
    /// end of the current window, in one round trip.
    async fn increment(&self, key: &str, window_ms: u64) -> Result<WindowHit>;

    /// Read a raw value. Counters read back as their decimal form.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a raw value with a TTL in milliseconds.
    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()>;

    /// Whether a non-expired entry exists for the key.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a single key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key matching a glob pattern, returning how many were
    /// removed. O(n) in key count; intended for admin resets only.
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;

    /// List every live key matching a glob pattern. O(n) in key count;
    /// intended for admin operations only.
    async fn scan_matching(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Minimal glob matching for key patterns: `*` matches any run of
/// characters, everything else is literal.
pub(crate) fn glob_match(pattern: &str, input: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = input.chars().collect();

    // Iterative backtracking matcher.
    let (mut pi, mut si) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);

    while si < s.len() {
        if pi < p.len() && (p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = si;
            pi += 1;
        } else if let Some(sp) = star {
            pi = sp + 1;
            mark += 1;
            si = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
