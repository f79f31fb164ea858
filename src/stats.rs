//! Engine statistics.
//!
//! Monotonically increasing counters mutated only by the engine; consumers
//! see immutable snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Shared statistics counters. One instance per engine.
pub struct Statistics {
    allowed: AtomicU64,
    blocked: AtomicU64,
    breaker_trips: AtomicU64,
    emergency_activations: AtomicU64,
    started_at: Instant,
}

/// Immutable point-in-time view of the statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Requests admitted.
    pub allowed: u64,
    /// Requests rejected, for any reason.
    pub blocked: u64,
    /// Total requests evaluated.
    pub total: u64,
    /// Times the circuit breaker entered Open.
    pub breaker_trips: u64,
    /// Times emergency limits were activated (auto or manual).
    pub emergency_activations: u64,
    /// blocked / total, 0.0 when no traffic was seen.
    pub rejection_ratio: f64,
    /// Average request rate since the engine started.
    pub requests_per_sec: f64,
    /// Seconds since the engine started.
    pub uptime_secs: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
            emergency_activations: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emergency_activation(&self) {
        self.emergency_activations.fetch_add(1, Ordering::Relaxed);
    }

    /// Raw (allowed, blocked) totals, used by the DDoS detector for
    /// delta-based sampling.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.allowed.load(Ordering::Relaxed),
            self.blocked.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let blocked = self.blocked.load(Ordering::Relaxed);
        let total = allowed + blocked;
        let uptime = self.started_at.elapsed();

        let rejection_ratio = if total > 0 {
            blocked as f64 / total as f64
        } else {
            0.0
        };
        let requests_per_sec = if uptime.as_secs_f64() > 0.0 {
            total as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        StatsSnapshot {
            allowed,
            blocked,
            total,
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            emergency_activations: self.emergency_activations.load(Ordering::Relaxed),
            rejection_ratio,
            requests_per_sec,
            uptime_secs: uptime.as_secs(),
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}
