//! Circuit breaker guarding the counter store.
//!
//! A single breaker instance wraps every store call. Failures within the
//! failure window accumulate; at the threshold the breaker opens and store
//! calls are short-circuited until the cooldown elapses, after which exactly
//! one trial call probes the backend.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alerts::{dispatch, Alert, AlertChannel, AlertKind};
use crate::error::Result;
use crate::stats::Statistics;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// What to do with a request when the store cannot answer: admit it
/// (fail-open) or reject it (fail-closed). Explicit configuration, never
/// inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    Open,
    Closed,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the failure window before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Window within which consecutive failures accumulate, in ms.
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,

    /// How long the breaker stays Open before permitting a trial, in ms.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Per-call timeout for store operations, in ms. A timeout counts as a
    /// failure.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Fail policy applied while the store cannot answer.
    #[serde(default = "default_fail_policy")]
    pub fail_policy: FailPolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            fail_policy: default_fail_policy(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_ms() -> u64 {
    60_000
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_call_timeout_ms() -> u64 {
    2_000
}

fn default_fail_policy() -> FailPolicy {
    FailPolicy::Open
}

/// Read-only view of the breaker for the facade.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Outcome of one guarded store call.
#[derive(Debug)]
pub enum CallOutcome<T> {
    /// The store answered.
    Success(T),
    /// The call failed or timed out; the failure was recorded.
    Failed,
    /// The breaker is Open (or a half-open trial is already in flight);
    /// the store was not touched.
    ShortCircuited,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

enum Permit {
    Pass,
    Trial,
    ShortCircuit,
}

/// Releases a half-open trial permit if the guarded call is dropped
/// before it reports a result. An abandoned trial returns the breaker to
/// Open and restarts the cooldown; otherwise the permit would be held
/// forever and every later call would short-circuit.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.breaker.inner.lock();
        if inner.state == BreakerState::HalfOpen && inner.trial_in_flight {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
        }
    }
}

/// The shared circuit breaker. One instance per engine, shared by all
/// evaluations; transitions are applied under a single mutex so concurrent
/// failure reports cannot double-trip.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    stats: Arc<Statistics>,
    alerts: Arc<dyn AlertChannel>,
    alert_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(
        config: BreakerConfig,
        stats: Arc<Statistics>,
        alerts: Arc<dyn AlertChannel>,
        alert_timeout: Duration,
    ) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                opened_at: None,
                trial_in_flight: false,
            }),
            stats,
            alerts,
            alert_timeout,
        }
    }

    /// The configured fail policy.
    pub fn fail_policy(&self) -> FailPolicy {
        self.config.fail_policy
    }

    /// Execute a store call under breaker protection.
    ///
    /// The lock is never held across the call itself: permission is taken,
    /// the lock dropped, the call run under the per-call timeout, and the
    /// result recorded afterwards.
    pub async fn call<T, F, Fut>(&self, op: F) -> CallOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let trial = match self.acquire() {
            Permit::ShortCircuit => return CallOutcome::ShortCircuited,
            Permit::Pass => false,
            Permit::Trial => true,
        };
        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };

        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => {
                guard.armed = false;
                self.record_success();
                CallOutcome::Success(value)
            }
            Ok(Err(e)) => {
                guard.armed = false;
                debug!(error = %e, "Store call failed");
                self.record_failure();
                CallOutcome::Failed
            }
            Err(_) => {
                guard.armed = false;
                debug!(timeout_ms = self.config.call_timeout_ms, "Store call timed out");
                self.record_failure();
                CallOutcome::Failed
            }
        }
    }

    fn acquire(&self) -> Permit {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Permit::Pass,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= Duration::from_millis(self.config.cooldown_ms))
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!("Circuit breaker half-open, permitting one trial call");
                    Permit::Trial
                } else {
                    Permit::ShortCircuit
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    // Another request's trial is outstanding; treat as Open.
                    Permit::ShortCircuit
                } else {
                    inner.trial_in_flight = true;
                    Permit::Trial
                }
            }
        }
    }

    /// Record a successful store call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.trial_in_flight = false;
                inner.opened_at = None;
                info!("Circuit breaker closed, store recovered");
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed or timed-out store call. Opens the breaker when the
    /// threshold is reached within the failure window, or immediately when
    /// a half-open trial fails.
    pub fn record_failure(&self) {
        let tripped = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let window = Duration::from_millis(self.config.failure_window_ms);

            let within_window = inner
                .last_failure
                .map(|t| t.elapsed() <= window)
                .unwrap_or(false);
            inner.failure_count = if within_window {
                inner.failure_count + 1
            } else {
                1
            };
            inner.last_failure = Some(now);
            inner.last_failure_at = Some(Utc::now());

            match inner.state {
                BreakerState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    true
                }
                BreakerState::HalfOpen => {
                    // Failed trial: back to Open, cooldown restarts.
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.trial_in_flight = false;
                    true
                }
                _ => false,
            }
        };

        if tripped {
            self.stats.record_breaker_trip();
            warn!(
                threshold = self.config.failure_threshold,
                cooldown_ms = self.config.cooldown_ms,
                "Circuit breaker tripped, store calls short-circuited"
            );
            dispatch(
                self.alerts.clone(),
                Alert::new(AlertKind::BreakerTripped, "store failure threshold reached"),
                self.alert_timeout,
            );
        }
    }

    /// Force the breaker Open regardless of failure history, e.g. on a
    /// suspected store compromise.
    pub fn force_open(&self, reason: &str) {
        {
            let mut inner = self.inner.lock();
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
        }
        self.stats.record_breaker_trip();
        warn!(reason = %reason, "Circuit breaker forced open");
        dispatch(
            self.alerts.clone(),
            Alert::new(AlertKind::BreakerForcedOpen, reason),
            self.alert_timeout,
        );
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Read-only snapshot for the facade.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogAlertChannel;
    use crate::error::BreakwaterError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: threshold,
                failure_window_ms: 60_000,
                cooldown_ms,
                call_timeout_ms: 100,
                fail_policy: FailPolicy::Open,
            },
            Arc::new(Statistics::new()),
            Arc::new(LogAlertChannel),
            Duration::from_millis(100),
        )
    }

    async fn failing_call(breaker: &CircuitBreaker, invocations: &AtomicUsize) -> CallOutcome<()> {
        breaker
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BreakwaterError::StoreUnavailable("down".to_string()))
            })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let breaker = test_breaker(3, 10_000);
        let invocations = AtomicUsize::new(0);

        for _ in 0..3 {
            failing_call(&breaker, &invocations).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        // Next call must not touch the store.
        let outcome = failing_call(&breaker, &invocations).await;
        assert!(matches!(outcome, CallOutcome::ShortCircuited));
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_successful_trial_closes_and_resets() {
        let breaker = test_breaker(2, 30);
        let invocations = AtomicUsize::new(0);

        failing_call(&breaker, &invocations).await;
        failing_call(&breaker, &invocations).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = breaker.call(|| async { Ok::<_, _>(7u64) }).await;
        assert!(matches!(outcome, CallOutcome::Success(7)));
        let snap = breaker.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_and_restarts_cooldown() {
        let breaker = test_breaker(1, 40);
        let invocations = AtomicUsize::new(0);

        failing_call(&breaker, &invocations).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let outcome = failing_call(&breaker, &invocations).await;
        assert!(matches!(outcome, CallOutcome::Failed));
        assert_eq!(breaker.state(), BreakerState::Open);

        // Cooldown restarted: an immediate call short-circuits again.
        let outcome = failing_call(&breaker, &invocations).await;
        assert!(matches!(outcome, CallOutcome::ShortCircuited));
    }

    #[tokio::test]
    async fn test_abandoned_trial_releases_permit() {
        let breaker = test_breaker(1, 20);
        let invocations = AtomicUsize::new(0);

        failing_call(&breaker, &invocations).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Drop the trial call mid-flight. The permit must be released and
        // the breaker returned to Open, not left half-open forever.
        let _ = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, _>(())
            }),
        )
        .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // After the restarted cooldown a fresh trial runs and closes.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let outcome = breaker.call(|| async { Ok::<_, _>(()) }).await;
        assert!(matches!(outcome, CallOutcome::Success(())));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_permits_exactly_one_trial() {
        let breaker = test_breaker(1, 20);
        let invocations = AtomicUsize::new(0);

        failing_call(&breaker, &invocations).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        // First acquire moves to HalfOpen and takes the trial slot; a
        // second concurrent arrival is treated as Open.
        assert!(matches!(breaker.acquire(), Permit::Trial));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(matches!(breaker.acquire(), Permit::ShortCircuit));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_when_closed() {
        let breaker = test_breaker(5, 10_000);
        let invocations = AtomicUsize::new(0);

        failing_call(&breaker, &invocations).await;
        failing_call(&breaker, &invocations).await;
        assert_eq!(breaker.snapshot().failure_count, 2);

        breaker.call(|| async { Ok::<_, _>(()) }).await;
        assert_eq!(breaker.snapshot().failure_count, 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_force_open() {
        let breaker = test_breaker(5, 10_000);
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.force_open("suspected store compromise");
        assert_eq!(breaker.state(), BreakerState::Open);

        let invocations = AtomicUsize::new(0);
        let outcome = failing_call(&breaker, &invocations).await;
        assert!(matches!(outcome, CallOutcome::ShortCircuited));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let breaker = test_breaker(1, 10_000);

        let outcome = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, _>(())
            })
            .await;

        assert!(matches!(outcome, CallOutcome::Failed));
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
