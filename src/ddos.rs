//! DDoS detection and emergency limits.
//!
//! The emergency controller owns the Normal/Emergency state machine; the
//! detector is a periodic task sampling aggregate statistics (request rate,
//! rejection ratio, unique-identifier churn) against configured thresholds
//! and escalating automatically on breach.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{dispatch, Alert, AlertChannel, AlertKind};
use crate::limiter::Identifier;
use crate::stats::Statistics;

/// Below this many requests in a sample, the rejection ratio is noise and
/// is not evaluated.
const MIN_SAMPLE_FOR_RATIO: u64 = 20;

/// Below this sample length the rate is not evaluated: dividing by a
/// near-zero interval inflates it arbitrarily.
const MIN_SAMPLE_ELAPSED_MS: u64 = 10;

/// Detector thresholds and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosConfig {
    /// How often the detector samples, in ms.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Aggregate request rate that indicates an attack.
    #[serde(default = "default_max_requests_per_sec")]
    pub max_requests_per_sec: f64,

    /// Rejection ratio (blocked / total) that indicates an attack.
    #[serde(default = "default_max_rejection_ratio")]
    pub max_rejection_ratio: f64,

    /// Unique identifiers seen in one sample interval that indicate an
    /// attack (botnet churn).
    #[serde(default = "default_max_identifier_churn")]
    pub max_identifier_churn: u64,

    /// How long automatic escalations keep the emergency profile active,
    /// in ms. Also the default for manual activation without a duration.
    #[serde(default = "default_emergency_duration_ms")]
    pub emergency_duration_ms: u64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            max_requests_per_sec: default_max_requests_per_sec(),
            max_rejection_ratio: default_max_rejection_ratio(),
            max_identifier_churn: default_max_identifier_churn(),
            emergency_duration_ms: default_emergency_duration_ms(),
        }
    }
}

fn default_sample_interval_ms() -> u64 {
    10_000
}

fn default_max_requests_per_sec() -> f64 {
    1_000.0
}

fn default_max_rejection_ratio() -> f64 {
    0.5
}

fn default_max_identifier_churn() -> u64 {
    5_000
}

fn default_emergency_duration_ms() -> u64 {
    300_000
}

/// Read-only view of the emergency state.
#[derive(Debug, Clone, Serialize)]
pub struct EmergencySnapshot {
    pub active: bool,
    pub activation_id: Option<Uuid>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub manual: bool,
}

#[derive(Debug, Default)]
struct EmergencyInner {
    active: bool,
    activation_id: Option<Uuid>,
    activated_at: Option<DateTime<Utc>>,
    activated_mono: Option<Instant>,
    duration: Option<Duration>,
    expires_at: Option<DateTime<Utc>>,
    reason: Option<String>,
    manual: bool,
}

/// Normal/Emergency state machine. While active, the evaluator uses the
/// tightened emergency profile.
pub struct EmergencyController {
    inner: Mutex<EmergencyInner>,
    stats: Arc<Statistics>,
    alerts: Arc<dyn AlertChannel>,
    alert_timeout: Duration,
    default_duration_ms: u64,
}

impl EmergencyController {
    pub fn new(
        stats: Arc<Statistics>,
        alerts: Arc<dyn AlertChannel>,
        alert_timeout: Duration,
        default_duration_ms: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(EmergencyInner::default()),
            stats,
            alerts,
            alert_timeout,
            default_duration_ms,
        }
    }

    /// Activate emergency limits. Manual and automatic activations are
    /// logged distinctly for audit purposes. Re-activating while already
    /// active refreshes the reason and expiry without counting a new
    /// activation.
    pub fn activate(&self, reason: &str, duration_ms: Option<u64>, manual: bool) {
        let duration = Duration::from_millis(duration_ms.unwrap_or(self.default_duration_ms));
        let now = Utc::now();

        let newly_activated = {
            let mut inner = self.inner.lock();
            let newly = !inner.active;
            inner.active = true;
            inner.activated_at = Some(now);
            inner.activated_mono = Some(Instant::now());
            inner.duration = Some(duration);
            inner.expires_at = Some(now + chrono::Duration::from_std(duration).unwrap_or_default());
            inner.reason = Some(reason.to_string());
            inner.manual = manual;
            if newly {
                inner.activation_id = Some(Uuid::new_v4());
            }
            newly
        };

        if manual {
            warn!(
                reason = %reason,
                duration_ms = duration.as_millis() as u64,
                trigger = "manual",
                "Emergency limits activated by operator"
            );
        } else {
            warn!(
                reason = %reason,
                duration_ms = duration.as_millis() as u64,
                trigger = "automatic",
                "Emergency limits activated by detector"
            );
        }

        if newly_activated {
            self.stats.record_emergency_activation();
            dispatch(
                self.alerts.clone(),
                Alert::new(AlertKind::EmergencyActivated, reason),
                self.alert_timeout,
            );
        }
    }

    /// Deactivate emergency limits. Idempotent.
    pub fn deactivate(&self, trigger: &str) {
        let was_active = {
            let mut inner = self.inner.lock();
            let was = inner.active;
            *inner = EmergencyInner::default();
            was
        };
        if was_active {
            info!(trigger = %trigger, "Emergency limits deactivated");
            dispatch(
                self.alerts.clone(),
                Alert::new(AlertKind::EmergencyDeactivated, trigger),
                self.alert_timeout,
            );
        }
    }

    /// Whether the emergency profile is in effect. Expiry is applied
    /// lazily here, so the evaluator always sees a current answer.
    pub fn is_active(&self) -> bool {
        let expired = {
            let inner = self.inner.lock();
            match (inner.active, inner.activated_mono, inner.duration) {
                (true, Some(at), Some(duration)) => at.elapsed() >= duration,
                _ => false,
            }
        };
        if expired {
            self.deactivate("duration elapsed");
            return false;
        }
        self.inner.lock().active
    }

    pub fn snapshot(&self) -> EmergencySnapshot {
        // Apply lazy expiry before reporting.
        let active = self.is_active();
        let inner = self.inner.lock();
        EmergencySnapshot {
            active,
            activation_id: inner.activation_id,
            activated_at: inner.activated_at,
            expires_at: inner.expires_at,
            reason: inner.reason.clone(),
            manual: inner.manual,
        }
    }
}

/// Periodic detector sampling aggregate statistics for attack patterns.
pub struct DdosDetector {
    config: DdosConfig,
    stats: Arc<Statistics>,
    emergency: Arc<EmergencyController>,
    churn: Mutex<HashSet<String>>,
    last_totals: Mutex<(u64, u64)>,
    last_sample: Mutex<Instant>,
}

impl DdosDetector {
    pub fn new(
        config: DdosConfig,
        stats: Arc<Statistics>,
        emergency: Arc<EmergencyController>,
    ) -> Self {
        Self {
            config,
            stats,
            emergency,
            churn: Mutex::new(HashSet::new()),
            last_totals: Mutex::new((0, 0)),
            last_sample: Mutex::new(Instant::now()),
        }
    }

    /// The configured thresholds, read-only.
    pub fn thresholds(&self) -> &DdosConfig {
        &self.config
    }

    /// Track identifiers seen on a request for churn measurement. Bounded:
    /// once the set is far past the threshold, further values carry no
    /// signal and are dropped.
    pub fn observe(&self, identifiers: &[Identifier]) {
        let cap = (self.config.max_identifier_churn.saturating_mul(2)).max(1024) as usize;
        let mut churn = self.churn.lock();
        for id in identifiers {
            if churn.len() >= cap {
                break;
            }
            churn.insert(id.to_string());
        }
    }

    /// Take one sample and escalate if a threshold is breached. Returns
    /// the breach description, if any.
    pub fn sample_once(&self) -> Option<String> {
        let (allowed, blocked) = self.stats.totals();
        let (last_allowed, last_blocked) = {
            let mut last = self.last_totals.lock();
            let prev = *last;
            *last = (allowed, blocked);
            prev
        };
        let elapsed = {
            let mut last = self.last_sample.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let churn = {
            let mut churn = self.churn.lock();
            std::mem::take(&mut *churn).len() as u64
        };

        let allowed_delta = allowed.saturating_sub(last_allowed);
        let blocked_delta = blocked.saturating_sub(last_blocked);
        let total_delta = allowed_delta + blocked_delta;

        let rate = if elapsed.as_millis() as u64 >= MIN_SAMPLE_ELAPSED_MS {
            total_delta as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let rejection_ratio = if total_delta > 0 {
            blocked_delta as f64 / total_delta as f64
        } else {
            0.0
        };

        debug!(
            requests = total_delta,
            rate = rate,
            rejection_ratio = rejection_ratio,
            unique_identifiers = churn,
            "DDoS detector sample"
        );

        let breach = if rate > self.config.max_requests_per_sec {
            Some(format!(
                "request rate {:.0}/s exceeded threshold {:.0}/s",
                rate, self.config.max_requests_per_sec
            ))
        } else if total_delta >= MIN_SAMPLE_FOR_RATIO
            && rejection_ratio > self.config.max_rejection_ratio
        {
            Some(format!(
                "rejection ratio {:.2} exceeded threshold {:.2}",
                rejection_ratio, self.config.max_rejection_ratio
            ))
        } else if churn > self.config.max_identifier_churn {
            Some(format!(
                "identifier churn {} exceeded threshold {}",
                churn, self.config.max_identifier_churn
            ))
        } else {
            None
        };

        if let Some(reason) = &breach {
            if !self.emergency.is_active() {
                self.emergency
                    .activate(reason, Some(self.config.emergency_duration_ms), false);
            }
        } else {
            // Lazy expiry tick while idle.
            self.emergency.is_active();
        }

        breach
    }

    /// Run the detector until the returned handle is aborted.
    pub fn run(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.sample_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the first real
            // sample covers a full interval.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sample_once();
            }
        })
    }
}
