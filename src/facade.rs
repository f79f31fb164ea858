//! The admission controller facade.
//!
//! Owns every engine component and exposes the evaluation entry point plus
//! the administrative surface. This is the only type a route layer needs.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::alerts::{AlertChannel, LogAlertChannel};
use crate::breaker::{BreakerSnapshot, BreakerState, CallOutcome, CircuitBreaker, FailPolicy};
use crate::config::BreakwaterConfig;
use crate::ddos::{DdosConfig, DdosDetector, EmergencyController, EmergencySnapshot};
use crate::error::{BreakwaterError, Result};
use crate::limiter::{
    BlockedIp, Decision, DecisionReason, Identifier, IpBlocklist, LimitKind, LimitStatus, Plan,
    PlanResolver, RateLimitEvaluator, RateLimitRule, RuleSet, RuleTable,
};
use crate::stats::{Statistics, StatsSnapshot};
use crate::store::CounterStore;

/// Composite engine health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Breaker closed, normal limits in effect.
    Healthy,
    /// Breaker half-open or emergency limits active.
    Degraded,
    /// Breaker open; every decision follows the fail policy.
    Critical,
}

/// The engine facade. Cheap to share behind an `Arc`; every method takes
/// `&self`.
pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    breaker: Arc<CircuitBreaker>,
    blocklist: Arc<IpBlocklist>,
    plans: Arc<PlanResolver>,
    rules: Arc<RuleTable>,
    emergency: Arc<EmergencyController>,
    detector: Arc<DdosDetector>,
    evaluator: RateLimitEvaluator,
    stats: Arc<Statistics>,
    key_prefix: String,
    reset_confirmation_token: String,
    evaluation_deadline: Duration,
}

impl AdmissionController {
    /// Build the engine from configuration and a store backend, with the
    /// default tracing-backed alert channel.
    pub fn new(config: BreakwaterConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        Self::with_alerts(config, store, Arc::new(LogAlertChannel))
    }

    /// Build the engine with a custom alert channel.
    pub fn with_alerts(
        config: BreakwaterConfig,
        store: Arc<dyn CounterStore>,
        alerts: Arc<dyn AlertChannel>,
    ) -> Result<Self> {
        let stats = Arc::new(Statistics::new());
        let alert_timeout = Duration::from_millis(config.admin.alert_timeout_ms);

        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker,
            stats.clone(),
            alerts.clone(),
            alert_timeout,
        ));
        let blocklist = Arc::new(IpBlocklist::new(
            store.clone(),
            breaker.clone(),
            config.blocklist,
            config.store.key_prefix.clone(),
        ));
        let plans = Arc::new(PlanResolver::new(config.plans)?);
        let rules = Arc::new(RuleTable::new(RuleSet::from_config(&config.limits)?));
        let emergency = Arc::new(EmergencyController::new(
            stats.clone(),
            alerts,
            alert_timeout,
            config.ddos.emergency_duration_ms,
        ));
        let detector = Arc::new(DdosDetector::new(
            config.ddos,
            stats.clone(),
            emergency.clone(),
        ));
        let evaluator = RateLimitEvaluator::new(
            store.clone(),
            breaker.clone(),
            blocklist.clone(),
            plans.clone(),
            rules.clone(),
            emergency.clone(),
            stats.clone(),
            config.store.key_prefix.clone(),
        );

        Ok(Self {
            store,
            breaker,
            blocklist,
            plans,
            rules,
            emergency,
            detector,
            evaluator,
            stats,
            key_prefix: config.store.key_prefix,
            reset_confirmation_token: config.admin.reset_confirmation_token,
            evaluation_deadline: Duration::from_millis(config.admin.evaluation_deadline_ms.max(1)),
        })
    }

    /// Evaluate one request. Returns `Err` only for malformed input; store
    /// trouble always resolves into a decision per the fail policy.
    #[instrument(skip(self, identifiers), fields(endpoint = %endpoint))]
    pub async fn check_request(
        &self,
        endpoint: &str,
        identifiers: &[Identifier],
    ) -> Result<Decision> {
        if endpoint.is_empty() {
            return Err(BreakwaterError::Validation(
                "endpoint must not be empty".to_string(),
            ));
        }
        if identifiers.is_empty() {
            return Err(BreakwaterError::Validation(
                "at least one identifier is required".to_string(),
            ));
        }
        for identifier in identifiers {
            if identifier.value().is_empty() {
                return Err(BreakwaterError::Validation(format!(
                    "empty {} identifier",
                    identifier.kind()
                )));
            }
        }

        self.detector.observe(identifiers);

        match tokio::time::timeout(
            self.evaluation_deadline,
            self.evaluator.evaluate(endpoint, identifiers),
        )
        .await
        {
            Ok(decision) => Ok(decision),
            Err(_) => {
                // The deadline is a store failure like any other.
                warn!(
                    deadline_ms = self.evaluation_deadline.as_millis() as u64,
                    "Evaluation deadline exceeded"
                );
                self.breaker.record_failure();
                let decision = match self.breaker.fail_policy() {
                    FailPolicy::Open => {
                        self.stats.record_allowed();
                        Decision::admitted(None, true)
                    }
                    FailPolicy::Closed => {
                        self.stats.record_blocked();
                        Decision::rejected(DecisionReason::StoreUnavailable, None, true)
                    }
                };
                Ok(decision)
            }
        }
    }

    /// Current counts and remaining quota without incrementing anything.
    pub async fn get_rate_limit_status(
        &self,
        endpoint: &str,
        identifiers: &[Identifier],
    ) -> Result<Vec<LimitStatus>> {
        self.evaluator.status(endpoint, identifiers).await
    }

    /// Replace the rule for (endpoint, kind). Effective on the very next
    /// evaluation.
    pub fn adjust_rate_limit(
        &self,
        endpoint: &str,
        kind: LimitKind,
        max: u64,
        window_ms: u64,
    ) -> Result<RateLimitRule> {
        self.rules.adjust(endpoint, kind, max, window_ms)
    }

    /// Block an IP for `duration_ms`.
    pub async fn block_ip(
        &self,
        ip: &str,
        duration_ms: u64,
        reason: Option<&str>,
    ) -> Result<BlockedIp> {
        self.blocklist.block(ip, duration_ms, reason).await
    }

    /// Remove a block immediately.
    pub async fn unblock_ip(&self, ip: &str) -> Result<()> {
        self.blocklist.unblock(ip).await
    }

    /// Non-expired blocks known to this instance.
    pub fn list_blocked_ips(&self) -> Vec<BlockedIp> {
        self.blocklist.list()
    }

    /// Delete every window counter scoped to one account. With an org id,
    /// that org's counters are cleared as well. Returns the number of keys
    /// removed.
    pub async fn reset_user_limits(&self, user_id: &str, org_id: Option<&str>) -> Result<u64> {
        if user_id.is_empty() {
            return Err(BreakwaterError::Validation(
                "user id must not be empty".to_string(),
            ));
        }

        let mut removed = self.delete_counters_for(user_id).await?;
        if let Some(org) = org_id {
            removed += self.delete_counters_for(org).await?;
        }
        info!(user_id = %user_id, org_id = ?org_id, removed = removed, "User limits reset");
        Ok(removed)
    }

    async fn delete_counters_for(&self, value: &str) -> Result<u64> {
        // The glob narrows the candidates; the segment check anchors the
        // match to the identifier-value position, so a value that also
        // appears as a kind segment or inside an endpoint is not swept.
        let pattern = format!("{}rate_limit:*:{}:*", self.key_prefix, value);
        let outcome = self
            .breaker
            .call(|| async {
                let keys = self.store.scan_matching(&pattern).await?;
                let mut removed = 0u64;
                for key in keys {
                    let mut segments = key.rsplit(':');
                    let _bucket = segments.next();
                    if segments.next() == Some(value) {
                        self.store.delete(&key).await?;
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await;
        match outcome {
            CallOutcome::Success(n) => Ok(n),
            CallOutcome::Failed | CallOutcome::ShortCircuited => Err(
                BreakwaterError::StoreUnavailable("counter reset failed".to_string()),
            ),
        }
    }

    /// Delete every window counter. Blocks survive. Requires the configured
    /// confirmation token; unsafe under heavy write concurrency since the
    /// scan and the deletes are not one atomic step.
    pub async fn reset_all_limits(&self, confirmation: &str) -> Result<u64> {
        if confirmation != self.reset_confirmation_token {
            return Err(BreakwaterError::ConfirmationRequired(
                "reset_all_limits requires the configured confirmation token".to_string(),
            ));
        }

        let pattern = format!("{}rate_limit:*", self.key_prefix);
        match self
            .breaker
            .call(|| async { self.store.delete_matching(&pattern).await })
            .await
        {
            CallOutcome::Success(removed) => {
                warn!(removed = removed, "All rate limit counters reset");
                Ok(removed)
            }
            CallOutcome::Failed | CallOutcome::ShortCircuited => Err(
                BreakwaterError::StoreUnavailable("counter reset failed".to_string()),
            ),
        }
    }

    /// Engine statistics snapshot.
    pub fn get_statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Composite health: breaker Open is critical; half-open or active
    /// emergency limits are degraded.
    pub fn get_health_status(&self) -> HealthStatus {
        match self.breaker.state() {
            BreakerState::Open => HealthStatus::Critical,
            BreakerState::HalfOpen => HealthStatus::Degraded,
            BreakerState::Closed => {
                if self.emergency.is_active() {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }

    /// Force the circuit breaker open, e.g. on a suspected store
    /// compromise.
    pub fn activate_circuit_breaker(&self, reason: Option<&str>) {
        self.breaker
            .force_open(reason.unwrap_or("manual activation"));
    }

    /// Read-only breaker view.
    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Manually activate the emergency limit profile.
    pub fn activate_emergency_limits(&self, reason: &str, duration_ms: Option<u64>) {
        self.emergency.activate(reason, duration_ms, true);
    }

    /// Manually deactivate the emergency limit profile. Idempotent.
    pub fn deactivate_emergency_limits(&self) {
        self.emergency.deactivate("operator");
    }

    /// Whether the emergency profile is currently in effect.
    pub fn are_emergency_limits_active(&self) -> bool {
        self.emergency.is_active()
    }

    /// Read-only emergency state.
    pub fn emergency_snapshot(&self) -> EmergencySnapshot {
        self.emergency.snapshot()
    }

    /// The configured DDoS thresholds.
    pub fn ddos_thresholds(&self) -> &DdosConfig {
        self.detector.thresholds()
    }

    /// Assign an account to a plan tier.
    pub fn assign_plan(&self, account: &str, plan_name: &str) -> Result<()> {
        self.plans.assign(account, plan_name)
    }

    /// Drop an account back to default limits.
    pub fn unassign_plan(&self, account: &str) -> Result<()> {
        self.plans.unassign(account)
    }

    /// Tracked accounts per plan tier.
    pub fn get_plan_distribution(&self) -> std::collections::HashMap<String, usize> {
        self.plans.distribution()
    }

    /// The configured plans.
    pub fn plans(&self) -> Vec<Arc<Plan>> {
        self.plans.plans()
    }

    /// The current normal-profile rules.
    pub fn rules(&self) -> Vec<RateLimitRule> {
        self.rules.snapshot().rules()
    }

    /// The configured emergency overrides.
    pub fn emergency_rules(&self) -> Vec<RateLimitRule> {
        self.rules.snapshot().emergency_rules()
    }

    /// Start the background DDoS detector. Abort the handle to stop it.
    pub fn spawn_detector(&self) -> tokio::task::JoinHandle<()> {
        self.detector.clone().run()
    }
}
