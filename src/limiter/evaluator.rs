//! The admission decision core.
//!
//! Combines blocklist, plan overrides, emergency profile, and per-pair
//! window counters into one admit/reject verdict. Most restrictive wins:
//! every (identifier, kind) pair must be within its limit.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::debug;

use super::blocklist::IpBlocklist;
use super::identifier::{bucket_end_ms, bucket_for, counter_key, now_ms, Identifier, LimitKind};
use super::plans::PlanResolver;
use super::rules::{ResolvedLimit, RuleTable};
use crate::breaker::{CallOutcome, CircuitBreaker, FailPolicy};
use crate::ddos::EmergencyController;
use crate::error::{BreakwaterError, Result};
use crate::stats::Statistics;
use crate::store::CounterStore;

/// Why a request was admitted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Within every applicable limit.
    Admitted,
    /// The source IP carries a non-expired block.
    Blocked,
    /// At least one (identifier, kind) pair exceeded its limit.
    OverLimit,
    /// The store could not answer and the fail policy decided.
    StoreUnavailable,
}

/// The verdict for one request.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
    /// Tightest remaining quota across the evaluated pairs. Absent when
    /// the store could not report counts.
    pub remaining: Option<u64>,
    /// How long a rejected caller must wait to satisfy the tightest
    /// limiter, in ms.
    pub retry_after_ms: Option<u64>,
    /// True when the decision was made under a degraded store per the
    /// fail policy rather than from real counts.
    pub degraded: bool,
}

impl Decision {
    pub(crate) fn admitted(remaining: Option<u64>, degraded: bool) -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::Admitted,
            remaining,
            retry_after_ms: None,
            degraded,
        }
    }

    pub(crate) fn rejected(reason: DecisionReason, retry_after_ms: Option<u64>, degraded: bool) -> Self {
        Self {
            allowed: false,
            reason,
            remaining: Some(0),
            retry_after_ms,
            degraded,
        }
    }
}

/// Read-only view of one pair's current window, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct LimitStatus {
    pub identifier: Identifier,
    pub kind: LimitKind,
    pub max: u64,
    pub window_ms: u64,
    pub count: u64,
    pub remaining: u64,
    pub resets_in_ms: u64,
}

/// The rate limit evaluator. Shared by every concurrent evaluation; all
/// mutable state lives in the injected components.
pub struct RateLimitEvaluator {
    store: Arc<dyn CounterStore>,
    breaker: Arc<CircuitBreaker>,
    blocklist: Arc<IpBlocklist>,
    plans: Arc<PlanResolver>,
    rules: Arc<RuleTable>,
    emergency: Arc<EmergencyController>,
    stats: Arc<Statistics>,
    key_prefix: String,
}

struct Pair {
    identifier: Identifier,
    limit: ResolvedLimit,
    key: String,
}

enum PairOutcome {
    Within { remaining: u64 },
    Exceeded { retry_after_ms: u64 },
    Degraded,
}

impl RateLimitEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CounterStore>,
        breaker: Arc<CircuitBreaker>,
        blocklist: Arc<IpBlocklist>,
        plans: Arc<PlanResolver>,
        rules: Arc<RuleTable>,
        emergency: Arc<EmergencyController>,
        stats: Arc<Statistics>,
        key_prefix: String,
    ) -> Self {
        Self {
            store,
            breaker,
            blocklist,
            plans,
            rules,
            emergency,
            stats,
            key_prefix,
        }
    }

    /// Evaluate one request. Store errors never escape; they are resolved
    /// into a decision per the configured fail policy.
    pub async fn evaluate(&self, endpoint: &str, identifiers: &[Identifier]) -> Decision {
        let mut degraded = false;

        // Blocklist first: a block is definitive and quota-independent.
        for identifier in identifiers {
            if let Identifier::Ip(ip) = identifier {
                match self.blocklist.check(ip).await {
                    Ok(Some(entry)) => {
                        debug!(ip = %ip, reason = %entry.reason, "Request rejected, IP blocked");
                        self.stats.record_blocked();
                        let retry = (entry.expires_at - chrono::Utc::now())
                            .num_milliseconds()
                            .max(0) as u64;
                        return Decision::rejected(DecisionReason::Blocked, Some(retry), false);
                    }
                    Ok(None) => {}
                    Err(_) => match self.breaker.fail_policy() {
                        FailPolicy::Closed => {
                            self.stats.record_blocked();
                            return Decision::rejected(
                                DecisionReason::StoreUnavailable,
                                None,
                                true,
                            );
                        }
                        FailPolicy::Open => {
                            degraded = true;
                        }
                    },
                }
            }
        }

        let rules = self.rules.snapshot();
        let emergency_active = self.emergency.is_active();
        let now = now_ms();

        let pairs: Vec<Pair> = identifiers
            .iter()
            .map(|identifier| {
                let kind = identifier.kind();
                let plan_limit = self
                    .plans
                    .resolve(identifier)
                    .and_then(|plan| PlanResolver::plan_limit(&plan, kind));
                let limit = rules.effective(endpoint, kind, emergency_active, plan_limit);
                let bucket = bucket_for(now, limit.window_ms);
                let key = counter_key(&self.key_prefix, endpoint, kind, identifier, bucket);
                Pair {
                    identifier: identifier.clone(),
                    limit,
                    key,
                }
            })
            .collect();

        // Increments are not rolled back on rejection: the count reflects
        // attempted traffic, which is the signal abuse detection needs.
        let outcomes = join_all(pairs.iter().map(|pair| self.charge(pair, now))).await;

        let mut min_remaining: Option<u64> = None;
        let mut max_retry_after: Option<u64> = None;
        let mut over_limit = false;
        let mut degraded_reject = false;

        for (pair, outcome) in pairs.iter().zip(outcomes) {
            match outcome {
                PairOutcome::Within { remaining } => {
                    min_remaining = Some(min_remaining.map_or(remaining, |m| m.min(remaining)));
                }
                PairOutcome::Exceeded { retry_after_ms } => {
                    debug!(
                        identifier = %pair.identifier,
                        endpoint = %endpoint,
                        max = pair.limit.max,
                        source = ?pair.limit.source,
                        "Limit exceeded"
                    );
                    over_limit = true;
                    max_retry_after =
                        Some(max_retry_after.map_or(retry_after_ms, |m| m.max(retry_after_ms)));
                }
                PairOutcome::Degraded => match self.breaker.fail_policy() {
                    FailPolicy::Open => {
                        degraded = true;
                    }
                    FailPolicy::Closed => {
                        degraded = true;
                        degraded_reject = true;
                        // The real reset time is unknown; assume the worst
                        // case of a full window.
                        let retry = pair.limit.window_ms
                            - (now - bucket_for(now, pair.limit.window_ms) * pair.limit.window_ms);
                        max_retry_after = Some(max_retry_after.map_or(retry, |m| m.max(retry)));
                    }
                },
            }
        }

        if over_limit || degraded_reject {
            self.stats.record_blocked();
            let reason = if over_limit {
                DecisionReason::OverLimit
            } else {
                DecisionReason::StoreUnavailable
            };
            Decision::rejected(reason, max_retry_after, degraded)
        } else {
            self.stats.record_allowed();
            Decision::admitted(min_remaining, degraded)
        }
    }

    async fn charge(&self, pair: &Pair, now: u64) -> PairOutcome {
        let window_ms = pair.limit.window_ms;
        let key = pair.key.clone();
        let outcome = self
            .breaker
            .call(|| async move { self.store.increment(&key, window_ms).await })
            .await;

        match outcome {
            CallOutcome::Success(hit) => {
                if hit.count <= pair.limit.max {
                    PairOutcome::Within {
                        remaining: pair.limit.max - hit.count,
                    }
                } else {
                    PairOutcome::Exceeded {
                        retry_after_ms: hit.expires_at_ms.saturating_sub(now),
                    }
                }
            }
            CallOutcome::Failed | CallOutcome::ShortCircuited => PairOutcome::Degraded,
        }
    }

    /// Current counts for a request's pairs without incrementing anything.
    pub async fn status(
        &self,
        endpoint: &str,
        identifiers: &[Identifier],
    ) -> Result<Vec<LimitStatus>> {
        let rules = self.rules.snapshot();
        let emergency_active = self.emergency.is_active();
        let now = now_ms();

        let mut statuses = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            let kind = identifier.kind();
            let plan_limit = self
                .plans
                .resolve(identifier)
                .and_then(|plan| PlanResolver::plan_limit(&plan, kind));
            let limit = rules.effective(endpoint, kind, emergency_active, plan_limit);
            let bucket = bucket_for(now, limit.window_ms);
            let key = counter_key(&self.key_prefix, endpoint, kind, identifier, bucket);

            let outcome = self.breaker.call(|| async { self.store.get(&key).await }).await;
            let count = match outcome {
                CallOutcome::Success(value) => value
                    .as_deref()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0),
                CallOutcome::Failed | CallOutcome::ShortCircuited => {
                    return Err(BreakwaterError::StoreUnavailable(
                        "status query failed".to_string(),
                    ))
                }
            };

            statuses.push(LimitStatus {
                identifier: identifier.clone(),
                kind,
                max: limit.max,
                window_ms: limit.window_ms,
                count,
                remaining: limit.max.saturating_sub(count),
                resets_in_ms: bucket_end_ms(bucket, limit.window_ms).saturating_sub(now),
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogAlertChannel;
    use crate::breaker::BreakerConfig;
    use crate::limiter::blocklist::BlocklistConfig;
    use crate::limiter::plans::Plan;
    use crate::limiter::rules::{LimitProfile, LimitsConfig, RateLimitRule, RuleSet};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _: &str, _: u64) -> Result<crate::store::WindowHit> {
            Err(BreakwaterError::StoreUnavailable("down".to_string()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(BreakwaterError::StoreUnavailable("down".to_string()))
        }
        async fn set(&self, _: &str, _: &str, _: u64) -> Result<()> {
            Err(BreakwaterError::StoreUnavailable("down".to_string()))
        }
        async fn exists(&self, _: &str) -> Result<bool> {
            Err(BreakwaterError::StoreUnavailable("down".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<()> {
            Err(BreakwaterError::StoreUnavailable("down".to_string()))
        }
        async fn delete_matching(&self, _: &str) -> Result<u64> {
            Err(BreakwaterError::StoreUnavailable("down".to_string()))
        }
        async fn scan_matching(&self, _: &str) -> Result<Vec<String>> {
            Err(BreakwaterError::StoreUnavailable("down".to_string()))
        }
    }

    struct Fixture {
        evaluator: RateLimitEvaluator,
        blocklist: Arc<IpBlocklist>,
        plans: Arc<PlanResolver>,
        rules: Arc<RuleTable>,
        emergency: Arc<EmergencyController>,
        stats: Arc<Statistics>,
    }

    fn fixture_with(store: Arc<dyn CounterStore>, fail_policy: FailPolicy) -> Fixture {
        let stats = Arc::new(Statistics::new());
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 100,
                fail_policy,
                call_timeout_ms: 100,
                ..BreakerConfig::default()
            },
            stats.clone(),
            Arc::new(LogAlertChannel),
            Duration::from_millis(100),
        ));
        let blocklist = Arc::new(IpBlocklist::new(
            store.clone(),
            breaker.clone(),
            BlocklistConfig { min_block_ms: 10 },
            "bw:".to_string(),
        ));
        let plans = Arc::new(
            PlanResolver::new(vec![Plan {
                name: "premium".to_string(),
                limits: [(LimitKind::User, LimitProfile { max: 1000, window_ms: 60_000 })]
                    .into_iter()
                    .collect(),
            }])
            .unwrap(),
        );
        let limits = LimitsConfig {
            defaults: [(LimitKind::User, LimitProfile { max: 100, window_ms: 60_000 })]
                .into_iter()
                .collect(),
            rules: vec![RateLimitRule {
                endpoint: "/api/login".to_string(),
                kind: LimitKind::Ip,
                max: 5,
                window_ms: 60_000,
            }],
            emergency: vec![RateLimitRule {
                endpoint: "/api/login".to_string(),
                kind: LimitKind::Ip,
                max: 2,
                window_ms: 60_000,
            }],
        };
        let rules = Arc::new(RuleTable::new(RuleSet::from_config(&limits).unwrap()));
        let emergency = Arc::new(EmergencyController::new(
            stats.clone(),
            Arc::new(LogAlertChannel),
            Duration::from_millis(100),
            300_000,
        ));
        let evaluator = RateLimitEvaluator::new(
            store,
            breaker,
            blocklist.clone(),
            plans.clone(),
            rules.clone(),
            emergency.clone(),
            stats.clone(),
            "bw:".to_string(),
        );
        Fixture {
            evaluator,
            blocklist,
            plans,
            rules,
            emergency,
            stats,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()), FailPolicy::Open)
    }

    fn ip(addr: &str) -> Vec<Identifier> {
        vec![Identifier::Ip(addr.to_string())]
    }

    #[tokio::test]
    async fn test_window_admits_up_to_max_then_rejects() {
        let f = fixture();

        for i in 1..=5 {
            let decision = f.evaluator.evaluate("/api/login", &ip("1.2.3.4")).await;
            assert!(decision.allowed, "request {} should be admitted", i);
            assert_eq!(decision.remaining, Some(5 - i));
        }

        let decision = f.evaluator.evaluate("/api/login", &ip("1.2.3.4")).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::OverLimit);
        let retry = decision.retry_after_ms.unwrap();
        assert!(retry > 0 && retry <= 60_000);
    }

    #[tokio::test]
    async fn test_identifiers_are_limited_independently() {
        let f = fixture();

        for _ in 0..5 {
            assert!(f.evaluator.evaluate("/api/login", &ip("1.1.1.1")).await.allowed);
        }
        assert!(!f.evaluator.evaluate("/api/login", &ip("1.1.1.1")).await.allowed);

        // A different IP still has its full quota.
        assert!(f.evaluator.evaluate("/api/login", &ip("2.2.2.2")).await.allowed);
    }

    #[tokio::test]
    async fn test_blocked_ip_rejected_regardless_of_quota() {
        let f = fixture();
        f.blocklist.block("9.9.9.9", 60_000, None).await.unwrap();

        let decision = f.evaluator.evaluate("/api/login", &ip("9.9.9.9")).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Blocked);
        assert!(decision.retry_after_ms.unwrap() <= 60_000);

        // No counter was charged for the blocked request.
        let status = f
            .evaluator
            .status("/api/login", &ip("9.9.9.9"))
            .await
            .unwrap();
        assert_eq!(status[0].count, 0);

        f.blocklist.unblock("9.9.9.9").await.unwrap();
        assert!(f.evaluator.evaluate("/api/login", &ip("9.9.9.9")).await.allowed);
    }

    #[tokio::test]
    async fn test_most_restrictive_pair_wins() {
        let f = fixture();
        let both = vec![
            Identifier::Ip("3.3.3.3".to_string()),
            Identifier::User("u1".to_string()),
        ];

        // The IP rule (max 5) is tighter than the user default (max 100).
        for _ in 0..5 {
            assert!(f.evaluator.evaluate("/api/login", &both).await.allowed);
        }
        let decision = f.evaluator.evaluate("/api/login", &both).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::OverLimit);

        // The user counter was still charged on the rejected attempt.
        let status = f
            .evaluator
            .status("/api/login", &[Identifier::User("u1".to_string())])
            .await
            .unwrap();
        assert_eq!(status[0].count, 6);
    }

    #[tokio::test]
    async fn test_plan_override_loosens_user_limit() {
        let f = fixture();
        f.plans.assign("u-premium", "premium").unwrap();

        let id = vec![Identifier::User("u-premium".to_string())];
        let decision = f.evaluator.evaluate("/api/data", &id).await;
        assert!(decision.allowed);
        // Premium grants 1000, not the 100 default.
        assert_eq!(decision.remaining, Some(999));
    }

    #[tokio::test]
    async fn test_emergency_profile_tightens_until_deactivated() {
        let f = fixture();
        f.emergency.activate("attack", Some(60_000), true);

        // Emergency override: max 2 instead of 5.
        assert!(f.evaluator.evaluate("/api/login", &ip("7.7.7.7")).await.allowed);
        assert!(f.evaluator.evaluate("/api/login", &ip("7.7.7.7")).await.allowed);
        let decision = f.evaluator.evaluate("/api/login", &ip("7.7.7.7")).await;
        assert!(!decision.allowed);

        // Back to normal: the window holds 3 attempts, max is 5 again.
        f.emergency.deactivate("test");
        assert!(f.evaluator.evaluate("/api/login", &ip("7.7.7.7")).await.allowed);
    }

    #[tokio::test]
    async fn test_adjusted_rule_applies_to_next_evaluation() {
        let f = fixture();

        for _ in 0..3 {
            assert!(f.evaluator.evaluate("/api/login", &ip("4.4.4.4")).await.allowed);
        }

        // Tighten from 5 to 3: the window's accumulated count is compared
        // against the new max immediately.
        f.rules.adjust("/api/login", LimitKind::Ip, 3, 60_000).unwrap();
        assert!(!f.evaluator.evaluate("/api/login", &ip("4.4.4.4")).await.allowed);
    }

    #[tokio::test]
    async fn test_fail_open_admits_degraded() {
        let f = fixture_with(Arc::new(DownStore), FailPolicy::Open);

        let decision = f.evaluator.evaluate("/api/login", &ip("1.2.3.4")).await;
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.remaining, None);
        assert_eq!(f.stats.snapshot().allowed, 1);
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_degraded() {
        let f = fixture_with(Arc::new(DownStore), FailPolicy::Closed);

        let decision = f.evaluator.evaluate("/api/login", &ip("1.2.3.4")).await;
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.reason, DecisionReason::StoreUnavailable);
        assert_eq!(f.stats.snapshot().blocked, 1);
    }

    #[tokio::test]
    async fn test_status_reports_without_charging() {
        let f = fixture();
        f.evaluator.evaluate("/api/login", &ip("5.5.5.5")).await;
        f.evaluator.evaluate("/api/login", &ip("5.5.5.5")).await;

        let status = f.evaluator.status("/api/login", &ip("5.5.5.5")).await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].count, 2);
        assert_eq!(status[0].remaining, 3);
        assert_eq!(status[0].max, 5);
        assert!(status[0].resets_in_ms <= 60_000);

        // Querying twice does not change the count.
        let again = f.evaluator.status("/api/login", &ip("5.5.5.5")).await.unwrap();
        assert_eq!(again[0].count, 2);
    }
}
