//! Rate limit rules: normal profile, emergency profile, and per-kind
//! defaults, published as immutable snapshots behind an atomic swap.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::identifier::LimitKind;
use crate::error::{BreakwaterError, Result};

/// Fallback when nothing else matches an (endpoint, kind) pair.
const FALLBACK_MAX: u64 = 1000;
const FALLBACK_WINDOW_MS: u64 = 60_000;

/// A bare limit: max hits per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitProfile {
    pub max: u64,
    pub window_ms: u64,
}

/// One configured rule, unique per (endpoint, kind). Replaced whole on
/// adjustment, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub endpoint: String,
    pub kind: LimitKind,
    pub max: u64,
    pub window_ms: u64,
}

/// Limits section of the engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-kind defaults applied when an endpoint has no rule.
    #[serde(default)]
    pub defaults: HashMap<LimitKind, LimitProfile>,

    /// Per-endpoint rules (the normal profile).
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,

    /// Emergency overrides. Each must be strictly tighter than the normal
    /// rule or default it overrides.
    #[serde(default)]
    pub emergency: Vec<RateLimitRule>,
}

/// Where a resolved limit came from, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    Emergency,
    Plan,
    Rule,
    Default,
    Fallback,
}

/// The limit actually applied to one (identifier, kind) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimit {
    pub max: u64,
    pub window_ms: u64,
    pub source: LimitSource,
}

/// Immutable rule set snapshot.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<(String, LimitKind), RateLimitRule>,
    defaults: HashMap<LimitKind, LimitProfile>,
    emergency: HashMap<(String, LimitKind), RateLimitRule>,
}

impl RuleSet {
    /// Build and validate a rule set from configuration.
    pub fn from_config(config: &LimitsConfig) -> Result<Self> {
        let mut rules = HashMap::new();
        for rule in &config.rules {
            validate_rule(rule)?;
            let key = (rule.endpoint.clone(), rule.kind);
            if rules.insert(key, rule.clone()).is_some() {
                return Err(BreakwaterError::Validation(format!(
                    "duplicate rule for ({}, {})",
                    rule.endpoint, rule.kind
                )));
            }
        }

        let mut emergency = HashMap::new();
        for rule in &config.emergency {
            validate_rule(rule)?;
            let key = (rule.endpoint.clone(), rule.kind);
            if emergency.insert(key, rule.clone()).is_some() {
                return Err(BreakwaterError::Validation(format!(
                    "duplicate emergency override for ({}, {})",
                    rule.endpoint, rule.kind
                )));
            }
        }

        let set = Self {
            rules,
            defaults: config.defaults.clone(),
            emergency,
        };
        set.validate_emergency_profile()?;
        Ok(set)
    }

    /// Emergency overrides must be strictly tighter (lower max or shorter
    /// window) than the normal rule or default they override.
    fn validate_emergency_profile(&self) -> Result<()> {
        for ((endpoint, kind), override_rule) in &self.emergency {
            let normal = self
                .rules
                .get(&(endpoint.clone(), *kind))
                .map(|r| (r.max, r.window_ms))
                .or_else(|| self.defaults.get(kind).map(|d| (d.max, d.window_ms)));

            let (normal_max, normal_window) = normal.ok_or_else(|| {
                BreakwaterError::Validation(format!(
                    "emergency override for ({}, {}) has no normal rule or default to tighten",
                    endpoint, kind
                ))
            })?;

            let tighter = override_rule.max < normal_max || override_rule.window_ms < normal_window;
            if !tighter {
                return Err(BreakwaterError::Validation(format!(
                    "emergency override for ({}, {}) is not strictly tighter than its normal profile",
                    endpoint, kind
                )));
            }
        }
        Ok(())
    }

    /// Resolve the limit for one (endpoint, kind) pair.
    ///
    /// Precedence: emergency override (only while active) > plan override >
    /// endpoint rule > per-kind default > fallback. Emergency wins over
    /// plans: a global tightening must not be out-bid by a generous tier.
    pub fn effective(
        &self,
        endpoint: &str,
        kind: LimitKind,
        emergency_active: bool,
        plan_limit: Option<LimitProfile>,
    ) -> ResolvedLimit {
        if emergency_active {
            if let Some(rule) = self.emergency.get(&(endpoint.to_string(), kind)) {
                return ResolvedLimit {
                    max: rule.max,
                    window_ms: rule.window_ms,
                    source: LimitSource::Emergency,
                };
            }
        }

        if let Some(limit) = plan_limit {
            return ResolvedLimit {
                max: limit.max,
                window_ms: limit.window_ms,
                source: LimitSource::Plan,
            };
        }

        if let Some(rule) = self.rules.get(&(endpoint.to_string(), kind)) {
            return ResolvedLimit {
                max: rule.max,
                window_ms: rule.window_ms,
                source: LimitSource::Rule,
            };
        }

        if let Some(default) = self.defaults.get(&kind) {
            return ResolvedLimit {
                max: default.max,
                window_ms: default.window_ms,
                source: LimitSource::Default,
            };
        }

        ResolvedLimit {
            max: FALLBACK_MAX,
            window_ms: FALLBACK_WINDOW_MS,
            source: LimitSource::Fallback,
        }
    }

    /// All configured normal-profile rules.
    pub fn rules(&self) -> Vec<RateLimitRule> {
        self.rules.values().cloned().collect()
    }

    /// All configured emergency overrides.
    pub fn emergency_rules(&self) -> Vec<RateLimitRule> {
        self.emergency.values().cloned().collect()
    }
}

fn validate_rule(rule: &RateLimitRule) -> Result<()> {
    if rule.endpoint.is_empty() {
        return Err(BreakwaterError::Validation(
            "rule endpoint must not be empty".to_string(),
        ));
    }
    if rule.max == 0 {
        return Err(BreakwaterError::Validation(format!(
            "rule for ({}, {}) must allow at least one request",
            rule.endpoint, rule.kind
        )));
    }
    if rule.window_ms == 0 {
        return Err(BreakwaterError::Validation(format!(
            "rule for ({}, {}) must have a non-zero window",
            rule.endpoint, rule.kind
        )));
    }
    Ok(())
}

/// Live rule table. Readers clone the current `Arc<RuleSet>`; admin writers
/// publish a whole new snapshot, so the hot path never sees a
/// partially-updated table.
pub struct RuleTable {
    inner: RwLock<Arc<RuleSet>>,
}

impl RuleTable {
    pub fn new(set: RuleSet) -> Self {
        Self {
            inner: RwLock::new(Arc::new(set)),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.inner.read().clone()
    }

    /// Atomically replace the rule for (endpoint, kind). Takes effect on
    /// the very next evaluation; in-flight windows are compared against the
    /// new max immediately.
    pub fn adjust(
        &self,
        endpoint: &str,
        kind: LimitKind,
        max: u64,
        window_ms: u64,
    ) -> Result<RateLimitRule> {
        let rule = RateLimitRule {
            endpoint: endpoint.to_string(),
            kind,
            max,
            window_ms,
        };
        validate_rule(&rule)?;

        let mut next = (*self.snapshot()).clone();
        next.rules
            .insert((endpoint.to_string(), kind), rule.clone());
        // The adjusted rule must not invalidate the emergency profile.
        next.validate_emergency_profile()?;

        *self.inner.write() = Arc::new(next);
        info!(
            endpoint = %endpoint,
            kind = %kind,
            max = max,
            window_ms = window_ms,
            "Rate limit rule replaced"
        );
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(endpoint: &str, kind: LimitKind, max: u64, window_ms: u64) -> RateLimitRule {
        RateLimitRule {
            endpoint: endpoint.to_string(),
            kind,
            max,
            window_ms,
        }
    }

    #[test]
    fn test_parse_limits_config_yaml() {
        let yaml = r#"
defaults:
  ip: { max: 100, window_ms: 60000 }
rules:
  - { endpoint: /api/login, kind: ip, max: 5, window_ms: 60000 }
emergency:
  - { endpoint: /api/login, kind: ip, max: 2, window_ms: 60000 }
"#;
        let config: LimitsConfig = serde_yaml::from_str(yaml).unwrap();
        let set = RuleSet::from_config(&config).unwrap();

        let limit = set.effective("/api/login", LimitKind::Ip, false, None);
        assert_eq!(limit.max, 5);
        assert_eq!(limit.source, LimitSource::Rule);
    }

    #[test]
    fn test_effective_precedence() {
        let config = LimitsConfig {
            defaults: [(LimitKind::Ip, LimitProfile { max: 100, window_ms: 60_000 })]
                .into_iter()
                .collect(),
            rules: vec![rule("/a", LimitKind::Ip, 50, 60_000)],
            emergency: vec![rule("/a", LimitKind::Ip, 10, 60_000)],
        };
        let set = RuleSet::from_config(&config).unwrap();

        // Rule beats default.
        assert_eq!(set.effective("/a", LimitKind::Ip, false, None).source, LimitSource::Rule);
        // Default applies when no rule.
        assert_eq!(set.effective("/b", LimitKind::Ip, false, None).source, LimitSource::Default);
        // Fallback when nothing at all.
        assert_eq!(
            set.effective("/b", LimitKind::Email, false, None).source,
            LimitSource::Fallback
        );
        // Plan beats rule.
        let plan = LimitProfile { max: 500, window_ms: 60_000 };
        assert_eq!(
            set.effective("/a", LimitKind::Ip, false, Some(plan)).source,
            LimitSource::Plan
        );
        // Emergency beats plan while active.
        let resolved = set.effective("/a", LimitKind::Ip, true, Some(plan));
        assert_eq!(resolved.source, LimitSource::Emergency);
        assert_eq!(resolved.max, 10);
        // Emergency override ignored when inactive.
        assert_eq!(
            set.effective("/a", LimitKind::Ip, false, None).max,
            50
        );
    }

    #[test]
    fn test_emergency_must_be_tighter() {
        let config = LimitsConfig {
            defaults: HashMap::new(),
            rules: vec![rule("/a", LimitKind::Ip, 50, 60_000)],
            emergency: vec![rule("/a", LimitKind::Ip, 50, 60_000)],
        };
        assert!(matches!(
            RuleSet::from_config(&config),
            Err(BreakwaterError::Validation(_))
        ));
    }

    #[test]
    fn test_emergency_requires_normal_counterpart() {
        let config = LimitsConfig {
            defaults: HashMap::new(),
            rules: Vec::new(),
            emergency: vec![rule("/a", LimitKind::Ip, 1, 60_000)],
        };
        assert!(matches!(
            RuleSet::from_config(&config),
            Err(BreakwaterError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let config = LimitsConfig {
            defaults: HashMap::new(),
            rules: vec![
                rule("/a", LimitKind::Ip, 50, 60_000),
                rule("/a", LimitKind::Ip, 60, 60_000),
            ],
            emergency: Vec::new(),
        };
        assert!(RuleSet::from_config(&config).is_err());
    }

    #[test]
    fn test_adjust_publishes_new_snapshot() {
        let table = RuleTable::new(RuleSet::default());

        let before = table.snapshot();
        assert_eq!(before.effective("/a", LimitKind::Ip, false, None).max, FALLBACK_MAX);

        table.adjust("/a", LimitKind::Ip, 5, 60_000).unwrap();

        // Old snapshot is untouched; a fresh read sees the new rule.
        assert_eq!(before.effective("/a", LimitKind::Ip, false, None).max, FALLBACK_MAX);
        assert_eq!(table.snapshot().effective("/a", LimitKind::Ip, false, None).max, 5);
    }

    #[test]
    fn test_adjust_rejects_invalid_rule() {
        let table = RuleTable::new(RuleSet::default());
        assert!(table.adjust("/a", LimitKind::Ip, 0, 60_000).is_err());
        assert!(table.adjust("", LimitKind::Ip, 5, 60_000).is_err());
    }

    #[test]
    fn test_adjust_cannot_loosen_below_emergency() {
        let config = LimitsConfig {
            defaults: HashMap::new(),
            rules: vec![rule("/a", LimitKind::Ip, 50, 60_000)],
            emergency: vec![rule("/a", LimitKind::Ip, 10, 60_000)],
        };
        let table = RuleTable::new(RuleSet::from_config(&config).unwrap());

        // Tightening the normal rule below the emergency override would
        // leave the emergency profile looser than normal.
        assert!(table.adjust("/a", LimitKind::Ip, 5, 60_000).is_err());
        assert_eq!(table.snapshot().effective("/a", LimitKind::Ip, false, None).max, 50);
    }
}
