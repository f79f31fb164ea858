//! Rate limiting logic and shared limiter state.

mod blocklist;
mod evaluator;
mod identifier;
mod plans;
mod rules;

pub use blocklist::{BlockedIp, BlocklistConfig, IpBlocklist};
pub use evaluator::{Decision, DecisionReason, LimitStatus, RateLimitEvaluator};
pub use identifier::{
    blocked_ip_key, bucket_end_ms, bucket_for, counter_key, now_ms, Identifier, LimitKind,
};
pub use plans::{Plan, PlanResolver};
pub use rules::{
    LimitProfile, LimitSource, LimitsConfig, RateLimitRule, ResolvedLimit, RuleSet, RuleTable,
};
