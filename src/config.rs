//! Configuration management for Breakwater.

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::ddos::DdosConfig;
use crate::error::{BreakwaterError, Result};
use crate::limiter::{BlocklistConfig, LimitsConfig, Plan};

/// Main configuration for the Breakwater engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakwaterConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// IP blocklist configuration
    #[serde(default)]
    pub blocklist: BlocklistConfig,

    /// Rate limit rules, defaults, and the emergency profile
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Subscription plan tiers
    #[serde(default)]
    pub plans: Vec<Plan>,

    /// DDoS detector thresholds
    #[serde(default)]
    pub ddos: DdosConfig,

    /// Administrative policy
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL. When absent, the in-memory backend is used.
    pub redis_url: Option<String>,

    /// Prefix prepended to every persisted key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-call timeout for store operations, in ms.
    #[serde(default = "default_store_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            call_timeout_ms: default_store_call_timeout_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "bw:".to_string()
}

fn default_store_call_timeout_ms() -> u64 {
    2_000
}

/// Administrative policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Token required by the bulk `reset_all_limits` operation.
    #[serde(default = "default_reset_confirmation_token")]
    pub reset_confirmation_token: String,

    /// Hard deadline for one evaluation, in ms. Exceeding it is treated
    /// as a breaker failure and resolved per the fail policy.
    #[serde(default = "default_evaluation_deadline_ms")]
    pub evaluation_deadline_ms: u64,

    /// Delivery bound for outbound alerts, in ms.
    #[serde(default = "default_alert_timeout_ms")]
    pub alert_timeout_ms: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            reset_confirmation_token: default_reset_confirmation_token(),
            evaluation_deadline_ms: default_evaluation_deadline_ms(),
            alert_timeout_ms: default_alert_timeout_ms(),
        }
    }
}

fn default_reset_confirmation_token() -> String {
    "RESET_ALL_LIMITS".to_string()
}

fn default_evaluation_deadline_ms() -> u64 {
    5_000
}

fn default_alert_timeout_ms() -> u64 {
    2_000
}

impl BreakwaterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BreakwaterConfig = serde_yaml::from_str(&contents)
            .map_err(|e| BreakwaterError::Config(e.to_string()))?;
        Ok(config)
    }
}
