//! TTL'd IP blocklist.
//!
//! Entries are persisted in the counter store under
//! `{prefix}blocked_ip:{ip}` and mirrored in a local cache. A non-expired
//! entry suppresses all evaluation for that IP; no counter is incremented.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::identifier::blocked_ip_key;
use crate::breaker::{CallOutcome, CircuitBreaker};
use crate::error::{BreakwaterError, Result};
use crate::store::CounterStore;

/// Blocklist configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistConfig {
    /// Policy floor for block durations, in ms. Blocks shorter than this
    /// are rejected before any state mutation.
    #[serde(default = "default_min_block_ms")]
    pub min_block_ms: u64,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            min_block_ms: default_min_block_ms(),
        }
    }
}

fn default_min_block_ms() -> u64 {
    60_000
}

/// One blocked IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedIp {
    pub id: Uuid,
    pub ip: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BlockedIp {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// The blocklist. Writes go to the store first (so peers sharing the store
/// see them) and to the local cache; reads hit the cache and fall through
/// to the store on miss.
pub struct IpBlocklist {
    store: Arc<dyn CounterStore>,
    breaker: Arc<CircuitBreaker>,
    cache: DashMap<String, BlockedIp>,
    config: BlocklistConfig,
    key_prefix: String,
}

impl IpBlocklist {
    pub fn new(
        store: Arc<dyn CounterStore>,
        breaker: Arc<CircuitBreaker>,
        config: BlocklistConfig,
        key_prefix: String,
    ) -> Self {
        Self {
            store,
            breaker,
            cache: DashMap::new(),
            config,
            key_prefix,
        }
    }

    /// Insert or overwrite a block for `duration_ms`, with an optional
    /// reason. Rejects durations below the policy floor.
    pub async fn block(
        &self,
        ip: &str,
        duration_ms: u64,
        reason: Option<&str>,
    ) -> Result<BlockedIp> {
        if ip.is_empty() {
            return Err(BreakwaterError::Validation(
                "ip must not be empty".to_string(),
            ));
        }
        if duration_ms < self.config.min_block_ms {
            return Err(BreakwaterError::Validation(format!(
                "block duration {}ms is below the {}ms policy floor",
                duration_ms, self.config.min_block_ms
            )));
        }

        let now = Utc::now();
        let entry = BlockedIp {
            id: Uuid::new_v4(),
            ip: ip.to_string(),
            reason: reason.unwrap_or("manual block").to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::milliseconds(duration_ms as i64),
        };

        let key = blocked_ip_key(&self.key_prefix, ip);
        let json = serde_json::to_string(&entry)
            .map_err(|e| BreakwaterError::Validation(format!("unencodable block entry: {}", e)))?;

        let outcome = self
            .breaker
            .call(|| async { self.store.set(&key, &json, duration_ms).await })
            .await;
        if !matches!(outcome, CallOutcome::Success(())) {
            // An enforced-locally block is strictly safer than no block.
            warn!(ip = %ip, "Blocklist store write failed, block enforced locally only");
        }

        self.cache.insert(ip.to_string(), entry.clone());
        info!(
            ip = %ip,
            reason = %entry.reason,
            expires_at = %entry.expires_at,
            block_id = %entry.id,
            "IP blocked"
        );
        Ok(entry)
    }

    /// Remove a block immediately, regardless of remaining TTL.
    pub async fn unblock(&self, ip: &str) -> Result<()> {
        let known_locally = self.cache.remove(ip).is_some();
        let key = blocked_ip_key(&self.key_prefix, ip);

        let outcome = self
            .breaker
            .call(|| async {
                let existed = self.store.exists(&key).await?;
                if existed {
                    self.store.delete(&key).await?;
                }
                Ok(existed)
            })
            .await;

        match outcome {
            CallOutcome::Success(existed) => {
                if existed || known_locally {
                    info!(ip = %ip, "IP unblocked");
                    Ok(())
                } else {
                    Err(BreakwaterError::NotFound(format!("{} is not blocked", ip)))
                }
            }
            CallOutcome::Failed | CallOutcome::ShortCircuited => {
                if known_locally {
                    warn!(ip = %ip, "Blocklist store delete failed, local entry removed");
                    Ok(())
                } else {
                    Err(BreakwaterError::StoreUnavailable(
                        "cannot verify block entry".to_string(),
                    ))
                }
            }
        }
    }

    /// Whether an IP is currently blocked. Cache first; a miss falls
    /// through to the store so blocks written by peers are honored. Store
    /// unavailability surfaces as `StoreUnavailable` for the evaluator to
    /// resolve per the fail policy.
    pub async fn check(&self, ip: &str) -> Result<Option<BlockedIp>> {
        if let Some(entry) = self.cache.get(ip) {
            if !entry.is_expired() {
                return Ok(Some(entry.clone()));
            }
        }
        self.cache.remove_if(ip, |_, entry| entry.is_expired());

        let key = blocked_ip_key(&self.key_prefix, ip);
        let outcome = self
            .breaker
            .call(|| async { self.store.get(&key).await })
            .await;

        match outcome {
            CallOutcome::Success(Some(json)) => match serde_json::from_str::<BlockedIp>(&json) {
                Ok(entry) if !entry.is_expired() => {
                    self.cache.insert(ip.to_string(), entry.clone());
                    Ok(Some(entry))
                }
                Ok(_) => Ok(None),
                Err(e) => {
                    warn!(ip = %ip, error = %e, "Undecodable blocklist entry ignored");
                    Ok(None)
                }
            },
            CallOutcome::Success(None) => Ok(None),
            CallOutcome::Failed | CallOutcome::ShortCircuited => Err(
                BreakwaterError::StoreUnavailable("blocklist check failed".to_string()),
            ),
        }
    }

    /// Non-expired entries known to this instance.
    pub fn list(&self) -> Vec<BlockedIp> {
        self.cache.retain(|_, entry| !entry.is_expired());
        self.cache.iter().map(|e| e.value().clone()).collect()
    }
}
