//! Redis-backed counter store for distributed deployments.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::{CounterStore, WindowHit};
use crate::error::{BreakwaterError, Result};
use crate::limiter::{bucket_end_ms, bucket_for, now_ms};

/// Redis `CounterStore` backend.
///
/// Increments are a single atomic `INCR` + `PEXPIREAT` pipeline, so there is
/// no read-then-write race between concurrent evaluators. Every call is
/// bounded by the configured per-call timeout; a timeout surfaces as
/// `StoreUnavailable`, same as a connection failure.
pub struct RedisStore {
    manager: ConnectionManager,
    call_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a `PING`.
    pub async fn connect(url: &str, call_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BreakwaterError::Config(format!("invalid redis url: {}", e)))?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            BreakwaterError::StoreUnavailable(format!("failed to connect: {}", e))
        })?;

        let mut conn = manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| BreakwaterError::StoreUnavailable(format!("ping failed: {}", e)))?;

        debug!(url = %url, "Connected to counter store");

        Ok(Self {
            manager,
            call_timeout,
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(BreakwaterError::StoreUnavailable(format!(
                "redis error: {}",
                e
            ))),
            Err(_) => Err(BreakwaterError::StoreUnavailable(format!(
                "call timed out after {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window_ms: u64) -> Result<WindowHit> {
        let expires_at_ms = bucket_end_ms(bucket_for(now_ms(), window_ms), window_ms);
        let mut conn = self.manager.clone();

        let (count,): (u64,) = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .incr(key, 1u64)
                    .cmd("PEXPIREAT")
                    .arg(key)
                    .arg(expires_at_ms)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;

        Ok(WindowHit {
            count,
            expires_at_ms,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        self.bounded(redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        self.bounded(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query_async::<String>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let n: i64 = self
            .bounded(redis::cmd("EXISTS").arg(key).query_async(&mut conn))
            .await?;
        Ok(n > 0)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        self.bounded(redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn))
            .await?;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        // SCAN-then-DEL; O(n) in key count and unsafe to run under high
        // write concurrency. Admin resets only.
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(200)
                        .query_async(&mut conn),
                )
                .await?;

            if !keys.is_empty() {
                let n: u64 = self
                    .bounded(redis::cmd("DEL").arg(&keys).query_async(&mut conn))
                    .await?;
                deleted += n;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, deleted = deleted, "Prefix delete completed");
        Ok(deleted)
    }

    async fn scan_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, mut keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(200)
                        .query_async(&mut conn),
                )
                .await?;

            found.append(&mut keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(found)
    }
}
