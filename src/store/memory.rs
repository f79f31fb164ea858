//! In-memory counter store for tests and single-instance deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{glob_match, CounterStore, WindowHit};
use crate::error::Result;
use crate::limiter::{bucket_end_ms, bucket_for, now_ms};

#[derive(Debug, Clone)]
enum EntryData {
    Counter(u64),
    Value(String),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    data: EntryData,
    expires_at_ms: u64,
}

impl MemoryEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at_ms <= now
    }
}

/// In-memory `CounterStore` backend. Entries expire lazily on access;
/// `purge_expired` sweeps the rest.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let now = now_ms();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = now_ms();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window_ms: u64) -> Result<WindowHit> {
        let now = now_ms();
        let expires_at_ms = bucket_end_ms(bucket_for(now, window_ms), window_ms);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                data: EntryData::Counter(0),
                expires_at_ms,
            });

        if entry.is_expired(now) {
            *entry = MemoryEntry {
                data: EntryData::Counter(0),
                expires_at_ms,
            };
        }

        let count = match &mut entry.data {
            EntryData::Counter(c) => {
                *c += 1;
                *c
            }
            // A non-counter value under a counter key is stale; replace it.
            EntryData::Value(_) => {
                entry.data = EntryData::Counter(1);
                entry.expires_at_ms = expires_at_ms;
                1
            }
        };

        Ok(WindowHit {
            count,
            expires_at_ms: entry.expires_at_ms,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = now_ms();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(Some(match &entry.data {
                EntryData::Counter(c) => c.to_string(),
                EntryData::Value(v) => v.clone(),
            })),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                data: EntryData::Value(value.to_string()),
                expires_at_ms: now_ms() + ttl_ms,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let matched: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut deleted = 0u64;
        for key in matched {
            if self.entries.remove(&key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn scan_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let now = now_ms();
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now) && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_counts_up() {
        let store = MemoryStore::new();

        let first = store.increment("k", 60_000).await.unwrap();
        let second = store.increment("k", 60_000).await.unwrap();

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(first.expires_at_ms, second.expires_at_ms);
        assert!(first.expires_at_ms > now_ms());
    }

    #[tokio::test]
    async fn test_get_reads_counter_as_decimal() {
        let store = MemoryStore::new();
        store.increment("k", 60_000).await.unwrap();
        store.increment("k", 60_000).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some("2".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_get_delete_roundtrip() {
        let store = MemoryStore::new();
        store.set("block", "{\"ip\":\"1.2.3.4\"}", 60_000).await.unwrap();

        assert!(store.exists("block").await.unwrap());
        store.delete("block").await.unwrap();
        assert!(!store.exists("block").await.unwrap());
    }

    #[tokio::test]
    async fn test_value_expires() {
        let store = MemoryStore::new();
        store.set("short", "v", 10).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(store.get("short").await.unwrap(), None);

        store.purge_expired();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_matching_scopes_to_pattern() {
        let store = MemoryStore::new();
        store.increment("bw:rate_limit:/a:user:user:u1:1", 60_000).await.unwrap();
        store.increment("bw:rate_limit:/b:user:user:u1:1", 60_000).await.unwrap();
        store.increment("bw:rate_limit:/a:user:user:u2:1", 60_000).await.unwrap();

        let deleted = store.delete_matching("bw:rate_limit:*:u1:*").await.unwrap();

        assert_eq!(deleted, 2);
        assert!(store.get("bw:rate_limit:/a:user:user:u2:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scan_matching_lists_live_keys() {
        let store = MemoryStore::new();
        store.increment("bw:rate_limit:/a:user:user:u1:1", 60_000).await.unwrap();
        store.set("bw:blocked_ip:9.9.9.9", "{}", 60_000).await.unwrap();
        store.set("bw:rate_limit:stale", "v", 10).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let keys = store.scan_matching("bw:rate_limit:*").await.unwrap();
        assert_eq!(keys, vec!["bw:rate_limit:/a:user:user:u1:1".to_string()]);
    }
}
