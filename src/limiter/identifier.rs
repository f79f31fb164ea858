//! Request identifiers and counter key layout.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// The kind of limit a rule applies to. Doubles as the tag of the
/// identifier the limit is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Ip,
    User,
    Email,
    Token,
}

impl LimitKind {
    /// Stable string form used in counter keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Ip => "ip",
            LimitKind::User => "user",
            LimitKind::Email => "email",
            LimitKind::Token => "token",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single identifier carried by a request. Each identifier on a request
/// is rate limited independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Identifier {
    Ip(String),
    User(String),
    Email(String),
    Token(String),
}

impl Identifier {
    /// The limit kind this identifier is evaluated under.
    pub fn kind(&self) -> LimitKind {
        match self {
            Identifier::Ip(_) => LimitKind::Ip,
            Identifier::User(_) => LimitKind::User,
            Identifier::Email(_) => LimitKind::Email,
            Identifier::Token(_) => LimitKind::Token,
        }
    }

    /// The raw identifier value.
    pub fn value(&self) -> &str {
        match self {
            Identifier::Ip(v)
            | Identifier::User(v)
            | Identifier::Email(v)
            | Identifier::Token(v) => v,
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The fixed-window bucket a timestamp falls into.
pub fn bucket_for(now_ms: u64, window_ms: u64) -> u64 {
    now_ms / window_ms.max(1)
}

/// Epoch milliseconds at which a bucket's window ends.
pub fn bucket_end_ms(bucket: u64, window_ms: u64) -> u64 {
    (bucket + 1) * window_ms.max(1)
}

/// Counter key for one (endpoint, kind, identifier, bucket) cell.
///
/// Layout: `{prefix}rate_limit:{endpoint}:{kind}:{id_type}:{id_value}:{bucket}`
pub fn counter_key(
    prefix: &str,
    endpoint: &str,
    kind: LimitKind,
    identifier: &Identifier,
    bucket: u64,
) -> String {
    format!(
        "{}rate_limit:{}:{}:{}:{}:{}",
        prefix,
        endpoint,
        kind.as_str(),
        identifier.kind().as_str(),
        identifier.value(),
        bucket
    )
}

/// Key a blocklist entry is persisted under.
pub fn blocked_ip_key(prefix: &str, ip: &str) -> String {
    format!("{}blocked_ip:{}", prefix, ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_kind_and_value() {
        let id = Identifier::User("u-42".to_string());
        assert_eq!(id.kind(), LimitKind::User);
        assert_eq!(id.value(), "u-42");
        assert_eq!(id.to_string(), "user:u-42");
    }

    #[test]
    fn test_counter_key_layout() {
        let id = Identifier::Ip("9.9.9.9".to_string());
        let key = counter_key("bw:", "/api/login", LimitKind::Ip, &id, 12345);
        assert_eq!(key, "bw:rate_limit:/api/login:ip:ip:9.9.9.9:12345");
    }

    #[test]
    fn test_bucket_boundaries_are_independent() {
        let window = 60_000;
        let bucket_start = 1_700_000_040_000u64 / window * window;

        // One millisecond before the window ends and one after belong to
        // different buckets.
        let before = bucket_for(bucket_start + window - 1, window);
        let after = bucket_for(bucket_start + window + 1, window);
        assert_eq!(before + 1, after);
    }

    #[test]
    fn test_bucket_end() {
        let window = 60_000;
        let now = 1_700_000_040_123u64;
        let bucket = bucket_for(now, window);
        let end = bucket_end_ms(bucket, window);
        assert!(end > now);
        assert!(end - now <= window);
        assert_eq!(end % window, 0);
    }

    #[test]
    fn test_limit_kind_serde_form() {
        let yaml = "user";
        let kind: LimitKind = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(kind, LimitKind::User);
        assert_eq!(kind.as_str(), "user");
    }
}
