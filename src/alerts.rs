//! Outbound alert channel.
//!
//! Alerts are best effort: dispatch is spawned off the caller's path with a
//! bounded timeout, and a failed or slow channel is logged, never propagated
//! as a request failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// The circuit breaker entered Open from failures.
    BreakerTripped,
    /// An operator forced the breaker Open.
    BreakerForcedOpen,
    /// Emergency limits were activated.
    EmergencyActivated,
    /// Emergency limits were deactivated.
    EmergencyDeactivated,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::BreakerTripped => "breaker_tripped",
            AlertKind::BreakerForcedOpen => "breaker_forced_open",
            AlertKind::EmergencyActivated => "emergency_activated",
            AlertKind::EmergencyDeactivated => "emergency_deactivated",
        }
    }
}

/// One outbound notification.
#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Trait for alert channels (log, webhook, email, ...).
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Deliver one alert. Errors are reported back to the dispatcher,
    /// which logs and drops them.
    async fn notify(&self, alert: Alert) -> std::result::Result<(), String>;
}

/// Default channel: emits alerts into the tracing log.
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    async fn notify(&self, alert: Alert) -> std::result::Result<(), String> {
        info!(
            kind = alert.kind.as_str(),
            reason = %alert.reason,
            at = %alert.at,
            "Alert"
        );
        Ok(())
    }
}

/// Fire-and-forget dispatch with a hard delivery bound. Callable from
/// sync paths too: without a runtime the alert is logged instead of
/// delivered.
pub fn dispatch(channel: Arc<dyn AlertChannel>, alert: Alert, timeout: Duration) {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            info!(
                kind = alert.kind.as_str(),
                reason = %alert.reason,
                "Alert (no async runtime, logged only)"
            );
            return;
        }
    };
    handle.spawn(async move {
        let kind = alert.kind;
        match tokio::time::timeout(timeout, channel.notify(alert)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(kind = kind.as_str(), error = %e, "Alert delivery failed");
            }
            Err(_) => {
                warn!(kind = kind.as_str(), "Alert delivery timed out");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel {
        delivered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AlertChannel for CountingChannel {
        async fn notify(&self, _alert: Alert) -> std::result::Result<(), String> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingChannel;

    #[async_trait]
    impl AlertChannel for FailingChannel {
        async fn notify(&self, _alert: Alert) -> std::result::Result<(), String> {
            Err("unreachable".to_string())
        }
    }

    #[tokio::test]
    async fn test_dispatch_delivers() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let channel = Arc::new(CountingChannel {
            delivered: delivered.clone(),
        });

        dispatch(
            channel,
            Alert::new(AlertKind::BreakerTripped, "threshold reached"),
            Duration::from_millis(200),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_without_runtime_does_not_panic() {
        dispatch(
            Arc::new(FailingChannel),
            Alert::new(AlertKind::BreakerForcedOpen, "operator"),
            Duration::from_millis(50),
        );
    }

    #[tokio::test]
    async fn test_dispatch_absorbs_failure() {
        // Must not panic or propagate.
        dispatch(
            Arc::new(FailingChannel),
            Alert::new(AlertKind::EmergencyActivated, "attack pattern"),
            Duration::from_millis(50),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
    }
}
