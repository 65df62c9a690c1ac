//! Cooldown-based suppression of repeated outbound alerts.
//!
//! Only the notification side-channel consults this; snapshots returned to
//! callers always carry the full alert batch.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::detect::{Alert, AlertKind, Severity};

/// Identity of an alert for suppression purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub severity: Severity,
    pub kind: AlertKind,
    pub message: String,
}

impl From<&Alert> for DedupKey {
    fn from(alert: &Alert) -> Self {
        Self {
            severity: alert.severity,
            kind: alert.kind,
            message: alert.message.clone(),
        }
    }
}

/// Process-lifetime map of key to last delivery time.
#[derive(Debug)]
pub struct AlertDeduplicator {
    ttl: Duration,
    last_sent: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
}

impl AlertDeduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns `true` if `alert` may be delivered at `now`, and records it as
    /// sent. Returns `false` while an identical alert is cooling down.
    pub fn should_deliver(&self, alert: &Alert, now: DateTime<Utc>) -> bool {
        let key = DedupKey::from(alert);
        let mut last_sent = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);

        // Expired entries are equivalent to unseen ones; drop them to bound the map.
        let ttl = self.ttl;
        last_sent.retain(|_, sent| now - *sent < ttl);

        if let Some(sent) = last_sent.get(&key) {
            debug!(
                severity = %key.severity,
                kind = %key.kind,
                since_secs = (now - *sent).num_seconds(),
                "suppressing duplicate alert"
            );
            return false;
        }
        last_sent.insert(key, now);
        true
    }

    /// Keys currently cooling down.
    pub fn len(&self) -> usize {
        self.last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
