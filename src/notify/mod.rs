//! Outbound alert delivery.
//!
//! [`AlertDispatcher`] pairs a [`Notifier`] with the TTL deduplicator so each
//! distinct alert reaches the channel at most once per cooldown. Delivery
//! failures are logged and never propagate into the snapshot path.

pub mod slack;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::detect::dedup::AlertDeduplicator;
use crate::detect::Alert;
use crate::snapshot::Kpis;

pub use slack::SlackNotifier;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook rejected both payload formats: {0}")]
    Rejected(String),
}

/// A channel that can carry one alert at a time.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert, summary: Option<&str>, kpis: &Kpis) -> Result<(), NotifyError>;
}

pub struct AlertDispatcher {
    dedup: AlertDeduplicator,
    notifier: Arc<dyn Notifier>,
}

impl AlertDispatcher {
    pub fn new(dedup: AlertDeduplicator, notifier: Arc<dyn Notifier>) -> Self {
        Self { dedup, notifier }
    }

    pub fn dedup(&self) -> &AlertDeduplicator {
        &self.dedup
    }

    /// Send every alert not currently cooling down. Returns how many were
    /// accepted by the notifier.
    pub async fn dispatch(
        &self,
        alerts: &[Alert],
        summary: Option<&str>,
        kpis: &Kpis,
        now: DateTime<Utc>,
    ) -> usize {
        let mut delivered = 0;
        for alert in alerts {
            if !self.dedup.should_deliver(alert, now) {
                continue;
            }
            match self.notifier.notify(alert, summary, kpis).await {
                Ok(()) => {
                    info!(id = %alert.id, severity = %alert.severity, kind = %alert.kind, "alert delivered");
                    delivered += 1;
                }
                Err(e) => {
                    // The key stays recorded so a broken webhook is not hammered every poll.
                    warn!(id = %alert.id, error = %e, "alert delivery failed");
                }
            }
        }
        delivered
    }
}
