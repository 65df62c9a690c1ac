//! Threshold and model-score alert rules.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::analysis::TimeBucket;
use crate::config::RuleConfig;
use crate::detect::{Alert, AlertKind, Severity};

/// Evaluates the scored series. Rules are independent and both may fire;
/// the threshold rule's alert always comes first in the batch.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: RuleConfig,
    recent_buckets: usize,
}

impl RuleEngine {
    pub fn new(rules: RuleConfig, recent_buckets: usize) -> Self {
        Self {
            rules,
            recent_buckets: recent_buckets.max(1),
        }
    }

    pub fn evaluate(&self, buckets: &[TimeBucket], now: DateTime<Utc>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        alerts.extend(self.fail_rate_spike(buckets, now));
        alerts.extend(self.model_anomaly(buckets, now));
        alerts
    }

    /// CRIT when the newest bucket is busy enough and fails often enough.
    fn fail_rate_spike(&self, buckets: &[TimeBucket], now: DateTime<Utc>) -> Option<Alert> {
        let last = buckets.last()?;
        if last.attempts < self.rules.min_attempts || last.fail_rate <= self.rules.fail_rate_threshold {
            return None;
        }

        let message = format!("Fail rate {:.1}% over threshold", last.fail_rate * 100.0);
        info!(attempts = last.attempts, fail_rate = last.fail_rate, "fail-rate spike");
        Some(Alert::new(
            AlertKind::FailRateSpike,
            Severity::Critical,
            message,
            now,
            now,
        ))
    }

    /// WARN for the single highest-scored bucket among the most recent ones.
    fn model_anomaly(&self, buckets: &[TimeBucket], now: DateTime<Utc>) -> Option<Alert> {
        let recent = &buckets[buckets.len().saturating_sub(self.recent_buckets)..];
        // Ties go to the older bucket.
        let top = recent.iter().reduce(|best, b| {
            if b.anomaly_score > best.anomaly_score {
                b
            } else {
                best
            }
        })?;
        if top.anomaly_score <= self.rules.anomaly_score_cutoff {
            return None;
        }

        let message = format!("Model anomaly score {:.2}", top.anomaly_score);
        info!(bucket = %top.start, score = top.anomaly_score, "model anomaly");
        Some(Alert::new(
            AlertKind::MlAnomaly,
            Severity::Warning,
            message,
            top.start,
            now,
        ))
    }
}
