//! The per-poll output bundle handed to dashboards, the summarizer and the
//! notification sink.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analysis::{Aggregation, ChannelRollup, TimeBucket};
use crate::config::EngineConfig;
use crate::detect::Alert;

/// Headline numbers for the newest bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kpis {
    pub attempts: u64,
    pub failures: u64,
    pub fail_rate: f64,
    /// Estimated high-risk attempts among the failures, rounded half to even.
    pub high_risk: u64,
}

impl Kpis {
    fn from_bucket(bucket: &TimeBucket, high_risk_ratio: f64) -> Self {
        Self {
            attempts: bucket.attempts,
            failures: bucket.failures,
            fail_rate: bucket.fail_rate,
            high_risk: (bucket.failures as f64 * high_risk_ratio).round_ties_even().max(0.0) as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub window_minutes: i64,
    pub bucket_seconds: i64,
    pub kpis: Kpis,
    pub timeseries: Vec<TimeBucket>,
    pub by_channel: Vec<ChannelRollup>,
    /// Every alert raised by this poll, before outbound dedup.
    pub alerts: Vec<Alert>,
    /// Outlier decision threshold, when the model was fitted.
    pub model_threshold: Option<f64>,
}

impl MetricsSnapshot {
    /// Assemble the snapshot from a scored aggregation and its alert batch.
    pub fn build(
        aggregation: Aggregation,
        alerts: Vec<Alert>,
        model_threshold: Option<f64>,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let kpis = aggregation
            .buckets
            .last()
            .map(|b| Kpis::from_bucket(b, config.high_risk_ratio))
            .unwrap_or_default();

        Self {
            generated_at: now,
            window_minutes: config.window_minutes,
            bucket_seconds: config.bucket_seconds,
            kpis,
            timeseries: aggregation.buckets,
            by_channel: aggregation.channels,
            alerts,
            model_threshold,
        }
    }

    /// Copy with only the newest `points` series entries.
    pub fn truncated(&self, points: usize) -> Self {
        let skip = self.timeseries.len().saturating_sub(points);
        Self {
            timeseries: self.timeseries[skip..].to_vec(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregate;
    use crate::analysis::BucketGrid;
    use crate::events::{AttemptRecord, AttemptResult, Channel, FailReason};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap()
    }

    fn failures_now(n: usize, failed: usize) -> Vec<AttemptRecord> {
        (0..n)
            .map(|i| AttemptRecord {
                timestamp: now() - Duration::milliseconds(i as i64 * 100),
                channel: Channel::Web,
                user_hash: "h".into(),
                ip: "10.0.0.2".into(),
                user_agent: "ua".into(),
                fingerprint: "fp-2".into(),
                result: if i < failed {
                    AttemptResult::Fail
                } else {
                    AttemptResult::Success
                },
                fail_reason: if i < failed {
                    FailReason::OtpFail
                } else {
                    FailReason::None
                },
                latency_ms: 100,
            })
            .collect()
    }

    #[test]
    fn test_kpis_from_latest_bucket() {
        let cfg = EngineConfig::default();
        let grid = BucketGrid::over_window(now(), cfg.window(), cfg.bucket_width());
        let agg = aggregate(&failures_now(40, 20), &grid);

        let snap = MetricsSnapshot::build(agg, Vec::new(), None, &cfg, now());
        assert_eq!(snap.kpis.attempts, 40);
        assert_eq!(snap.kpis.failures, 20);
        assert_eq!(snap.kpis.fail_rate, 0.5);
        assert_eq!(snap.kpis.high_risk, 6);
        assert_eq!(snap.timeseries.len(), 60);
    }

    #[test]
    fn test_high_risk_rounds_half_to_even() {
        let cfg = EngineConfig::default();
        let grid = BucketGrid::over_window(now(), cfg.window(), cfg.bucket_width());
        // failures * 0.3 lands exactly on .5 for each of these.
        for (failures, expected) in [(5, 2), (15, 4), (25, 8), (35, 10)] {
            let agg = aggregate(&failures_now(failures, failures), &grid);
            let snap = MetricsSnapshot::build(agg, Vec::new(), None, &cfg, now());
            assert_eq!(snap.kpis.high_risk, expected, "{failures} failures");
        }
    }

    #[test]
    fn test_empty_window_gives_zero_kpis() {
        let cfg = EngineConfig::default();
        let agg = Aggregation {
            buckets: Vec::new(),
            channels: Vec::new(),
        };
        let snap = MetricsSnapshot::build(agg, Vec::new(), None, &cfg, now());
        assert_eq!(snap.kpis, Kpis::default());
    }

    #[test]
    fn test_truncated_keeps_newest_points() {
        let cfg = EngineConfig::default();
        let grid = BucketGrid::over_window(now(), cfg.window(), cfg.bucket_width());
        let snap = MetricsSnapshot::build(aggregate(&failures_now(3, 1), &grid), Vec::new(), None, &cfg, now());

        let short = snap.truncated(30);
        assert_eq!(short.timeseries.len(), 30);
        assert_eq!(short.timeseries.last(), snap.timeseries.last());
        assert_eq!(short.kpis, snap.kpis);
        assert_eq!(snap.truncated(500).timeseries.len(), 60);
    }

    #[test]
    fn test_wire_keys() {
        let cfg = EngineConfig::default();
        let grid = BucketGrid::over_window(now(), cfg.window(), cfg.bucket_width());
        let snap = MetricsSnapshot::build(aggregate(&failures_now(3, 1), &grid), Vec::new(), None, &cfg, now());

        let json = serde_json::to_value(&snap).unwrap();
        assert!(json["kpis"]["failRate"].is_number());
        assert!(json["kpis"]["highRisk"].is_number());
        assert!(json["timeseries"][0]["ts"].is_string());
        assert!(json["timeseries"][0]["attempts"].is_number());
        assert_eq!(json["byChannel"][0]["channel"], "WEB");
        assert!(json["byChannel"][0]["failRate"].is_number());
        assert!(json["alerts"].is_array());
    }
}
