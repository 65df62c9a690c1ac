//! End-to-end pipeline tests over a real SQLite event log.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use loginpulse::config::{ConfigError, EngineConfig};
use loginpulse::detect::{AlertKind, Severity};
use loginpulse::engine::{EngineError, SnapshotEngine};
use loginpulse::events::{hash_user, AttemptRecord, AttemptResult, Channel, FailReason};
use loginpulse::storage::{insert_attempt, open_pool, Pool, SqliteEventStore};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap()
}

fn setup() -> (TempDir, Pool) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("events.db");
    let pool = open_pool(path.to_str().unwrap()).unwrap();
    (dir, pool)
}

fn engine(pool: &Pool) -> SnapshotEngine {
    SnapshotEngine::new(Arc::new(SqliteEventStore::new(pool.clone())), EngineConfig::default()).unwrap()
}

/// Write one minute's worth of attempts starting at `start`.
fn fill_minute(pool: &Pool, start: DateTime<Utc>, attempts: u64, failures: u64, latency_ms: u32, channel: Channel) {
    for j in 0..attempts {
        let fail = j < failures;
        let record = AttemptRecord {
            timestamp: start + Duration::milliseconds(j as i64 * 100),
            channel: channel.clone(),
            user_hash: hash_user("user@example.com"),
            ip: "10.0.0.1".into(),
            user_agent: "pipeline-test".into(),
            fingerprint: format!("fp-{}", j % 8 + 1),
            result: if fail { AttemptResult::Fail } else { AttemptResult::Success },
            fail_reason: if fail { FailReason::InvalidPw } else { FailReason::None },
            latency_ms,
        };
        insert_attempt(pool, &record).unwrap();
    }
}

/// Minute `i` of the last `n` minutes; minute `n - 1` is the bucket that holds `now()`.
fn minute(i: i64, n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() - Duration::minutes(n - 1 - i)
}

#[test]
fn test_model_spike_raises_single_warning() {
    let (_dir, pool) = setup();
    for i in 0..15 {
        let (attempts, failures, latency) = if i == 12 {
            (500, 300, 160)
        } else {
            (18 + (i * 7 % 5) as u64, 2 + (i * 2 % 3) as u64, 85 + (i * 11 % 10) as u32)
        };
        fill_minute(&pool, minute(i, 15), attempts, failures, latency, Channel::Web);
    }

    let snap = engine(&pool).snapshot_at(now()).unwrap();

    assert_eq!(snap.timeseries.len(), 60);
    assert!(snap.model_threshold.is_some());
    assert_eq!(snap.alerts.len(), 1, "alerts: {:?}", snap.alerts);
    let alert = &snap.alerts[0];
    assert_eq!(alert.kind, AlertKind::MlAnomaly);
    assert_eq!(alert.severity, Severity::Warning);
    assert_eq!(alert.time, minute(12, 15));
    assert!(alert.message.starts_with("Model anomaly score "));

    let spike = snap.timeseries.iter().find(|b| b.start == minute(12, 15)).unwrap();
    assert!(spike.anomaly_score > 0.6);
    // Leading empty minutes sit outside the fitted span.
    assert!(snap.timeseries[..45].iter().all(|b| b.anomaly_score == 0.0));
}

#[test]
fn test_threshold_rule_on_latest_bucket() {
    let (_dir, pool) = setup();
    fill_minute(&pool, minute(0, 1), 40, 20, 120, Channel::Mykt);

    let snap = engine(&pool).snapshot_at(now()).unwrap();

    assert_eq!(snap.kpis.attempts, 40);
    assert_eq!(snap.kpis.failures, 20);
    assert_eq!(snap.kpis.high_risk, 6);
    assert_eq!(snap.alerts.len(), 1);
    assert_eq!(snap.alerts[0].severity, Severity::Critical);
    assert_eq!(snap.alerts[0].message, "Fail rate 50.0% over threshold");
    assert_eq!(snap.alerts[0].id, format!("FR-{}", now().timestamp()));
}

#[test]
fn test_quiet_traffic_raises_nothing() {
    let (_dir, pool) = setup();
    fill_minute(&pool, minute(0, 1), 29, 20, 120, Channel::Web);

    let snap = engine(&pool).snapshot_at(now()).unwrap();
    // 69% failures, but below the attempt floor.
    assert!(snap.alerts.is_empty());
}

#[test]
fn test_rollups_match_series_and_ignore_stale_rows() {
    let (_dir, pool) = setup();
    fill_minute(&pool, minute(0, 3), 10, 1, 90, Channel::Web);
    fill_minute(&pool, minute(1, 3), 12, 3, 90, Channel::Membership);
    fill_minute(&pool, minute(2, 3), 8, 8, 90, Channel::Other("KIOSK".into()));
    // Two hours old: outside the window entirely.
    fill_minute(&pool, now() - Duration::hours(2), 50, 50, 90, Channel::Web);

    let snap = engine(&pool).snapshot_at(now()).unwrap();

    let series_attempts: u64 = snap.timeseries.iter().map(|b| b.attempts).sum();
    let series_failures: u64 = snap.timeseries.iter().map(|b| b.failures).sum();
    let channel_attempts: u64 = snap.by_channel.iter().map(|c| c.attempts).sum();
    let channel_failures: u64 = snap.by_channel.iter().map(|c| c.failures).sum();
    assert_eq!(series_attempts, 30);
    assert_eq!(series_attempts, channel_attempts);
    assert_eq!(series_failures, channel_failures);
    assert_eq!(snap.by_channel.len(), 3);
}

#[test]
fn test_same_now_is_idempotent() {
    let (_dir, pool) = setup();
    for i in 0..20 {
        fill_minute(&pool, minute(i, 20), 20 + (i % 4) as u64, (i % 3) as u64, 90, Channel::Web);
    }
    let engine = engine(&pool);
    assert_eq!(engine.snapshot_at(now()).unwrap(), engine.snapshot_at(now()).unwrap());
}

#[test]
fn test_per_request_bucket_override() {
    let (_dir, pool) = setup();
    fill_minute(&pool, minute(0, 1), 10, 2, 90, Channel::Web);

    let engine = engine(&pool);
    let query = engine.config().with_overrides(Some(15), Some(300));
    let snap = engine.snapshot_with(&query, now()).unwrap();

    assert_eq!(snap.timeseries.len(), 3);
    assert_eq!(snap.bucket_seconds, 300);
    assert_eq!(snap.timeseries.last().unwrap().attempts, 10);
}

#[test]
fn test_window_edge_is_read() {
    for (window_minutes, bucket_seconds) in [(60, 60), (15, 300)] {
        let (_dir, pool) = setup();
        let edge = now() - Duration::minutes(window_minutes) + Duration::seconds(10);
        fill_minute(&pool, edge, 1, 1, 90, Channel::Membership);
        // One second too old.
        fill_minute(&pool, now() - Duration::minutes(window_minutes) - Duration::seconds(1), 1, 1, 90, Channel::Web);

        let engine = engine(&pool);
        let query = engine.config().with_overrides(Some(window_minutes), Some(bucket_seconds));
        let snap = engine.snapshot_with(&query, now()).unwrap();

        let series_attempts: u64 = snap.timeseries.iter().map(|b| b.attempts).sum();
        assert_eq!(series_attempts, 1, "{window_minutes}m/{bucket_seconds}s");
        assert_eq!(snap.timeseries[0].attempts, 1);
        assert_eq!(snap.by_channel.len(), 1);
        assert_eq!(snap.by_channel[0].channel, Channel::Membership);
        assert_eq!(snap.by_channel[0].attempts, 1);
    }
}

#[test]
fn test_negative_window_is_rejected() {
    let (_dir, pool) = setup();
    let engine = engine(&pool);
    let query = engine.config().with_overrides(Some(-5), None);

    match engine.snapshot_with(&query, now()) {
        Err(EngineError::Config(ConfigError::NonPositive { field, value })) => {
            assert_eq!(field, "window_minutes");
            assert_eq!(value, -5);
        }
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn test_empty_store_gives_zeroes() {
    let (_dir, pool) = setup();
    let snap = engine(&pool).snapshot_at(now()).unwrap();

    assert_eq!(snap.timeseries.len(), 60);
    assert!(snap.timeseries.iter().all(|b| b.attempts == 0 && b.fail_rate == 0.0));
    assert!(snap.by_channel.is_empty());
    assert!(snap.alerts.is_empty());
    assert_eq!(snap.kpis.attempts, 0);
}
