//! Time-bucketed aggregation of attempt records.
//!
//! The grid is anchored at `now - window`, so the first bucket starts exactly
//! at the window's lower edge and nothing inside the window is lost. Bucket
//! boundaries therefore move with `now`: two polls a few seconds apart do not
//! share boundaries unless `now` advanced by a whole bucket width. The last
//! bucket contains `now` and is closed on the right at `now`. Empty buckets
//! are emitted too.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::events::{AttemptRecord, Channel};

/// `failures / attempts`, or 0 for an empty grouping.
pub fn fail_rate(failures: u64, attempts: u64) -> f64 {
    if attempts == 0 {
        0.0
    } else {
        failures as f64 / attempts as f64
    }
}

/// Fixed-width bucket boundaries covering `[now - window, now]` for one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketGrid {
    start: DateTime<Utc>,
    width: Duration,
    count: usize,
    now: DateTime<Utc>,
}

impl BucketGrid {
    /// `ceil(window / width)` buckets of `width`, the first starting at
    /// `now - window`. When `width` does not divide `window` the last bucket
    /// reaches past `now`; records after `now` are still rejected.
    pub fn over_window(now: DateTime<Utc>, window: Duration, width: Duration) -> Self {
        let window_ms = window.num_milliseconds().max(0);
        let width_ms = width.num_milliseconds();
        let count = if window_ms == 0 || width_ms <= 0 {
            0
        } else {
            usize::try_from((window_ms + width_ms - 1) / width_ms).unwrap_or(usize::MAX)
        };
        Self {
            start: now - window,
            width,
            count,
            now,
        }
    }

    /// Inclusive lower edge of the window, `now - window`. Reads start here.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn width(&self) -> Duration {
        self.width
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bucket_start(&self, index: usize) -> DateTime<Utc> {
        let steps = i32::try_from(index).unwrap_or(i32::MAX);
        self.start + self.width * steps
    }

    /// Bucket holding `ts`, if it lies in `[start, now]`.
    ///
    /// Buckets are left-closed. A record stamped exactly at `now` belongs to
    /// the last bucket even when `now` falls on its upper edge.
    pub fn index_of(&self, ts: DateTime<Utc>) -> Option<usize> {
        if ts < self.start || ts > self.now || self.count == 0 {
            return None;
        }
        let width_ms = self.width.num_milliseconds();
        if width_ms <= 0 {
            return None;
        }
        let offset_ms = (ts - self.start).num_milliseconds();
        let index = usize::try_from(offset_ms / width_ms).ok()?;
        Some(index.min(self.count - 1))
    }
}

/// Per-interval counters. `anomaly_score` and `outlier` are filled by the scorer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    #[serde(rename = "ts")]
    pub start: DateTime<Utc>,
    pub attempts: u64,
    pub failures: u64,
    pub mean_latency_ms: f64,
    pub fail_rate: f64,
    pub anomaly_score: f64,
    pub outlier: bool,
}

impl TimeBucket {
    fn empty(start: DateTime<Utc>) -> Self {
        Self {
            start,
            attempts: 0,
            failures: 0,
            mean_latency_ms: 0.0,
            fail_rate: 0.0,
            anomaly_score: 0.0,
            outlier: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attempts == 0
    }

    /// `(attempts, failures, fail_rate, mean_latency)`, the scorer's input.
    pub fn features(&self) -> [f64; 4] {
        [
            self.attempts as f64,
            self.failures as f64,
            self.fail_rate,
            self.mean_latency_ms,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRollup {
    pub channel: Channel,
    pub attempts: u64,
    pub failures: u64,
    pub fail_rate: f64,
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub buckets: Vec<TimeBucket>,
    pub channels: Vec<ChannelRollup>,
}

impl Aggregation {
    pub fn total_attempts(&self) -> u64 {
        self.buckets.iter().map(|b| b.attempts).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.buckets.iter().map(|b| b.failures).sum()
    }
}

/// Bucket `records` onto `grid` and roll the same records up by channel.
///
/// Records outside `[grid.start(), grid.now()]` are ignored by both views,
/// so the channel totals always equal the bucket totals.
pub fn aggregate(records: &[AttemptRecord], grid: &BucketGrid) -> Aggregation {
    let mut buckets: Vec<TimeBucket> = (0..grid.len())
        .map(|i| TimeBucket::empty(grid.bucket_start(i)))
        .collect();
    let mut latency_sums = vec![0u64; grid.len()];
    let mut by_channel: BTreeMap<&Channel, (u64, u64)> = BTreeMap::new();

    for record in records {
        let Some(index) = grid.index_of(record.timestamp) else {
            continue;
        };
        let failed = u64::from(record.is_failure());

        let bucket = &mut buckets[index];
        bucket.attempts += 1;
        bucket.failures += failed;
        latency_sums[index] += u64::from(record.latency_ms);

        let entry = by_channel.entry(&record.channel).or_default();
        entry.0 += 1;
        entry.1 += failed;
    }

    for (bucket, latency_sum) in buckets.iter_mut().zip(latency_sums) {
        if bucket.attempts > 0 {
            bucket.mean_latency_ms = latency_sum as f64 / bucket.attempts as f64;
        }
        bucket.fail_rate = fail_rate(bucket.failures, bucket.attempts);
    }

    let channels = by_channel
        .into_iter()
        .map(|(channel, (attempts, failures))| ChannelRollup {
            channel: channel.clone(),
            attempts,
            failures,
            fail_rate: fail_rate(failures, attempts),
        })
        .collect();

    Aggregation { buckets, channels }
}
