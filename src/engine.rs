//! The snapshot pipeline.
//!
//! [`SnapshotEngine`] is the synchronous core: read the window, bucket it,
//! score it, evaluate rules, build the snapshot. [`Monitor`] wraps it for the
//! async service, running the blocking part on the blocking pool and then
//! fanning out to the optional summarizer and alert dispatcher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analysis::{aggregate, BucketGrid};
use crate::config::{ConfigError, EngineConfig};
use crate::detect::anomaly::AnomalyScorer;
use crate::detect::rules::RuleEngine;
use crate::detect::DetectError;
use crate::events::EventSource;
use crate::notify::AlertDispatcher;
use crate::snapshot::MetricsSnapshot;
use crate::storage::StoreError;
use crate::summarize::Summarizer;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid query: {0}")]
    Config(#[from] ConfigError),
    #[error("event store: {0}")]
    Store(#[from] StoreError),
    #[error("anomaly model: {0}")]
    Model(#[from] DetectError),
    #[error("snapshot task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub struct SnapshotEngine {
    source: Arc<dyn EventSource>,
    config: EngineConfig,
}

impl SnapshotEngine {
    /// Build an engine with validated defaults.
    pub fn new(source: Arc<dyn EventSource>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { source, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of the window ending at `now` using the engine's own options.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Result<MetricsSnapshot, EngineError> {
        self.snapshot_with(&self.config, now)
    }

    /// Snapshot using `config` in place of the engine defaults.
    ///
    /// Pure with respect to `now`: two calls over the same store contents
    /// and the same `now` return equal snapshots.
    pub fn snapshot_with(&self, config: &EngineConfig, now: DateTime<Utc>) -> Result<MetricsSnapshot, EngineError> {
        config.validate()?;

        let grid = BucketGrid::over_window(now, config.window(), config.bucket_width());
        let records = self.source.read_since(grid.start())?;
        debug!(records = records.len(), since = %grid.start(), buckets = grid.len(), "window read");

        let mut aggregation = aggregate(&records, &grid);

        let scorer = AnomalyScorer::new(config.model.clone(), config.min_history_buckets)?;
        let threshold = scorer.score(&mut aggregation.buckets);

        let rules = RuleEngine::new(config.rules.clone(), config.recent_buckets);
        let alerts = rules.evaluate(&aggregation.buckets, now);

        Ok(MetricsSnapshot::build(aggregation, alerts, threshold, config, now))
    }
}

/// Per-request option overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub window_minutes: Option<i64>,
    pub bucket_seconds: Option<i64>,
}

/// A snapshot plus the optional prose summary.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
    pub summary: Option<String>,
}

/// Async front end used by the HTTP layer.
pub struct Monitor {
    engine: Arc<SnapshotEngine>,
    summarizer: Option<Arc<dyn Summarizer>>,
    dispatcher: Option<Arc<AlertDispatcher>>,
}

impl Monitor {
    pub fn new(engine: SnapshotEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            summarizer: None,
            dispatcher: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<AlertDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn engine(&self) -> &SnapshotEngine {
        &self.engine
    }

    /// Recompute the snapshot for the window ending now, then summarize and
    /// notify. Only option validation and store access can fail the call.
    pub async fn poll(&self, overrides: Overrides) -> Result<MetricsReport, EngineError> {
        self.poll_at(overrides, Utc::now()).await
    }

    pub async fn poll_at(&self, overrides: Overrides, now: DateTime<Utc>) -> Result<MetricsReport, EngineError> {
        let config = self
            .engine
            .config()
            .with_overrides(overrides.window_minutes, overrides.bucket_seconds);
        config.validate()?;

        let engine = Arc::clone(&self.engine);
        let summary_points = config.summary_points;
        let snapshot = tokio::task::spawn_blocking(move || engine.snapshot_with(&config, now)).await??;

        if !snapshot.alerts.is_empty() {
            info!(count = snapshot.alerts.len(), "alerts raised");
        }

        let summary = self.summarize(&snapshot, summary_points).await;

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher
                .dispatch(&snapshot.alerts, summary.as_deref(), &snapshot.kpis, now)
                .await;
        }

        Ok(MetricsReport { snapshot, summary })
    }

    async fn summarize(&self, snapshot: &MetricsSnapshot, points: usize) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;
        match summarizer.summarize(&snapshot.truncated(points)).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "summarizer failed, continuing without summary");
                None
            }
        }
    }
}
