//! loginpulse -- windowed health metrics and anomaly alerts for a login service.
//!
//! This crate provides the event log, the bucketed aggregation and outlier
//! scoring pipeline, alert rules with outbound deduplication, and the HTTP
//! surface that exposes snapshots and ingests attempts.

pub mod analysis;
pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod events;
pub mod notify;
pub mod snapshot;
pub mod storage;
pub mod summarize;
pub mod traffic;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;
use crate::detect::dedup::AlertDeduplicator;
use crate::engine::{Monitor, SnapshotEngine};
use crate::notify::{AlertDispatcher, SlackNotifier};
use crate::storage::{Pool, SqliteEventStore};
use crate::summarize::AzureOpenAiSummarizer;

/// Wire the pipeline and whichever collaborators the config enables.
pub fn build_monitor(config: &AppConfig, pool: Pool) -> Result<Monitor> {
    config.validate()?;

    let source = Arc::new(SqliteEventStore::new(pool));
    let engine = SnapshotEngine::new(source, config.engine.clone())?;
    let mut monitor = Monitor::new(engine);

    if config.summarizer.is_enabled() {
        let summarizer = AzureOpenAiSummarizer::new(config.summarizer.clone())
            .context("failed to build summarizer client")?;
        info!(deployment = %config.summarizer.deployment, "summarizer enabled");
        monitor = monitor.with_summarizer(Arc::new(summarizer));
    } else {
        info!("summarizer disabled (no endpoint/key configured)");
    }

    if config.notify.is_enabled() {
        let notifier = SlackNotifier::new(
            config.notify.slack_webhook_url.clone(),
            Duration::from_secs(config.notify.timeout_secs),
        )
        .context("failed to build webhook client")?;
        let dedup = AlertDeduplicator::new(config.dedup.ttl());
        info!(ttl_secs = config.dedup.ttl_secs, "slack notifications enabled");
        monitor = monitor.with_dispatcher(Arc::new(AlertDispatcher::new(dedup, Arc::new(notifier))));
    } else {
        info!("notifications disabled (no webhook configured)");
    }

    Ok(monitor)
}

/// Start the loginpulse service: API server and, if enabled, synthetic traffic.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Storage
    info!(db_path = %config.storage.db_path, "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)
        .with_context(|| format!("failed to open database {}", config.storage.db_path))?;

    // 2. Pipeline + collaborators
    let monitor = build_monitor(&config, pool.clone())?;

    // 3. Synthetic traffic (background task)
    if config.traffic.enabled {
        let generator = traffic::TrafficGenerator::new(pool.clone(), config.traffic.clone());
        tokio::spawn(generator.run());
    } else {
        info!("synthetic traffic disabled");
    }

    // 4. API server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let app = api::router(api::state::AppState {
        pool,
        monitor: Arc::new(monitor),
    });

    info!(%addr, "loginpulse listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
