use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use loginpulse::config::{AppConfig, LoggingConfig};
use loginpulse::engine::SnapshotEngine;
use loginpulse::snapshot::MetricsSnapshot;
use loginpulse::storage::{self, SqliteEventStore};
use loginpulse::traffic::TrafficGenerator;

#[derive(Parser)]
#[command(
    name = "loginpulse",
    about = "Windowed login health metrics with anomaly alerts",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults: $LOGINPULSE_CONFIG, ./loginpulse.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server (and synthetic traffic, if enabled)
    Serve {
        /// Bind address, overrides [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Compute one snapshot from the event log and print it
    Snapshot {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Trailing window in minutes
        #[arg(long)]
        window_minutes: Option<i64>,

        /// Bucket width in seconds
        #[arg(long)]
        bucket_seconds: Option<i64>,
    },

    /// Write synthetic attempts into the event log
    Simulate {
        /// Number of generator batches
        #[arg(long, default_value = "10")]
        batches: usize,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Stderr subscriber for the logs emitted while the config itself is resolved.
fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish()
}

fn print_snapshot(snap: &MetricsSnapshot) {
    println!(
        "\nloginpulse snapshot @ {} ({} min window, {}s buckets)",
        snap.generated_at.to_rfc3339(),
        snap.window_minutes,
        snap.bucket_seconds
    );
    println!(
        "Latest bucket: {} attempts, {} failures, {:.1}% fail rate, {} high-risk",
        snap.kpis.attempts,
        snap.kpis.failures,
        snap.kpis.fail_rate * 100.0,
        snap.kpis.high_risk
    );

    println!("\n{:<12} | {:>8} | {:>8} | {:>9}", "Channel", "Attempts", "Failures", "Fail Rate");
    println!("{:-<12}-|-{:-<8}-|-{:-<8}-|-{:-<9}", "", "", "", "");
    for c in &snap.by_channel {
        println!(
            "{:<12} | {:>8} | {:>8} | {:>8.1}%",
            c.channel.as_str(),
            c.attempts,
            c.failures,
            c.fail_rate * 100.0
        );
    }

    println!("\n=== Alerts ===");
    if snap.alerts.is_empty() {
        println!("none");
    }
    for a in &snap.alerts {
        println!("[{}] {} - {} @ {}", a.severity, a.kind, a.message, a.time.to_rfc3339());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config =
        tracing::subscriber::with_default(bootstrap_subscriber(), || AppConfig::resolve(cli.config.as_deref()))?;

    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting loginpulse");
            loginpulse::serve(config).await?;
        }
        Commands::Snapshot {
            json,
            window_minutes,
            bucket_seconds,
        } => {
            let pool = storage::open_pool(&config.storage.db_path)
                .with_context(|| format!("failed to open database {}", config.storage.db_path))?;
            let engine = SnapshotEngine::new(Arc::new(SqliteEventStore::new(pool)), config.engine.clone())?;
            let query = engine.config().with_overrides(window_minutes, bucket_seconds);
            let snap = engine.snapshot_with(&query, Utc::now())?;

            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else {
                print_snapshot(&snap);
            }
        }
        Commands::Simulate { batches } => {
            config.traffic.validate()?;
            let pool = storage::open_pool(&config.storage.db_path)
                .with_context(|| format!("failed to open database {}", config.storage.db_path))?;
            let mut generator = TrafficGenerator::new(pool, config.traffic.clone());
            let inserted = generator.run_batches(batches)?;
            println!("Inserted {} synthetic attempts into {}", inserted, config.storage.db_path);
        }
        Commands::CheckConfig => {
            config.validate()?;
            let mut shown = config.clone();
            for secret in [&mut shown.summarizer.api_key, &mut shown.notify.slack_webhook_url] {
                if !secret.is_empty() {
                    *secret = "<redacted>".to_string();
                }
            }
            println!("{}", toml::to_string_pretty(&shown)?);
            println!("# configuration OK");
        }
    }

    Ok(())
}
