//! TOML configuration for loginpulse.
//!
//! Layered model: an explicit path, then the `LOGINPULSE_CONFIG` environment
//! variable, then `./loginpulse.toml`, then compiled-in defaults. Secrets for
//! the outbound collaborators may additionally come from their conventional
//! environment variables, which win over the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest trailing window a request may ask for (one week).
pub const MAX_WINDOW_MINUTES: i64 = 7 * 24 * 60;
/// Upper bound on the number of buckets in one series.
pub const MAX_BUCKETS: usize = 10_080;
/// Longest alert cooldown (one week).
pub const MAX_DEDUP_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Rejected option values. Raised before any computation starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: i64 },
    #[error("{field} must not exceed {max}, got {value}")]
    TooLarge {
        field: &'static str,
        value: i64,
        max: i64,
    },
    #[error("bucket width of {bucket_seconds}s is wider than the {window_seconds}s window")]
    BucketWiderThanWindow {
        bucket_seconds: i64,
        window_seconds: i64,
    },
    #[error("window of {window_seconds}s at {bucket_seconds}s per bucket needs {count} buckets (max {max})")]
    TooManyBuckets {
        window_seconds: i64,
        bucket_seconds: i64,
        count: usize,
        max: usize,
    },
    #[error("{field} must be in {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        range: &'static str,
    },
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration layers, then apply environment overrides.
    ///
    /// An explicit path that cannot be loaded is an error; the implicit
    /// locations fall through to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("LOGINPULSE_CONFIG") {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LOGINPULSE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new("loginpulse.toml");
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Environment variables understood for deployment secrets and toggles.
    fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("SLACK_WEBHOOK_URL") {
            self.notify.slack_webhook_url = url;
        }
        if let Some(ttl) = non_empty("SLACK_DEDUP_TTL_SEC") {
            match ttl.trim().parse() {
                Ok(ttl) => self.dedup.ttl_secs = ttl,
                Err(_) => warn!(value = %ttl, "ignoring unparseable SLACK_DEDUP_TTL_SEC"),
            }
        }
        if let Some(endpoint) = non_empty("AZURE_OPENAI_ENDPOINT") {
            self.summarizer.endpoint = endpoint;
        }
        if let Some(key) = non_empty("AZURE_OPENAI_API_KEY") {
            self.summarizer.api_key = key;
        }
        if let Some(deployment) = non_empty("AZURE_OPENAI_DEPLOYMENT") {
            self.summarizer.deployment = deployment;
        }
        if let Some(version) = non_empty("AZURE_OPENAI_API_VERSION") {
            self.summarizer.api_version = version;
        }
        if non_empty("ENABLE_BG_TRAFFIC").as_deref() == Some("1") {
            self.traffic.enabled = true;
        }
    }

    /// Validate every section that carries computation parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.dedup.validate()?;
        self.traffic.validate()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Parameters of one snapshot computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Trailing window length in minutes.
    pub window_minutes: i64,
    /// Bucket width in seconds.
    pub bucket_seconds: i64,
    /// Non-empty buckets required before the outlier model is fitted.
    pub min_history_buckets: usize,
    /// How many of the newest buckets the model rule ranks.
    pub recent_buckets: usize,
    /// Share of the latest bucket's failures counted as high risk.
    pub high_risk_ratio: f64,
    /// Series points handed to the summarizer.
    pub summary_points: usize,
    pub rules: RuleConfig,
    pub model: ModelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            bucket_seconds: 60,
            min_history_buckets: 10,
            recent_buckets: 10,
            high_risk_ratio: 0.3,
            summary_points: 30,
            rules: RuleConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_minutes <= 0 {
            return Err(ConfigError::NonPositive {
                field: "window_minutes",
                value: self.window_minutes,
            });
        }
        if self.window_minutes > MAX_WINDOW_MINUTES {
            return Err(ConfigError::TooLarge {
                field: "window_minutes",
                value: self.window_minutes,
                max: MAX_WINDOW_MINUTES,
            });
        }
        if self.bucket_seconds <= 0 {
            return Err(ConfigError::NonPositive {
                field: "bucket_seconds",
                value: self.bucket_seconds,
            });
        }
        let window_seconds = self.window_minutes * 60;
        if self.bucket_seconds > window_seconds {
            return Err(ConfigError::BucketWiderThanWindow {
                bucket_seconds: self.bucket_seconds,
                window_seconds,
            });
        }
        let count = self.bucket_count();
        if count > MAX_BUCKETS {
            return Err(ConfigError::TooManyBuckets {
                window_seconds,
                bucket_seconds: self.bucket_seconds,
                count,
                max: MAX_BUCKETS,
            });
        }
        if self.recent_buckets == 0 {
            return Err(ConfigError::Zero {
                field: "recent_buckets",
            });
        }
        check_range("high_risk_ratio", self.high_risk_ratio, 0.0, 1.0, "[0, 1]")?;
        self.rules.validate()?;
        self.model.validate()
    }

    /// Apply per-request overrides; the result still needs [`validate`](Self::validate).
    pub fn with_overrides(&self, window_minutes: Option<i64>, bucket_seconds: Option<i64>) -> Self {
        let mut cfg = self.clone();
        if let Some(w) = window_minutes {
            cfg.window_minutes = w;
        }
        if let Some(b) = bucket_seconds {
            cfg.bucket_seconds = b;
        }
        cfg
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_minutes.saturating_mul(60))
    }

    pub fn bucket_width(&self) -> Duration {
        Duration::seconds(self.bucket_seconds)
    }

    /// `ceil(window / bucket)`. Only meaningful for positive values.
    pub fn bucket_count(&self) -> usize {
        let window = self.window_minutes.saturating_mul(60);
        if window <= 0 || self.bucket_seconds <= 0 {
            return 0;
        }
        let count = (window + self.bucket_seconds - 1) / self.bucket_seconds;
        usize::try_from(count).unwrap_or(usize::MAX)
    }
}

/// Alert rule thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// The threshold rule fires strictly above this fail rate.
    pub fail_rate_threshold: f64,
    /// ...and only when the latest bucket has at least this many attempts.
    pub min_attempts: u64,
    /// The model rule fires strictly above this anomaly score.
    pub anomaly_score_cutoff: f64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            fail_rate_threshold: 0.40,
            min_attempts: 30,
            anomaly_score_cutoff: 0.60,
        }
    }
}

impl RuleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "fail_rate_threshold",
            self.fail_rate_threshold,
            0.0,
            1.0,
            "[0, 1]",
        )?;
        if !self.anomaly_score_cutoff.is_finite() || self.anomaly_score_cutoff < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "anomaly_score_cutoff",
                value: self.anomaly_score_cutoff,
                range: "[0, inf)",
            });
        }
        Ok(())
    }
}

/// Isolation forest parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub trees: usize,
    /// Per-tree subsample size (capped at the number of points).
    pub max_samples: usize,
    /// Expected outlier share; sets the decision threshold.
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            trees: 100,
            max_samples: 256,
            contamination: 0.08,
            seed: 42,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trees == 0 {
            return Err(ConfigError::Zero { field: "trees" });
        }
        if self.max_samples < 2 {
            return Err(ConfigError::OutOfRange {
                field: "max_samples",
                value: self.max_samples as f64,
                range: "[2, inf)",
            });
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(ConfigError::OutOfRange {
                field: "contamination",
                value: self.contamination,
                range: "(0, 0.5]",
            });
        }
        Ok(())
    }
}

fn check_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
    range: &'static str,
) -> Result<(), ConfigError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            range,
        })
    }
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

/// Outbound alert suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Cooldown for an identical alert, in seconds.
    pub ttl_secs: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl_secs: 180 }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs < 0 {
            return Err(ConfigError::OutOfRange {
                field: "dedup.ttl_secs",
                value: self.ttl_secs as f64,
                range: "[0, inf)",
            });
        }
        if self.ttl_secs > MAX_DEDUP_TTL_SECS {
            return Err(ConfigError::TooLarge {
                field: "dedup.ttl_secs",
                value: self.ttl_secs,
                max: MAX_DEDUP_TTL_SECS,
            });
        }
        Ok(())
    }

    /// Cooldown as a duration, clamped to `[0, MAX_DEDUP_TTL_SECS]`.
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs.clamp(0, MAX_DEDUP_TTL_SECS))
    }
}

// ---------------------------------------------------------------------------
// Storage / server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file holding the attempt log.
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/loginpulse.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Slack incoming-webhook delivery. An empty URL disables notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub slack_webhook_url: String,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            slack_webhook_url: String::new(),
            timeout_secs: 6,
        }
    }
}

impl NotifyConfig {
    pub fn is_enabled(&self) -> bool {
        !self.slack_webhook_url.trim().is_empty()
    }
}

/// Azure OpenAI chat-completions summarizer. Disabled unless endpoint and key are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
    /// Use the `/openai/v1` surface (deployment passed as `model`).
    pub use_v1: bool,
    pub timeout_secs: u64,
    pub max_prompt_chars: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            deployment: "gpt-4o-mini".to_string(),
            api_version: "2024-10-01-preview".to_string(),
            use_v1: true,
            timeout_secs: 10,
            max_prompt_chars: 6000,
        }
    }
}

impl SummarizerConfig {
    pub fn is_enabled(&self) -> bool {
        !self.endpoint.trim().is_empty()
            && !self.api_key.trim().is_empty()
            && !self.deployment.trim().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Synthetic traffic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Run the generator inside `serve`.
    pub enabled: bool,
    pub base_sleep_ms: u64,
    /// Chance that a tick is a burst (outage / credential-stuffing shape).
    pub burst_prob: f64,
    pub normal_success: f64,
    pub burst_success: f64,
    pub normal_batch: usize,
    pub burst_batch: usize,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_sleep_ms: 2000,
            burst_prob: 0.12,
            normal_success: 0.85,
            burst_success: 0.30,
            normal_batch: 5,
            burst_batch: 20,
        }
    }
}

impl TrafficConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("traffic.burst_prob", self.burst_prob, 0.0, 1.0, "[0, 1]")?;
        check_range("traffic.normal_success", self.normal_success, 0.0, 1.0, "[0, 1]")?;
        check_range("traffic.burst_success", self.burst_success, 0.0, 1.0, "[0, 1]")
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (`trace` .. `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.engine.window_minutes, 60);
        assert_eq!(cfg.engine.bucket_seconds, 60);
        assert_eq!(cfg.engine.bucket_count(), 60);
        assert_eq!(cfg.engine.rules.fail_rate_threshold, 0.40);
        assert_eq!(cfg.engine.rules.min_attempts, 30);
        assert_eq!(cfg.engine.rules.anomaly_score_cutoff, 0.60);
        assert_eq!(cfg.engine.model.contamination, 0.08);
        assert_eq!(cfg.engine.model.trees, 100);
        assert_eq!(cfg.dedup.ttl_secs, 180);
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert!(!cfg.notify.is_enabled());
        assert!(!cfg.summarizer.is_enabled());
        assert!(!cfg.traffic.enabled);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[engine]
window_minutes = 15

[engine.rules]
min_attempts = 50

[dedup]
ttl_secs = 60
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.engine.window_minutes, 15);
        assert_eq!(cfg.engine.bucket_seconds, 60);
        assert_eq!(cfg.engine.rules.min_attempts, 50);
        assert_eq!(cfg.engine.rules.fail_rate_threshold, 0.40);
        assert_eq!(cfg.dedup.ttl_secs, 60);
        assert_eq!(cfg.storage.db_path, "data/loginpulse.db");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.engine, EngineConfig::default());
        assert_eq!(cfg.dedup, DedupConfig::default());
    }

    #[test]
    fn test_negative_window_rejected() {
        let cfg = EngineConfig::default().with_overrides(Some(-5), None);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NonPositive {
                field: "window_minutes",
                value: -5
            })
        );
    }

    #[test]
    fn test_bucket_wider_than_window_rejected() {
        let cfg = EngineConfig::default().with_overrides(Some(1), Some(120));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BucketWiderThanWindow { .. })
        ));
    }

    #[test]
    fn test_too_many_buckets_rejected() {
        let cfg = EngineConfig::default().with_overrides(Some(MAX_WINDOW_MINUTES), Some(1));
        assert!(matches!(cfg.validate(), Err(ConfigError::TooManyBuckets { .. })));
    }

    #[test]
    fn test_bucket_count_rounds_up() {
        let cfg = EngineConfig::default().with_overrides(Some(10), Some(45));
        // 600s / 45s = 13.33
        assert_eq!(cfg.bucket_count(), 14);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_contamination_range() {
        let mut cfg = EngineConfig::default();
        cfg.model.contamination = 0.0;
        assert!(cfg.validate().is_err());
        cfg.model.contamination = 0.5;
        assert!(cfg.validate().is_ok());
        cfg.model.contamination = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_threshold_range() {
        let mut cfg = EngineConfig::default();
        cfg.rules.fail_rate_threshold = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                field: "fail_rate_threshold",
                ..
            })
        ));
    }

    #[test]
    fn test_env_overrides_secrets() {
        let env: HashMap<&str, &str> = [
            ("SLACK_WEBHOOK_URL", "https://hooks.example/T000"),
            ("SLACK_DEDUP_TTL_SEC", "30"),
            ("AZURE_OPENAI_ENDPOINT", "https://aoai.example"),
            ("AZURE_OPENAI_API_KEY", "k"),
            ("ENABLE_BG_TRAFFIC", "1"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert!(cfg.notify.is_enabled());
        assert_eq!(cfg.dedup.ttl_secs, 30);
        assert!(cfg.summarizer.is_enabled());
        assert_eq!(cfg.summarizer.deployment, "gpt-4o-mini");
        assert!(cfg.traffic.enabled);
    }

    #[test]
    fn test_huge_dedup_ttl_rejected() {
        let env: HashMap<&str, &str> = [("SLACK_DEDUP_TTL_SEC", "10000000000000000")].into_iter().collect();
        let mut cfg = AppConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.dedup.ttl_secs, 10_000_000_000_000_000);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::TooLarge {
                field: "dedup.ttl_secs",
                value: 10_000_000_000_000_000,
                max: MAX_DEDUP_TTL_SECS,
            })
        );
        assert_eq!(cfg.dedup.ttl(), Duration::seconds(MAX_DEDUP_TTL_SECS));

        cfg.dedup.ttl_secs = i64::MAX;
        assert!(cfg.dedup.validate().is_err());
        assert_eq!(cfg.dedup.ttl(), Duration::days(7));
        cfg.dedup.ttl_secs = MAX_DEDUP_TTL_SECS;
        assert!(cfg.dedup.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("loginpulse.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "127.0.0.1:9999"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9999");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = AppConfig::load(Path::new("/nonexistent/path/loginpulse.toml"));
        assert!(result.is_err());
    }
}
