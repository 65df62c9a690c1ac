//! Anomaly scoring, alert rules and outbound alert suppression.

pub mod anomaly;
pub mod dedup;
pub mod rules;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("invalid model parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Severity levels for emitted alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warning,
    #[serde(rename = "CRIT")]
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARN",
            Severity::Critical => "CRIT",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum AlertKind {
    FailRateSpike,
    MlAnomaly,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::FailRateSpike => "FAIL_RATE_SPIKE",
            AlertKind::MlAnomaly => "ML_ANOMALY",
        }
    }

    /// Short prefix used in alert identifiers.
    fn id_prefix(&self) -> &'static str {
        match self {
            AlertKind::FailRateSpike => "FR",
            AlertKind::MlAnomaly => "ML",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted alert. Not persisted by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// When the condition was observed; the bucket start for model alerts.
    pub time: DateTime<Utc>,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        message: String,
        time: DateTime<Utc>,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{}-{}", kind.id_prefix(), emitted_at.timestamp()),
            time,
            severity,
            kind,
            message,
        }
    }
}
