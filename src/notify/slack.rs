//! Slack incoming-webhook notifier.
//!
//! Posts a Block Kit message first; if Slack rejects it, retries once with a
//! plain `text` payload.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;

use super::{NotifyError, Notifier};
use crate::detect::{Alert, Severity};
use crate::snapshot::Kpis;

pub struct SlackNotifier {
    client: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }

    async fn post(&self, payload: &Value) -> Result<(), NotifyError> {
        let response = self.client.post(&self.webhook_url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected(format!("{status}: {body}")))
    }
}

fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "\u{1F6A8}",
        Severity::Warning => "\u{26A0}\u{FE0F}",
        Severity::Info => "\u{2139}\u{FE0F}",
    }
}

/// `1234567` -> `1,234,567`.
fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn alert_time(alert: &Alert) -> String {
    alert.time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Block Kit message for one alert.
pub fn build_blocks(alert: &Alert, summary: Option<&str>, kpis: &Kpis) -> Value {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!("{} [{}] {}", severity_emoji(alert.severity), alert.severity, alert.kind),
                "emoji": true,
            }
        }),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("*{}*\n`{}`", alert.message, alert_time(alert)),
            }
        }),
        json!({
            "type": "section",
            "fields": [
                { "type": "mrkdwn", "text": format!("*Attempts*\n{}", thousands(kpis.attempts)) },
                { "type": "mrkdwn", "text": format!("*Failures*\n{}", thousands(kpis.failures)) },
                { "type": "mrkdwn", "text": format!("*Fail Rate*\n{:.1}%", kpis.fail_rate * 100.0) },
                { "type": "mrkdwn", "text": format!("*High-Risk*\n{}", thousands(kpis.high_risk)) },
            ]
        }),
    ];

    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        blocks.push(json!({ "type": "divider" }));
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Summary*\n{}", summary.trim()) }
        }));
    }

    blocks.push(json!({
        "type": "context",
        "elements": [
            { "type": "mrkdwn", "text": format!("loginpulse | alert `{}`", alert.id) }
        ]
    }));

    json!({ "blocks": blocks })
}

/// Plain-text body used when the block payload is refused.
pub fn fallback_text(alert: &Alert, summary: Option<&str>) -> String {
    let mut text = format!(
        "[{}] {} - {} @ {}",
        alert.severity,
        alert.kind,
        alert.message,
        alert_time(alert)
    );
    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        text.push_str("\n\n");
        text.push_str(summary.trim());
    }
    text
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, alert: &Alert, summary: Option<&str>, kpis: &Kpis) -> Result<(), NotifyError> {
        match self.post(&build_blocks(alert, summary, kpis)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(id = %alert.id, error = %e, "block payload rejected, retrying as text");
                self.post(&json!({ "text": fallback_text(alert, summary) })).await
            }
        }
    }
}
