//! Azure OpenAI chat-completions summarizer.
//!
//! Speaks either the v1 surface (`/openai/v1/chat/completions`, model in the
//! body) or the preview deployment surface with an `api-version` query. The
//! prompt carries the snapshot as JSON, clipped on a char boundary.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{SummarizeError, Summarizer};
use crate::config::SummarizerConfig;
use crate::snapshot::MetricsSnapshot;

const INSTRUCTIONS: &str = "You are an operations assistant for a login service. \
Using the KPIs, recent time series and alert list below, write: \
1) a one-sentence summary, 2) up to 4 bullet points of likely causes, \
3) up to 4 bullet points of immediate actions. Be concise. \
If there is no issue, reply with a single line saying the service looks healthy.";

/// Azure OpenAI chat-completions client.
pub struct AzureOpenAiSummarizer {
    client: Client,
    config: SummarizerConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl AzureOpenAiSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, SummarizeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        let endpoint = self.config.endpoint.trim_end_matches('/');
        if self.config.use_v1 {
            format!("{endpoint}/openai/v1/chat/completions")
        } else {
            format!(
                "{endpoint}/openai/deployments/{}/chat/completions?api-version={}",
                self.config.deployment, self.config.api_version
            )
        }
    }

    fn body(&self, prompt: &str) -> serde_json::Value {
        let mut body = json!({
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.2,
        });
        if self.config.use_v1 {
            // The v1 surface takes the deployment name as the model.
            body["model"] = json!(self.config.deployment);
        }
        body
    }
}

/// Instructions followed by the snapshot JSON, cut to `max_chars` characters.
pub fn build_prompt(snapshot: &MetricsSnapshot, max_chars: usize) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(snapshot)?;
    let clipped: String = json.chars().take(max_chars).collect();
    Ok(format!("{INSTRUCTIONS}\n\nJSON input:\n{clipped}"))
}

#[async_trait]
impl Summarizer for AzureOpenAiSummarizer {
    async fn summarize(&self, snapshot: &MetricsSnapshot) -> Result<Option<String>, SummarizeError> {
        if !self.config.is_enabled() {
            return Ok(None);
        }

        let prompt = build_prompt(snapshot, self.config.max_prompt_chars)?;
        debug!(chars = prompt.len(), "requesting summary");

        let response: ChatResponse = self
            .client
            .post(self.url())
            .header("api-key", &self.config.api_key)
            .json(&self.body(&prompt))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(SummarizeError::EmptyResponse)?;
        Ok(Some(content))
    }
}
