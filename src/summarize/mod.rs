//! Natural-language summaries of a snapshot, produced by an external model.

pub mod azure;

use async_trait::async_trait;
use thiserror::Error;

use crate::snapshot::MetricsSnapshot;

pub use azure::AzureOpenAiSummarizer;

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("summarizer request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("summarizer response had no content")]
    EmptyResponse,
}

/// Turns a snapshot into operator-facing prose.
///
/// `Ok(None)` means "nothing to say" (e.g. not configured). Callers treat
/// errors the same way after logging them.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, snapshot: &MetricsSnapshot) -> Result<Option<String>, SummarizeError>;
}
