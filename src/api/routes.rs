//! API route definitions.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::state::AppState;
use crate::engine::{EngineError, MetricsReport, Overrides};
use crate::events::{hash_user, AttemptRecord, AttemptResult, Channel, FailReason};
use crate::storage::{format_ts, insert_attempt};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/attempts", post(ingest_attempt))
}

/// Handler failures rendered as `{"error": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Config(e) => ApiError::BadRequest(e.to_string()),
            other => {
                error!(error = %other, "snapshot failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
        }
    }))
}

#[derive(Debug, Default, Deserialize)]
struct MetricsQuery {
    window_minutes: Option<i64>,
    bucket_seconds: Option<i64>,
}

async fn metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<MetricsReport>, ApiError> {
    let overrides = Overrides {
        window_minutes: query.window_minutes,
        bucket_seconds: query.bucket_seconds,
    };
    let report = state.monitor.poll(overrides).await?;
    Ok(Json(report))
}

/// Attempt as reported by the monitored login service.
#[derive(Debug, Deserialize)]
pub struct AttemptInput {
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Raw user identifier; hashed before storage.
    pub user: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default = "default_fingerprint")]
    pub fingerprint: String,
    pub result: String,
    pub fail_reason: Option<String>,
    pub latency_ms: i64,
}

fn default_channel() -> String {
    "WEB".to_string()
}

fn default_fingerprint() -> String {
    "anon".to_string()
}

impl AttemptInput {
    /// Validate and convert, filling `ip` / `user_agent` from the request.
    fn into_record(
        self,
        now: DateTime<Utc>,
        peer_ip: Option<String>,
        header_ua: Option<String>,
    ) -> Result<AttemptRecord, ApiError> {
        let result = AttemptResult::parse(&self.result)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown result {:?}", self.result)))?;
        let latency_ms = u32::try_from(self.latency_ms)
            .map_err(|_| ApiError::BadRequest(format!("latency_ms out of range: {}", self.latency_ms)))?;
        if self.channel.trim().is_empty() {
            return Err(ApiError::BadRequest("channel must not be empty".to_string()));
        }

        let fail_reason = match result {
            AttemptResult::Success => FailReason::None,
            AttemptResult::Fail => match self.fail_reason.as_deref().map(FailReason::parse) {
                None | Some(FailReason::None) => FailReason::InvalidPw,
                Some(reason) => reason,
            },
        };

        Ok(AttemptRecord {
            timestamp: now,
            channel: Channel::parse(self.channel.trim()),
            user_hash: hash_user(&self.user),
            ip: self.ip.or(peer_ip).unwrap_or_default(),
            user_agent: self.user_agent.or(header_ua).unwrap_or_default(),
            fingerprint: self.fingerprint,
            result,
            fail_reason,
            latency_ms,
        })
    }
}

async fn ingest_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(input): Json<AttemptInput>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let peer_ip = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let header_ua = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let record = input.into_record(Utc::now(), peer_ip, header_ua)?;
    let response = json!({
        "data": {
            "result": record.result.as_str(),
            "recorded_at": format_ts(record.timestamp),
        }
    });

    let pool = state.pool.clone();
    tokio::task::spawn_blocking(move || insert_attempt(&pool, &record))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| {
            error!(error = %e, "failed to record attempt");
            ApiError::Internal(e.to_string())
        })?;

    Ok((StatusCode::CREATED, Json(response)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(result: &str) -> AttemptInput {
        AttemptInput {
            channel: "mykt".into(),
            user: "user@example.com".into(),
            ip: None,
            user_agent: None,
            fingerprint: "fp-3".into(),
            result: result.into(),
            fail_reason: None,
            latency_ms: 120,
        }
    }

    #[test]
    fn test_into_record_fills_from_request() {
        let record = input("FAIL")
            .into_record(Utc::now(), Some("192.0.2.7".into()), Some("curl/8".into()))
            .unwrap();
        assert_eq!(record.channel, Channel::Mykt);
        assert_eq!(record.ip, "192.0.2.7");
        assert_eq!(record.user_agent, "curl/8");
        assert_eq!(record.user_hash, hash_user("user@example.com"));
        assert_eq!(record.fail_reason, FailReason::InvalidPw);
    }

    #[test]
    fn test_explicit_fields_win() {
        let mut i = input("SUCCESS");
        i.ip = Some("10.0.0.9".into());
        i.fail_reason = Some("LOCKED".into());
        let record = i.into_record(Utc::now(), Some("192.0.2.7".into()), None).unwrap();
        assert_eq!(record.ip, "10.0.0.9");
        assert_eq!(record.fail_reason, FailReason::None);
        assert_eq!(record.user_agent, "");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            input("MAYBE").into_record(Utc::now(), None, None),
            Err(ApiError::BadRequest(_))
        ));
        let mut i = input("FAIL");
        i.latency_ms = -1;
        assert!(matches!(i.into_record(Utc::now(), None, None), Err(ApiError::BadRequest(_))));
    }
}
