//! Authentication-attempt records and the read-side contract of the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::StoreError;

/// Hex SHA-256 of a raw user identifier. Raw identifiers are never stored.
pub fn hash_user(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Login channel the attempt came through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Web,
    Mykt,
    Membership,
    Other(String),
}

impl Channel {
    pub fn as_str(&self) -> &str {
        match self {
            Channel::Web => "WEB",
            Channel::Mykt => "MYKT",
            Channel::Membership => "MEMBERSHIP",
            Channel::Other(name) => name,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "WEB" => Channel::Web,
            "MYKT" => Channel::Mykt,
            "MEMBERSHIP" => Channel::Membership,
            _ => Channel::Other(raw.trim().to_string()),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Channel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Channel::parse(&raw))
    }
}

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptResult {
    Success,
    Fail,
}

impl AttemptResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptResult::Success => "SUCCESS",
            AttemptResult::Fail => "FAIL",
        }
    }

    /// Strict parse; anything other than the two stored spellings is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SUCCESS" => Some(AttemptResult::Success),
            "FAIL" => Some(AttemptResult::Fail),
            _ => None,
        }
    }
}

/// Why a failed attempt failed. `None` for successful attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailReason {
    None,
    InvalidPw,
    Locked,
    OtpFail,
    #[serde(untagged)]
    Other(String),
}

impl FailReason {
    pub fn as_str(&self) -> &str {
        match self {
            FailReason::None => "NONE",
            FailReason::InvalidPw => "INVALID_PW",
            FailReason::Locked => "LOCKED",
            FailReason::OtpFail => "OTP_FAIL",
            FailReason::Other(reason) => reason,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "" | "NONE" => FailReason::None,
            "INVALID_PW" => FailReason::InvalidPw,
            "LOCKED" => FailReason::Locked,
            "OTP_FAIL" => FailReason::OtpFail,
            other => FailReason::Other(other.to_string()),
        }
    }
}

/// One immutable authentication attempt as recorded by the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub channel: Channel,
    pub user_hash: String,
    pub ip: String,
    pub user_agent: String,
    pub fingerprint: String,
    pub result: AttemptResult,
    pub fail_reason: FailReason,
    pub latency_ms: u32,
}

impl AttemptRecord {
    pub fn is_failure(&self) -> bool {
        self.result == AttemptResult::Fail
    }
}

/// Read access to the append-only attempt log.
///
/// Implementations return every record with `timestamp >= since`, in no
/// particular order. An empty window is `Ok(vec![])`, and rows that cannot
/// be decoded are skipped rather than failing the read.
pub trait EventSource: Send + Sync {
    fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>, StoreError>;
}
