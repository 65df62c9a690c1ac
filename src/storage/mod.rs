//! SQLite storage layer -- the append-only attempt log.

pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use thiserror::Error;
use tracing::debug;

use crate::events::{AttemptRecord, AttemptResult, Channel, EventSource, FailReason};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool, StoreError> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            // Best effort: a missing directory surfaces as an open error below.
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// Single-connection in-memory pool, for tests and one-shot tooling.
pub fn open_memory_pool() -> Result<Pool, StoreError> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// Canonical on-disk timestamp form. Fixed width, so text comparison in SQL
/// agrees with chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Append one attempt to the log.
pub fn insert_attempt(pool: &Pool, record: &AttemptRecord) -> Result<(), StoreError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO login_events
            (ts, channel, user_hash, ip, ua, fingerprint, result, fail_reason, latency_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            format_ts(record.timestamp),
            record.channel.as_str(),
            record.user_hash,
            record.ip,
            record.user_agent,
            record.fingerprint,
            record.result.as_str(),
            record.fail_reason.as_str(),
            record.latency_ms,
        ],
    )?;
    Ok(())
}

/// Raw row, before validation.
struct RawRow {
    ts: Option<String>,
    channel: Option<String>,
    user_hash: Option<String>,
    ip: Option<String>,
    ua: Option<String>,
    fingerprint: Option<String>,
    result: Option<String>,
    fail_reason: Option<String>,
    latency_ms: Option<i64>,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        // Column type mismatches decode as None and are rejected in `into_record`.
        Ok(Self {
            ts: row.get::<_, Option<String>>(0).ok().flatten(),
            channel: row.get::<_, Option<String>>(1).ok().flatten(),
            user_hash: row.get::<_, Option<String>>(2).ok().flatten(),
            ip: row.get::<_, Option<String>>(3).ok().flatten(),
            ua: row.get::<_, Option<String>>(4).ok().flatten(),
            fingerprint: row.get::<_, Option<String>>(5).ok().flatten(),
            result: row.get::<_, Option<String>>(6).ok().flatten(),
            fail_reason: row.get::<_, Option<String>>(7).ok().flatten(),
            latency_ms: row.get::<_, Option<i64>>(8).ok().flatten(),
        })
    }

    fn into_record(self) -> Option<AttemptRecord> {
        let timestamp = DateTime::parse_from_rfc3339(self.ts?.trim())
            .ok()?
            .with_timezone(&Utc);
        let result = AttemptResult::parse(self.result?.trim())?;
        let latency_ms = u32::try_from(self.latency_ms?).ok()?;

        Some(AttemptRecord {
            timestamp,
            channel: Channel::parse(self.channel.as_deref().unwrap_or("")),
            user_hash: self.user_hash.unwrap_or_default(),
            ip: self.ip.unwrap_or_default(),
            user_agent: self.ua.unwrap_or_default(),
            fingerprint: self.fingerprint.unwrap_or_default(),
            result,
            fail_reason: FailReason::parse(self.fail_reason.as_deref().unwrap_or("")),
            latency_ms,
        })
    }
}

/// [`EventSource`] over the `login_events` table.
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: Pool,
}

impl SqliteEventStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl EventSource for SqliteEventStore {
    fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT ts, channel, user_hash, ip, ua, fingerprint, result, fail_reason, latency_ms
             FROM login_events
             WHERE ts >= ?1",
        )?;

        let rows = stmt.query_map(params![format_ts(since)], RawRow::from_row)?;

        let mut records = Vec::new();
        let mut dropped = 0usize;
        for row in rows {
            match row?.into_record() {
                // Text comparison admits odd-but-valid spellings; re-check on the parsed instant.
                Some(record) if record.timestamp >= since => records.push(record),
                Some(_) => {}
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            debug!(dropped, "skipped malformed login_events rows");
        }
        Ok(records)
    }
}
