// ABOUTME: Append-only transcript log access and chat.history windowing.
// ABOUTME: Count cap (default 200, max 1000) and a serialized-byte budget enforced together.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Window applied when the caller gives no limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;
/// Upper bound on a caller-specified limit.
pub const MAX_HISTORY_LIMIT: usize = 1000;
/// Serialized-byte budget for one history response.
pub const HISTORY_BYTE_BUDGET: usize = 6 * 1024 * 1024;

/// One transcript message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub role: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(role: &str, body: &str) -> Self {
        Self {
            role: role.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// External transcript storage, consumed as an append-only log keyed by
/// session id. The storage format itself is outside the coordinator.
pub trait TranscriptLog: Send + Sync {
    fn append(&self, session_id: &str, entry: &TranscriptEntry) -> Result<()>;

    /// The most recent `limit` entries, oldest first.
    fn read_recent(&self, session_id: &str, limit: usize) -> Result<Vec<TranscriptEntry>>;
}

/// SQLite-backed transcript log, sharing the session store's connection.
pub struct SqliteTranscript {
    db: Arc<Mutex<Connection>>,
}

impl SqliteTranscript {
    /// Wrap an existing connection, creating the transcript table if needed.
    pub fn new(db: Arc<Mutex<Connection>>) -> Result<Self> {
        {
            let conn = db.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "CREATE TABLE IF NOT EXISTS transcript (
                    session_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    role TEXT NOT NULL,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, seq)
                )",
                [],
            )?;
        }
        Ok(Self { db })
    }

    /// Open a standalone transcript database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn =
            Connection::open(db_path.as_ref()).context("Failed to open transcript database")?;
        Self::new(Arc::new(Mutex::new(conn)))
    }
}

impl TranscriptLog for SqliteTranscript {
    fn append(&self, session_id: &str, entry: &TranscriptEntry) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let next_seq: i64 = db.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM transcript WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        db.execute(
            "INSERT INTO transcript (session_id, seq, role, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                next_seq,
                entry.role,
                entry.body,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn read_recent(&self, session_id: &str, limit: usize) -> Result<Vec<TranscriptEntry>> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = db.prepare(
            "SELECT role, body, created_at FROM transcript
             WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let mut entries = stmt
            .query_map(params![session_id, limit as i64], |row| {
                let created_at: String = row.get(2)?;
                Ok(TranscriptEntry {
                    role: row.get(0)?,
                    body: row.get(1)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }
}

/// Clamp the caller-specified limit to the allowed window.
pub fn effective_limit(requested: Option<usize>) -> usize {
    match requested {
        Some(0) => DEFAULT_HISTORY_LIMIT,
        Some(n) => n.min(MAX_HISTORY_LIMIT),
        None => DEFAULT_HISTORY_LIMIT,
    }
}

/// Enforce the serialized-byte budget by trimming from the oldest end of an
/// already count-limited window. Entries are oldest first.
pub fn trim_to_byte_budget(entries: Vec<TranscriptEntry>, budget: usize) -> Vec<TranscriptEntry> {
    let sizes: Vec<usize> = entries
        .iter()
        .map(|e| serde_json::to_string(e).map(|s| s.len()).unwrap_or(0))
        .collect();
    let mut total: usize = sizes.iter().sum();
    let mut start = 0;
    while total > budget && start < entries.len() {
        total -= sizes[start];
        start += 1;
    }
    entries.into_iter().skip(start).collect()
}
