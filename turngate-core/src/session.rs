// ABOUTME: Durable session store - routing and runtime metadata per session key.
// ABOUTME: SQLite snapshot with an in-memory cache; saves apply in call order, last writer wins.

use crate::policy::SendPolicy;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Reasoning effort requested for a session's turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for ThinkingLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => anyhow::bail!("Unknown thinking level: {}", s),
        }
    }
}

/// Whether tool activity is relayed to subscribers of this session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerboseLevel {
    Off,
    #[default]
    On,
}

impl std::fmt::Display for VerboseLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::On => write!(f, "on"),
        }
    }
}

impl std::str::FromStr for VerboseLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "on" => Ok(Self::On),
            _ => anyhow::bail!("Unknown verbose level: {}", s),
        }
    }
}

/// One entry per session key.
///
/// `updated_at` is monotonically non-decreasing. `last_provider` and
/// `last_destination` are written only on successful delivery, never
/// speculatively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_key: String,
    /// Opaque handle into the external transcript log.
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_destination: Option<String>,
    pub thinking_level: ThinkingLevel,
    pub verbose_level: VerboseLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Per-session send-policy override; the configured default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_policy: Option<SendPolicy>,
    /// Alternate transcript id taking precedence in chat.history (e.g. after a fork).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_override: Option<String>,
}

impl SessionEntry {
    fn new(session_key: &str) -> Self {
        Self {
            session_key: session_key.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            updated_at: Utc::now(),
            last_provider: None,
            last_destination: None,
            thinking_level: ThinkingLevel::default(),
            verbose_level: VerboseLevel::default(),
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            send_policy: None,
            history_override: None,
        }
    }
}

/// Durable key -> SessionEntry map.
///
/// The in-memory cache is authoritative: mutations apply in call order under
/// the cache lock, and each save carries an epoch so a slow disk write can
/// never overwrite a newer one. Persistence failures are logged and do not
/// roll back in-memory state.
pub struct SessionStore {
    db: Arc<Mutex<Connection>>,
    cache: tokio::sync::Mutex<HashMap<String, SessionEntry>>,
    next_epoch: AtomicU64,
    applied: Arc<Mutex<HashMap<String, u64>>>,
}

impl SessionStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).context("Failed to open SQLite database")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_key TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_provider TEXT,
                last_destination TEXT,
                thinking_level TEXT NOT NULL,
                verbose_level TEXT NOT NULL,
                model TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                send_policy TEXT,
                history_override TEXT
            )",
            [],
        )?;

        let mut cache = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT session_key, session_id, updated_at, last_provider, last_destination,
                        thinking_level, verbose_level, model, input_tokens, output_tokens,
                        send_policy, history_override
                 FROM sessions",
            )?;
            let rows = stmt.query_map([], row_to_entry)?;
            for row in rows {
                let entry = row?;
                cache.insert(entry.session_key.clone(), entry);
            }
        }

        tracing::info!(sessions = cache.len(), "SessionStore loaded");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            cache: tokio::sync::Mutex::new(cache),
            next_epoch: AtomicU64::new(1),
            applied: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Share the database connection with sibling stores (transcript log).
    pub fn db_connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    pub async fn get(&self, session_key: &str) -> Option<SessionEntry> {
        self.cache.lock().await.get(session_key).cloned()
    }

    /// Get the entry, creating and persisting a fresh one on first use.
    pub async fn get_or_create(&self, session_key: &str) -> SessionEntry {
        if let Some(entry) = self.get(session_key).await {
            return entry;
        }
        self.save(session_key, |_| {}).await
    }

    /// Read-modify-write. The mutator runs under the cache lock, so
    /// concurrent saves for one key apply in call order; the epoch guard
    /// makes the last call issued determine the final persisted state even
    /// when disk writes complete out of order.
    pub async fn save<F>(&self, session_key: &str, mutator: F) -> SessionEntry
    where
        F: FnOnce(&mut SessionEntry),
    {
        let (snapshot, epoch) = {
            let mut cache = self.cache.lock().await;
            let entry = cache
                .entry(session_key.to_string())
                .or_insert_with(|| SessionEntry::new(session_key));
            mutator(entry);
            let now = Utc::now();
            if now > entry.updated_at {
                entry.updated_at = now;
            }
            (entry.clone(), self.next_epoch.fetch_add(1, Ordering::SeqCst))
        };

        self.persist(snapshot.clone(), epoch).await;
        snapshot
    }

    /// Generate a fresh transcript handle for the session.
    pub async fn reset(&self, session_key: &str) -> SessionEntry {
        let new_session_id = uuid::Uuid::new_v4().to_string();
        let entry = self
            .save(session_key, |entry| {
                entry.session_id = new_session_id.clone();
                entry.history_override = None;
            })
            .await;
        tracing::info!(
            session_key = %session_key,
            new_session_id = %entry.session_id,
            "Session reset"
        );
        entry
    }

    pub async fn delete(&self, session_key: &str) -> Result<bool> {
        let existed = self.cache.lock().await.remove(session_key).is_some();
        let db = Arc::clone(&self.db);
        let key = session_key.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let db = db.lock().unwrap_or_else(|e| e.into_inner());
            db.execute("DELETE FROM sessions WHERE session_key = ?1", params![key])
        })
        .await
        .context("session delete task panicked")?;
        result.context("Failed to delete session row")?;
        if existed {
            tracing::info!(session_key = %session_key, "Session deleted");
        }
        Ok(existed)
    }

    pub async fn list(&self) -> Vec<SessionEntry> {
        let cache = self.cache.lock().await;
        let mut entries: Vec<SessionEntry> = cache.values().cloned().collect();
        entries.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        entries
    }

    async fn persist(&self, entry: SessionEntry, epoch: u64) {
        let db = Arc::clone(&self.db);
        let applied = Arc::clone(&self.applied);

        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            // Epoch check and row write stay under one lock so an older
            // snapshot can never land after a newer one.
            let mut applied = applied.lock().unwrap_or_else(|e| e.into_inner());
            let last = applied.get(&entry.session_key).copied().unwrap_or(0);
            if epoch < last {
                return Ok(());
            }

            let send_policy = entry
                .send_policy
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("Failed to serialize send policy")?;

            let db = db.lock().unwrap_or_else(|e| e.into_inner());
            db.execute(
                "INSERT INTO sessions (session_key, session_id, updated_at, last_provider,
                    last_destination, thinking_level, verbose_level, model, input_tokens,
                    output_tokens, send_policy, history_override)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(session_key) DO UPDATE SET
                    session_id = ?2, updated_at = ?3, last_provider = ?4,
                    last_destination = ?5, thinking_level = ?6, verbose_level = ?7,
                    model = ?8, input_tokens = ?9, output_tokens = ?10,
                    send_policy = ?11, history_override = ?12",
                params![
                    entry.session_key,
                    entry.session_id,
                    entry.updated_at.to_rfc3339(),
                    entry.last_provider,
                    entry.last_destination,
                    entry.thinking_level.to_string(),
                    entry.verbose_level.to_string(),
                    entry.model,
                    entry.input_tokens as i64,
                    entry.output_tokens as i64,
                    send_policy,
                    entry.history_override,
                ],
            )?;
            applied.insert(entry.session_key.clone(), epoch);
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // In-memory state is authoritative; a failed write is not rolled back.
                tracing::warn!(error = %e, "Session store write failed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session store write task panicked");
            }
        }
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<SessionEntry> {
    let updated_at: String = row.get(2)?;
    let thinking: String = row.get(5)?;
    let verbose: String = row.get(6)?;
    let send_policy: Option<String> = row.get(10)?;

    Ok(SessionEntry {
        session_key: row.get(0)?,
        session_id: row.get(1)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        last_provider: row.get(3)?,
        last_destination: row.get(4)?,
        thinking_level: thinking.parse().unwrap_or_default(),
        verbose_level: verbose.parse().unwrap_or_default(),
        model: row.get(7)?,
        input_tokens: row.get::<_, i64>(8)? as u64,
        output_tokens: row.get::<_, i64>(9)? as u64,
        send_policy: send_policy.and_then(|s| serde_json::from_str(&s).ok()),
        history_override: row.get(11)?,
    })
}
