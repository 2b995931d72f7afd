// ABOUTME: In-memory run registry keyed by (session key, idempotency key).
// ABOUTME: Owns run status transitions, cancel tokens, and retained terminal results.

use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use turngate_engine::TurnResult;

/// Run status machine. Terminal states are reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    InFlight,
    Ok,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Error | Self::Aborted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::InFlight => write!(f, "in_flight"),
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Terminal result retained for replay to retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Ok(TurnResult),
    Error(GatewayError),
}

/// Point-in-time view of a run record.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run_id: String,
    pub session_key: String,
    pub status: RunStatus,
    pub result: Option<RunOutcome>,
    pub created_at: DateTime<Utc>,
}

struct Slot {
    session_key: String,
    status: RunStatus,
    cancel: Option<CancellationToken>,
    result: Option<RunOutcome>,
    created_at: DateTime<Utc>,
    status_tx: watch::Sender<RunStatus>,
}

impl Slot {
    fn snapshot(&self, run_id: &str) -> RunSnapshot {
        RunSnapshot {
            run_id: run_id.to_string(),
            session_key: self.session_key.clone(),
            status: self.status,
            result: self.result.clone(),
            created_at: self.created_at,
        }
    }
}

type RunKey = (String, String);

/// One registry instance per process. Terminal records are retained for the
/// process lifetime so retries replay the cached result instead of re-running.
pub struct RunRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<RunKey, Slot>,
    by_run_id: HashMap<String, RunKey>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Look up an existing record or create one in `Started` with a fresh
    /// cancel token. Returns the snapshot and whether it was created.
    pub fn admit(&self, session_key: &str, idempotency_key: &str) -> (RunSnapshot, bool) {
        let key = (session_key.to_string(), idempotency_key.to_string());
        let mut inner = self.lock();

        if let Some(slot) = inner.runs.get(&key) {
            return (slot.snapshot(idempotency_key), false);
        }

        let (status_tx, _) = watch::channel(RunStatus::Started);
        let slot = Slot {
            session_key: session_key.to_string(),
            status: RunStatus::Started,
            cancel: Some(CancellationToken::new()),
            result: None,
            created_at: Utc::now(),
            status_tx,
        };
        let snapshot = slot.snapshot(idempotency_key);
        inner.by_run_id.insert(idempotency_key.to_string(), key.clone());
        inner.runs.insert(key, slot);
        (snapshot, true)
    }

    pub fn get(&self, session_key: &str, idempotency_key: &str) -> Option<RunSnapshot> {
        let key = (session_key.to_string(), idempotency_key.to_string());
        self.lock()
            .runs
            .get(&key)
            .map(|slot| slot.snapshot(idempotency_key))
    }

    pub fn get_by_run_id(&self, run_id: &str) -> Option<RunSnapshot> {
        let inner = self.lock();
        let key = inner.by_run_id.get(run_id)?;
        inner.runs.get(key).map(|slot| slot.snapshot(run_id))
    }

    /// Clone the cancel token of a non-terminal run.
    pub fn cancel_token(&self, session_key: &str, run_id: &str) -> Option<CancellationToken> {
        let key = (session_key.to_string(), run_id.to_string());
        let inner = self.lock();
        let slot = inner.runs.get(&key)?;
        if slot.status.is_terminal() {
            return None;
        }
        slot.cancel.clone()
    }

    /// Transition `Started` -> `InFlight`. False if the run is in any other
    /// state (e.g. aborted while queued).
    pub fn try_begin(&self, session_key: &str, run_id: &str) -> bool {
        self.transition(session_key, run_id, |slot| {
            if slot.status == RunStatus::Started {
                slot.status = RunStatus::InFlight;
                true
            } else {
                false
            }
        })
    }

    /// Abort a run that has not begun executing (`Started` -> `Aborted`).
    pub fn try_abort_queued(&self, session_key: &str, run_id: &str) -> bool {
        self.transition(session_key, run_id, |slot| {
            if slot.status == RunStatus::Started {
                slot.status = RunStatus::Aborted;
                slot.cancel = None;
                true
            } else {
                false
            }
        })
    }

    /// Fire the cancel token of a non-terminal run without changing status.
    /// The terminal `Aborted` transition lands when the invocation unwinds.
    pub fn signal_cancel(&self, session_key: &str, run_id: &str) -> bool {
        let key = (session_key.to_string(), run_id.to_string());
        let inner = self.lock();
        match inner.runs.get(&key) {
            Some(slot) if !slot.status.is_terminal() => {
                if let Some(ref cancel) = slot.cancel {
                    cancel.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Apply the terminal transition exactly once. Returns the final status,
    /// or None if the run was already terminal (a late completion racing an
    /// abort must not resurrect a non-aborted status).
    pub fn finish(
        &self,
        session_key: &str,
        run_id: &str,
        status: RunStatus,
        result: Option<RunOutcome>,
    ) -> Option<RunStatus> {
        debug_assert!(status.is_terminal());
        let key = (session_key.to_string(), run_id.to_string());
        let mut inner = self.lock();
        let slot = inner.runs.get_mut(&key)?;
        if slot.status.is_terminal() {
            return None;
        }
        slot.status = status;
        slot.result = result;
        slot.cancel = None;
        let _ = slot.status_tx.send(status);
        Some(status)
    }

    /// All non-terminal runs for a session, oldest first.
    pub fn non_terminal_for_session(&self, session_key: &str) -> Vec<RunSnapshot> {
        let inner = self.lock();
        let mut runs: Vec<RunSnapshot> = inner
            .runs
            .iter()
            .filter(|((sk, _), slot)| sk == session_key && !slot.status.is_terminal())
            .map(|((_, rid), slot)| slot.snapshot(rid))
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Watch a run's status transitions. None for unknown run ids.
    pub fn watch(&self, run_id: &str) -> Option<watch::Receiver<RunStatus>> {
        let inner = self.lock();
        let key = inner.by_run_id.get(run_id)?;
        inner.runs.get(key).map(|slot| slot.status_tx.subscribe())
    }

    fn transition<F>(&self, session_key: &str, run_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Slot) -> bool,
    {
        let key = (session_key.to_string(), run_id.to_string());
        let mut inner = self.lock();
        let Some(slot) = inner.runs.get_mut(&key) else {
            return false;
        };
        let applied = f(slot);
        if applied {
            let status = slot.status;
            let _ = slot.status_tx.send(status);
        }
        applied
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}
