// ABOUTME: Process-wide event bus with per-run monotonic sequence stamping.
// ABOUTME: Constructed once by the composition root and passed by reference; never global.

use crate::metrics;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use turngate_engine::{AgentEvent, EventPayload};

/// Append-only stream of agent events keyed by run id.
///
/// `publish` stamps each event with a per-run `seq` (monotonic, starting at 0,
/// never reused) and broadcasts it. Any number of independent subscribers may
/// listen; publishing with no subscribers is not an error.
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
    seqs: Mutex<HashMap<String, u64>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    /// Stamp and broadcast one event. Returns the stamped sequence number.
    pub fn publish(&self, run_id: &str, session_key: &str, payload: EventPayload) -> u64 {
        let seq = {
            let mut seqs = self.seqs.lock().unwrap_or_else(|e| e.into_inner());
            let counter = seqs.entry(run_id.to_string()).or_insert(0);
            let seq = *counter;
            *counter += 1;
            seq
        };

        let event = AgentEvent {
            run_id: run_id.to_string(),
            session_key: session_key.to_string(),
            seq,
            timestamp: Utc::now(),
            payload,
        };

        metrics::record_event_published();
        // Ignore send errors (no receivers connected)
        let _ = self.tx.send(event);
        seq
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Drop the sequence counter for a retired run. The run id must never be
    /// published again afterwards.
    pub fn retire_run(&self, run_id: &str) {
        self.seqs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
