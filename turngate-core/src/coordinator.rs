// ABOUTME: Run coordinator - admission, turn invocation, abort, and completion bookkeeping.
// ABOUTME: The only component allowed to start or cancel a turn.

use crate::bus::EventBus;
use crate::error::{ErrorCode, GatewayError};
use crate::metrics;
use crate::mux::ActiveRun;
use crate::policy::{PolicyDecision, RouteInfo, SendPolicy};
use crate::registry::{RunOutcome, RunRegistry, RunSnapshot, RunStatus};
use crate::session::{SessionStore, ThinkingLevel};
use crate::transcript::{
    effective_limit, trim_to_byte_budget, TranscriptEntry, TranscriptLog, HISTORY_BYTE_BUDGET,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use turngate_engine::{EventPayload, LifecyclePhase, TurnEngine, TurnRequest};

/// How many turns may wait behind the executing one on a single session.
const SESSION_QUEUE_CAP: usize = 8;

/// Result of an admission decision.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmitOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Present when replaying a retained terminal result.
    pub result: Option<RunOutcome>,
}

/// Result of an abort request.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortOutcome {
    pub aborted: bool,
    pub run_ids: Vec<String>,
}

/// Result of a history fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryResult {
    pub session_id: String,
    pub messages: Vec<TranscriptEntry>,
    pub thinking_level: ThinkingLevel,
}

struct QueuedRun {
    run_id: String,
    request: TurnRequest,
}

#[derive(Default)]
struct SessionQueue {
    pending: VecDeque<QueuedRun>,
    draining: bool,
}

/// Orchestrates admission, turn invocation, registry bookkeeping, and
/// session-store updates.
///
/// Within one session key turns are strictly serialized by a FIFO queue; any
/// number of turns across different sessions run concurrently. The
/// coordinator never blocks while a turn runs - the per-session drain task
/// suspends cooperatively on the engine call.
pub struct RunCoordinator {
    engine: Arc<dyn TurnEngine>,
    bus: Arc<EventBus>,
    registry: Arc<RunRegistry>,
    sessions: Arc<SessionStore>,
    transcript: Arc<dyn TranscriptLog>,
    default_policy: SendPolicy,
    queues: Mutex<HashMap<String, SessionQueue>>,
}

impl RunCoordinator {
    pub fn new(
        engine: Arc<dyn TurnEngine>,
        bus: Arc<EventBus>,
        registry: Arc<RunRegistry>,
        sessions: Arc<SessionStore>,
        transcript: Arc<dyn TranscriptLog>,
        default_policy: SendPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            bus,
            registry,
            sessions,
            transcript,
            default_policy,
            queues: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// True for inbound control messages equivalent to an explicit abort.
    /// These must never be treated as a new turn.
    pub fn is_stop_message(message: &str) -> bool {
        message.trim().eq_ignore_ascii_case("/stop")
    }

    /// Admit a chat/agent request.
    ///
    /// A retry of an already-observed `(session_key, idempotency_key)` pair
    /// replays the record's current status (and retained terminal result)
    /// without starting anything. New requests on a busy session queue FIFO
    /// behind the executing run; the conflict signal fires when the queue is
    /// full.
    pub async fn admit(
        self: &Arc<Self>,
        session_key: &str,
        idempotency_key: &str,
        mut request: TurnRequest,
    ) -> Result<AdmitOutcome, GatewayError> {
        if session_key.is_empty() {
            return Err(GatewayError::invalid_request("sessionKey is required"));
        }
        if idempotency_key.is_empty() {
            return Err(GatewayError::invalid_request("idempotencyKey is required"));
        }

        // Replay path: same logical request is safe to resend any number of times.
        if let Some(existing) = self.registry.get(session_key, idempotency_key) {
            tracing::debug!(
                session_key = %session_key,
                run_id = %existing.run_id,
                status = %existing.status,
                "Admission replayed existing run"
            );
            return Ok(AdmitOutcome {
                run_id: existing.run_id,
                status: existing.status,
                result: existing.result,
            });
        }

        let entry = self.sessions.get_or_create(session_key).await;

        // Policy runs before admission; a deny creates no record.
        let policy = entry.send_policy.as_ref().unwrap_or(&self.default_policy);
        let route = RouteInfo::derive(session_key, entry.last_provider.as_deref());
        if let PolicyDecision::Deny(reason) = policy.evaluate(&route) {
            metrics::record_send_rejected("policy");
            tracing::info!(session_key = %session_key, reason = %reason, "Send blocked by policy");
            return Err(GatewayError::send_blocked(reason));
        }

        request.session_key = session_key.to_string();
        request.session_id = entry.session_id.clone();
        if request.model.is_none() {
            request.model = entry.model.clone();
        }
        if request.thinking_level.is_none() {
            request.thinking_level = Some(entry.thinking_level.to_string());
        }

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(session_key.to_string()).or_default();
        if queue.pending.len() >= SESSION_QUEUE_CAP {
            metrics::record_send_rejected("queue_full");
            return Err(GatewayError::conflict(format!(
                "session has {} queued turns; send blocked",
                queue.pending.len()
            )));
        }

        let (snapshot, created) = self.registry.admit(session_key, idempotency_key);
        if !created {
            // Lost a race with a concurrent identical request.
            return Ok(AdmitOutcome {
                run_id: snapshot.run_id,
                status: snapshot.status,
                result: snapshot.result,
            });
        }

        if let Err(e) = self.transcript.append(
            &entry.session_id,
            &TranscriptEntry::new("user", &request.message),
        ) {
            tracing::warn!(error = %e, session_key = %session_key, "Transcript append failed");
        }

        queue.pending.push_back(QueuedRun {
            run_id: idempotency_key.to_string(),
            request,
        });
        let start_drain = !queue.draining;
        if start_drain {
            queue.draining = true;
        }
        drop(queues);

        metrics::record_run_started();
        tracing::info!(
            session_key = %session_key,
            run_id = %idempotency_key,
            "Run admitted"
        );

        if start_drain {
            let coordinator = Arc::clone(self);
            let key = session_key.to_string();
            tokio::spawn(async move {
                coordinator.drain_session(&key).await;
            });
        }

        Ok(AdmitOutcome {
            run_id: idempotency_key.to_string(),
            status: RunStatus::Started,
            result: None,
        })
    }

    /// Abort one run (validated against its owning session) or every
    /// non-terminal run for a session.
    pub async fn abort(
        &self,
        session_key: &str,
        run_id: Option<&str>,
    ) -> Result<AbortOutcome, GatewayError> {
        match run_id {
            Some(run_id) => {
                let Some(snapshot) = self.registry.get_by_run_id(run_id) else {
                    return Ok(AbortOutcome {
                        aborted: false,
                        run_ids: Vec::new(),
                    });
                };
                if snapshot.session_key != session_key {
                    return Err(GatewayError::invalid_request(format!(
                        "runId {} does not belong to session {}",
                        run_id, session_key
                    )));
                }
                let aborted = self.abort_run(&snapshot).await;
                Ok(AbortOutcome {
                    aborted,
                    run_ids: if aborted {
                        vec![run_id.to_string()]
                    } else {
                        Vec::new()
                    },
                })
            }
            None => {
                let mut run_ids = Vec::new();
                for snapshot in self.registry.non_terminal_for_session(session_key) {
                    if self.abort_run(&snapshot).await {
                        run_ids.push(snapshot.run_id.clone());
                    }
                }
                Ok(AbortOutcome {
                    aborted: !run_ids.is_empty(),
                    run_ids,
                })
            }
        }
    }

    /// Wait for a run to reach a terminal status.
    pub async fn wait(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<RunSnapshot, GatewayError> {
        let Some(mut rx) = self.registry.watch(run_id) else {
            return Err(GatewayError::invalid_request(format!(
                "unknown runId: {}",
                run_id
            )));
        };

        let wait = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };

        if tokio::time::timeout(timeout, wait).await.is_err() {
            return Err(GatewayError::agent_timeout(format!(
                "run {} did not finish within {}ms",
                run_id,
                timeout.as_millis()
            )));
        }

        self.registry
            .get_by_run_id(run_id)
            .ok_or_else(|| GatewayError::unavailable("run record disappeared"))
    }

    /// Read-only history fetch. Applies the default window, the caller limit,
    /// and the serialized-byte budget together; honors the session's
    /// transcript override when set.
    pub async fn history(
        &self,
        session_key: &str,
        limit: Option<usize>,
    ) -> Result<HistoryResult, GatewayError> {
        if session_key.is_empty() {
            return Err(GatewayError::invalid_request("sessionKey is required"));
        }
        let entry = self.sessions.get_or_create(session_key).await;
        let transcript_id = entry
            .history_override
            .as_deref()
            .unwrap_or(&entry.session_id);

        let entries = self
            .transcript
            .read_recent(transcript_id, effective_limit(limit))
            .map_err(|e| GatewayError::unavailable(format!("history read failed: {}", e)))?;
        let messages = trim_to_byte_budget(entries, HISTORY_BYTE_BUDGET);

        Ok(HistoryResult {
            session_id: entry.session_id.clone(),
            messages,
            thinking_level: entry.thinking_level,
        })
    }

    /// Non-terminal runs across all sessions, for connect-time snapshots.
    pub fn active_runs(&self, session_keys: &[String]) -> Vec<ActiveRun> {
        session_keys
            .iter()
            .flat_map(|key| self.registry.non_terminal_for_session(key))
            .map(|snapshot| ActiveRun {
                run_id: snapshot.run_id,
                session_key: snapshot.session_key,
                status: snapshot.status,
            })
            .collect()
    }

    async fn abort_run(&self, snapshot: &RunSnapshot) -> bool {
        if snapshot.status.is_terminal() {
            return false;
        }

        // Queued runs abort immediately; they never reach the engine.
        if self
            .registry
            .try_abort_queued(&snapshot.session_key, &snapshot.run_id)
        {
            let mut queues = self.queues.lock().await;
            if let Some(queue) = queues.get_mut(&snapshot.session_key) {
                queue.pending.retain(|r| r.run_id != snapshot.run_id);
            }
            drop(queues);

            self.bus.publish(
                &snapshot.run_id,
                &snapshot.session_key,
                EventPayload::Lifecycle {
                    phase: LifecyclePhase::Aborted,
                    result: None,
                    error: None,
                },
            );
            self.bus.retire_run(&snapshot.run_id);
            metrics::record_run_finished("aborted");
            tracing::info!(
                session_key = %snapshot.session_key,
                run_id = %snapshot.run_id,
                "Queued run aborted"
            );
            return true;
        }

        // In-flight: raise the signal and return; the terminal transition and
        // the aborted event land when the invocation unwinds.
        let signalled = self
            .registry
            .signal_cancel(&snapshot.session_key, &snapshot.run_id);
        if signalled {
            tracing::info!(
                session_key = %snapshot.session_key,
                run_id = %snapshot.run_id,
                "Abort signalled for in-flight run"
            );
        }
        signalled
    }

    async fn drain_session(self: &Arc<Self>, session_key: &str) {
        loop {
            let next = {
                let mut queues = self.queues.lock().await;
                let Some(queue) = queues.get_mut(session_key) else {
                    break;
                };
                match queue.pending.pop_front() {
                    Some(run) => run,
                    None => {
                        queue.draining = false;
                        queues.remove(session_key);
                        break;
                    }
                }
            };
            self.execute_run(session_key, next).await;
        }
    }

    async fn execute_run(&self, session_key: &str, queued: QueuedRun) {
        let QueuedRun { run_id, request } = queued;

        // Aborted while queued; the abort path already published the event.
        if !self.registry.try_begin(session_key, &run_id) {
            return;
        }

        let Some(cancel) = self.registry.cancel_token(session_key, &run_id) else {
            return;
        };

        self.bus.publish(
            &run_id,
            session_key,
            EventPayload::Lifecycle {
                phase: LifecyclePhase::Start,
                result: None,
                error: None,
            },
        );

        let (event_tx, mut event_rx) = mpsc::channel::<EventPayload>(256);
        let pipe = {
            let bus = Arc::clone(&self.bus);
            let run_id = run_id.clone();
            let session_key = session_key.to_string();
            tokio::spawn(async move {
                while let Some(payload) = event_rx.recv().await {
                    bus.publish(&run_id, &session_key, payload);
                }
            })
        };

        let started_at = std::time::Instant::now();
        let outcome = self
            .engine
            .run_turn(request.clone(), event_tx, cancel.clone())
            .await;
        // All streamed events are on the bus before the terminal lifecycle event.
        let _ = pipe.await;
        metrics::record_turn_duration(started_at.elapsed().as_secs_f64());

        if cancel.is_cancelled() {
            if self
                .registry
                .finish(session_key, &run_id, RunStatus::Aborted, None)
                .is_some()
            {
                self.bus.publish(
                    &run_id,
                    session_key,
                    EventPayload::Lifecycle {
                        phase: LifecyclePhase::Aborted,
                        result: None,
                        error: None,
                    },
                );
                metrics::record_run_finished("aborted");
                tracing::info!(session_key = %session_key, run_id = %run_id, "Run aborted");
            }
            self.bus.retire_run(&run_id);
            return;
        }

        match outcome {
            Ok(result) => {
                // Bookkeeping lands before the terminal transition so anyone
                // released by wait() observes the saved session and transcript.
                // The run's own route save; admin actions never touch these
                // fields concurrently.
                let deliver = request.deliver.clone();
                let usage = result.usage;
                let model = result.model.clone();
                self.sessions
                    .save(session_key, move |entry| {
                        if let Some(deliver) = deliver {
                            entry.last_provider = Some(deliver.provider);
                            entry.last_destination = Some(deliver.to);
                        }
                        if let Some(usage) = usage {
                            entry.input_tokens += usage.input_tokens;
                            entry.output_tokens += usage.output_tokens;
                        }
                        if let Some(model) = model {
                            entry.model = Some(model);
                        }
                    })
                    .await;

                if let Err(e) = self.transcript.append(
                    &request.session_id,
                    &TranscriptEntry::new("assistant", &result.text),
                ) {
                    tracing::warn!(error = %e, "Transcript append failed");
                }

                let applied = self.registry.finish(
                    session_key,
                    &run_id,
                    RunStatus::Ok,
                    Some(RunOutcome::Ok(result.clone())),
                );
                if applied.is_some() {
                    self.bus.publish(
                        &run_id,
                        session_key,
                        EventPayload::Lifecycle {
                            phase: LifecyclePhase::End,
                            result: Some(result),
                            error: None,
                        },
                    );
                    metrics::record_run_finished("ok");
                    tracing::info!(session_key = %session_key, run_id = %run_id, "Run completed");
                }
            }
            Err(e) => {
                let message = e.to_string();
                let stored = GatewayError::new(ErrorCode::Unavailable, message.clone());
                let applied = self.registry.finish(
                    session_key,
                    &run_id,
                    RunStatus::Error,
                    Some(RunOutcome::Error(stored)),
                );
                if applied.is_some() {
                    self.bus.publish(
                        &run_id,
                        session_key,
                        EventPayload::Lifecycle {
                            phase: LifecyclePhase::Error,
                            result: None,
                            error: Some(message.clone()),
                        },
                    );
                    metrics::record_run_finished("error");
                    tracing::error!(
                        session_key = %session_key,
                        run_id = %run_id,
                        error = %message,
                        "Run failed"
                    );
                }
            }
        }

        self.bus.retire_run(&run_id);
    }
}
