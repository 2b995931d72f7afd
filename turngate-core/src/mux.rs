// ABOUTME: Per-connection event multiplexer projecting bus events into client frames.
// ABOUTME: Tracks finalized runs so stray events after abort/final never reach the client.

use crate::metrics;
use crate::registry::RunStatus;
use crate::session::VerboseLevel;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use turngate_engine::{AgentEvent, CompactionPhase, EventPayload, LifecyclePhase, ToolPhase};

/// Session-scoped projection state of one run's chat stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Delta,
    Final,
    Aborted,
    Error,
}

/// Chat-facing projection of an agent event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub run_id: String,
    pub session_key: String,
    pub state: ChatState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full tool activity, forwarded on its own channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolFrame {
    pub run_id: String,
    pub session_key: String,
    pub phase: ToolPhase,
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
}

/// Plain-text tool summary relayed when full tool events are suppressed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSummary {
    pub run_id: String,
    pub session_key: String,
    pub text: String,
}

/// Transcript compaction notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionFrame {
    pub run_id: String,
    pub session_key: String,
    pub phase: CompactionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A run visible in the connect-time snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRun {
    pub run_id: String,
    pub session_key: String,
    pub status: RunStatus,
}

/// Initial state handed to a (re)connecting client. Reconciliation happens
/// via an explicit history fetch, not by replaying missed events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFrame {
    pub active_runs: Vec<ActiveRun>,
}

/// One frame bound for a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Chat(ChatEvent),
    Tool(ToolFrame),
    ToolSummary(ToolSummary),
    Compaction(CompactionFrame),
    Snapshot(SnapshotFrame),
}

impl Frame {
    /// Event name used on the wire by both transports.
    pub fn event_name(&self) -> &'static str {
        match self {
            Frame::Chat(_) => "chat",
            Frame::Tool(_) => "tool",
            Frame::ToolSummary(_) => "tool.summary",
            Frame::Compaction(_) => "compaction",
            Frame::Snapshot(_) => "snapshot",
        }
    }

    /// Wire payload without the internal `kind` discriminator; the transport
    /// envelope already names the event.
    pub fn payload(&self) -> Value {
        let result = match self {
            Frame::Chat(c) => serde_json::to_value(c),
            Frame::Tool(t) => serde_json::to_value(t),
            Frame::ToolSummary(s) => serde_json::to_value(s),
            Frame::Compaction(c) => serde_json::to_value(c),
            Frame::Snapshot(s) => serde_json::to_value(s),
        };
        result.unwrap_or(Value::Null)
    }
}

/// A frame stamped with the connection-local sequence and state version.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub seq: u64,
    pub state_version: u64,
    pub frame: Frame,
}

struct Subscription {
    /// Restrict delivery to one run when set.
    run_filter: Option<String>,
    verbose: VerboseLevel,
    always_summarize: bool,
}

/// Per-connection multiplexer.
///
/// The connection-local `seq` is monotonic across every delivered frame; the
/// coarse `state_version` bumps on run lifecycle boundaries. Ordering, not
/// losslessness, is the obligation to a reconnecting client.
pub struct ConnectionMux {
    connection_id: String,
    subs: HashMap<String, Subscription>,
    finalized: HashSet<String>,
    seq: u64,
    state_version: u64,
}

impl ConnectionMux {
    pub fn new(connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            subs: HashMap::new(),
            finalized: HashSet::new(),
            seq: 0,
            state_version: 0,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Subscribe this connection to a session, optionally to a single run.
    /// Re-subscribing replaces the previous subscription settings.
    pub fn subscribe(
        &mut self,
        session_key: &str,
        run_filter: Option<String>,
        verbose: VerboseLevel,
        always_summarize: bool,
    ) {
        self.subs.insert(
            session_key.to_string(),
            Subscription {
                run_filter,
                verbose,
                always_summarize,
            },
        );
        tracing::debug!(
            connection_id = %self.connection_id,
            session_key = %session_key,
            "Subscription updated"
        );
    }

    pub fn unsubscribe(&mut self, session_key: &str) {
        self.subs.remove(session_key);
    }

    pub fn is_subscribed(&self, session_key: &str) -> bool {
        self.subs.contains_key(session_key)
    }

    /// Project one bus event into at most one frame for this connection.
    pub fn observe(&mut self, event: &AgentEvent) -> Option<Delivery> {
        let (verbose, always_summarize) = {
            let sub = self.subs.get(&event.session_key)?;
            if let Some(ref filter) = sub.run_filter {
                if filter != &event.run_id {
                    return None;
                }
            }
            (sub.verbose, sub.always_summarize)
        };

        let finalized = self.finalized.contains(&event.run_id);

        let frame = match &event.payload {
            EventPayload::Assistant { text } => {
                if finalized {
                    return None;
                }
                Some(Frame::Chat(ChatEvent {
                    run_id: event.run_id.clone(),
                    session_key: event.session_key.clone(),
                    state: ChatState::Delta,
                    text: Some(text.clone()),
                    error: None,
                }))
            }

            EventPayload::Lifecycle {
                phase,
                result,
                error,
            } => {
                if finalized {
                    return None;
                }
                match phase {
                    LifecyclePhase::Start => {
                        self.state_version += 1;
                        None
                    }
                    LifecyclePhase::End => {
                        self.finalize(&event.run_id);
                        Some(Frame::Chat(ChatEvent {
                            run_id: event.run_id.clone(),
                            session_key: event.session_key.clone(),
                            state: ChatState::Final,
                            text: result.as_ref().map(|r| r.text.clone()),
                            error: None,
                        }))
                    }
                    LifecyclePhase::Error => {
                        self.finalize(&event.run_id);
                        Some(Frame::Chat(ChatEvent {
                            run_id: event.run_id.clone(),
                            session_key: event.session_key.clone(),
                            state: ChatState::Error,
                            text: None,
                            error: error.clone(),
                        }))
                    }
                    LifecyclePhase::Aborted => {
                        self.finalize(&event.run_id);
                        Some(Frame::Chat(ChatEvent {
                            run_id: event.run_id.clone(),
                            session_key: event.session_key.clone(),
                            state: ChatState::Aborted,
                            text: None,
                            error: None,
                        }))
                    }
                }
            }

            EventPayload::Tool {
                phase,
                id,
                name,
                input,
                output,
                ok,
            } => match verbose {
                VerboseLevel::On => Some(Frame::Tool(ToolFrame {
                    run_id: event.run_id.clone(),
                    session_key: event.session_key.clone(),
                    phase: *phase,
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    output: output.clone(),
                    ok: *ok,
                })),
                VerboseLevel::Off => {
                    if always_summarize && *phase == ToolPhase::Start {
                        Some(Frame::ToolSummary(ToolSummary {
                            run_id: event.run_id.clone(),
                            session_key: event.session_key.clone(),
                            text: summarize_tool(name, input.as_ref()),
                        }))
                    } else {
                        None
                    }
                }
            },

            EventPayload::Compaction { phase, reason } => Some(Frame::Compaction(CompactionFrame {
                run_id: event.run_id.clone(),
                session_key: event.session_key.clone(),
                phase: *phase,
                reason: reason.clone(),
            })),
        };

        frame.map(|frame| self.deliver(frame))
    }

    /// Build the connect-time snapshot frame.
    pub fn snapshot(&mut self, active_runs: Vec<ActiveRun>) -> Delivery {
        self.deliver(Frame::Snapshot(SnapshotFrame { active_runs }))
    }

    fn deliver(&mut self, frame: Frame) -> Delivery {
        self.seq += 1;
        metrics::record_frame_delivered(match &frame {
            Frame::Chat(_) => "chat",
            Frame::Tool(_) => "tool",
            Frame::ToolSummary(_) => "tool_summary",
            Frame::Compaction(_) => "compaction",
            Frame::Snapshot(_) => "snapshot",
        });
        Delivery {
            seq: self.seq,
            state_version: self.state_version,
            frame,
        }
    }

    fn finalize(&mut self, run_id: &str) {
        self.finalized.insert(run_id.to_string());
        self.state_version += 1;
    }
}

/// Best-effort one-line tool summary for suppressed tool channels.
fn summarize_tool(name: &str, input: Option<&Value>) -> String {
    let preview: String = input
        .and_then(Value::as_object)
        .and_then(|o| o.get("command").or(o.get("file_path")).or(o.get("pattern")))
        .and_then(Value::as_str)
        .map(|s| s.chars().take(50).collect())
        .unwrap_or_default();

    if preview.is_empty() {
        format!("Tool: {}", name)
    } else {
        format!("Tool: {} - {}", name, preview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(run_id: &str, session_key: &str, seq: u64, payload: EventPayload) -> AgentEvent {
        AgentEvent {
            run_id: run_id.to_string(),
            session_key: session_key.to_string(),
            seq,
            timestamp: Utc::now(),
            payload,
        }
    }

    fn subscribed_mux(session_key: &str) -> ConnectionMux {
        let mut mux = ConnectionMux::new("conn-1");
        mux.subscribe(session_key, None, VerboseLevel::On, false);
        mux
    }

    #[test]
    fn test_unsubscribed_session_ignored() {
        let mut mux = subscribed_mux("s1");
        let ev = event(
            "r1",
            "other",
            0,
            EventPayload::Assistant {
                text: "x".to_string(),
            },
        );
        assert!(mux.observe(&ev).is_none());
    }

    #[test]
    fn test_delta_then_final_with_local_seq() {
        let mut mux = subscribed_mux("s1");

        let d1 = mux
            .observe(&event(
                "r1",
                "s1",
                0,
                EventPayload::Assistant {
                    text: "hel".to_string(),
                },
            ))
            .unwrap();
        assert_eq!(d1.seq, 1);
        assert!(
            matches!(&d1.frame, Frame::Chat(c) if c.state == ChatState::Delta && c.text.as_deref() == Some("hel"))
        );

        let d2 = mux
            .observe(&event(
                "r1",
                "s1",
                1,
                EventPayload::Lifecycle {
                    phase: LifecyclePhase::End,
                    result: Some(turngate_engine::TurnResult {
                        text: "hello".to_string(),
                        model: None,
                        usage: None,
                    }),
                    error: None,
                },
            ))
            .unwrap();
        assert_eq!(d2.seq, 2);
        assert!(matches!(&d2.frame, Frame::Chat(c) if c.state == ChatState::Final));
    }

    #[test]
    fn test_finalized_run_drops_trailing_events() {
        let mut mux = subscribed_mux("s1");

        let aborted = mux
            .observe(&event(
                "r1",
                "s1",
                0,
                EventPayload::Lifecycle {
                    phase: LifecyclePhase::Aborted,
                    result: None,
                    error: None,
                },
            ))
            .unwrap();
        assert!(matches!(&aborted.frame, Frame::Chat(c) if c.state == ChatState::Aborted));

        // Trailing delta and a late natural completion are suppressed.
        assert!(mux
            .observe(&event(
                "r1",
                "s1",
                1,
                EventPayload::Assistant {
                    text: "late".to_string()
                }
            ))
            .is_none());
        assert!(mux
            .observe(&event(
                "r1",
                "s1",
                2,
                EventPayload::Lifecycle {
                    phase: LifecyclePhase::End,
                    result: None,
                    error: None,
                }
            ))
            .is_none());
    }

    #[test]
    fn test_final_delivered_once() {
        let mut mux = subscribed_mux("s1");
        let end = EventPayload::Lifecycle {
            phase: LifecyclePhase::End,
            result: None,
            error: None,
        };
        assert!(mux.observe(&event("r1", "s1", 0, end.clone())).is_some());
        assert!(mux.observe(&event("r1", "s1", 1, end)).is_none());
    }

    #[test]
    fn test_run_filter_restricts_delivery() {
        let mut mux = ConnectionMux::new("conn-1");
        mux.subscribe("s1", Some("r2".to_string()), VerboseLevel::On, false);

        assert!(mux
            .observe(&event(
                "r1",
                "s1",
                0,
                EventPayload::Assistant {
                    text: "x".to_string()
                }
            ))
            .is_none());
        assert!(mux
            .observe(&event(
                "r2",
                "s1",
                0,
                EventPayload::Assistant {
                    text: "x".to_string()
                }
            ))
            .is_some());
    }

    #[test]
    fn test_tool_suppressed_when_verbosity_off() {
        let mut mux = ConnectionMux::new("conn-1");
        mux.subscribe("s1", None, VerboseLevel::Off, false);

        let tool = EventPayload::Tool {
            phase: ToolPhase::Start,
            id: "t1".to_string(),
            name: "Bash".to_string(),
            input: Some(json!({"command": "ls"})),
            output: None,
            ok: None,
        };
        assert!(mux.observe(&event("r1", "s1", 0, tool)).is_none());
    }

    #[test]
    fn test_tool_summary_when_always_summarize() {
        let mut mux = ConnectionMux::new("conn-1");
        mux.subscribe("s1", None, VerboseLevel::Off, true);

        let tool = EventPayload::Tool {
            phase: ToolPhase::Start,
            id: "t1".to_string(),
            name: "Bash".to_string(),
            input: Some(json!({"command": "ls -la"})),
            output: None,
            ok: None,
        };
        let delivery = mux.observe(&event("r1", "s1", 0, tool)).unwrap();
        assert!(
            matches!(&delivery.frame, Frame::ToolSummary(s) if s.text == "Tool: Bash - ls -la")
        );

        // End-phase events carry no summary.
        let end = EventPayload::Tool {
            phase: ToolPhase::End,
            id: "t1".to_string(),
            name: "Bash".to_string(),
            input: None,
            output: Some(json!({"stdout": ""})),
            ok: Some(true),
        };
        assert!(mux.observe(&event("r1", "s1", 1, end)).is_none());
    }

    #[test]
    fn test_compaction_forwarded_regardless_of_verbosity() {
        let mut mux = ConnectionMux::new("conn-1");
        mux.subscribe("s1", None, VerboseLevel::Off, false);

        let delivery = mux
            .observe(&event(
                "r1",
                "s1",
                0,
                EventPayload::Compaction {
                    phase: CompactionPhase::Start,
                    reason: Some("context overflow".to_string()),
                },
            ))
            .unwrap();
        assert!(matches!(delivery.frame, Frame::Compaction(_)));
    }

    #[test]
    fn test_state_version_bumps_on_lifecycle() {
        let mut mux = subscribed_mux("s1");
        let before = mux.state_version;

        mux.observe(&event(
            "r1",
            "s1",
            0,
            EventPayload::Lifecycle {
                phase: LifecyclePhase::Start,
                result: None,
                error: None,
            },
        ));
        assert_eq!(mux.state_version, before + 1);

        mux.observe(&event(
            "r1",
            "s1",
            1,
            EventPayload::Lifecycle {
                phase: LifecyclePhase::End,
                result: None,
                error: None,
            },
        ));
        assert_eq!(mux.state_version, before + 2);
    }

    #[test]
    fn test_snapshot_frame() {
        let mut mux = subscribed_mux("s1");
        let delivery = mux.snapshot(vec![ActiveRun {
            run_id: "r1".to_string(),
            session_key: "s1".to_string(),
            status: RunStatus::InFlight,
        }]);
        assert_eq!(delivery.seq, 1);
        assert!(matches!(&delivery.frame, Frame::Snapshot(s) if s.active_runs.len() == 1));
    }
}
