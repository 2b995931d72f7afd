// ABOUTME: Event types flowing from the agent engine through the event bus.
// ABOUTME: EventPayload is the tagged sum over streams; AgentEvent is the bus envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Phase of a tool invocation within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Start,
    Update,
    End,
}

/// Phase of a run's lifecycle.
///
/// `Start`/`End`/`Error` are published by the coordinator around the turn
/// invocation; `Aborted` supersedes any later natural completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
    Aborted,
}

/// Phase of a transcript compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionPhase {
    Start,
    End,
}

/// One emission from the agent engine (or the coordinator, for lifecycle).
///
/// Modeled as a sum type over the `stream` discriminator so the multiplexer's
/// projection logic gets exhaustiveness checking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum EventPayload {
    /// Streaming assistant text delta.
    Assistant { text: String },

    /// Tool activity. `input` is present on `Start`, `output` and `ok` on `End`.
    Tool {
        phase: ToolPhase,
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<bool>,
    },

    /// Run lifecycle transition.
    Lifecycle {
        phase: LifecyclePhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<TurnResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Transcript compaction notification.
    Compaction {
        phase: CompactionPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl EventPayload {
    /// True for payloads that terminate a run's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::Lifecycle {
                phase: LifecyclePhase::End | LifecyclePhase::Error | LifecyclePhase::Aborted,
                ..
            }
        )
    }
}

/// Envelope published on the event bus.
///
/// `seq` is stamped by the bus: monotonic per `run_id`, starting at 0, never
/// reused. Every subscriber observes a run's events in non-decreasing `seq`
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub run_id: String,
    pub session_key: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Terminal result of a successful turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    /// Final assembled assistant text.
    pub text: String,
    /// Model that actually served the turn, if the engine reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Token usage, if available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Token usage counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assistant_payload_tagged_by_stream() {
        let payload = EventPayload::Assistant {
            text: "hello".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["stream"], "assistant");
        assert_eq!(json["text"], "hello");
    }

    #[test]
    fn test_tool_payload_omits_absent_fields() {
        let payload = EventPayload::Tool {
            phase: ToolPhase::Start,
            id: "t1".to_string(),
            name: "Read".to_string(),
            input: Some(json!({"path": "/tmp/f"})),
            output: None,
            ok: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["stream"], "tool");
        assert_eq!(json["phase"], "start");
        assert!(json.get("output").is_none());
        assert!(json.get("ok").is_none());
    }

    #[test]
    fn test_lifecycle_end_is_terminal() {
        let end = EventPayload::Lifecycle {
            phase: LifecyclePhase::End,
            result: Some(TurnResult {
                text: "done".to_string(),
                model: None,
                usage: None,
            }),
            error: None,
        };
        assert!(end.is_terminal());

        let start = EventPayload::Lifecycle {
            phase: LifecyclePhase::Start,
            result: None,
            error: None,
        };
        assert!(!start.is_terminal());

        let delta = EventPayload::Assistant {
            text: "x".to_string(),
        };
        assert!(!delta.is_terminal());
    }

    #[test]
    fn test_agent_event_envelope_flattens_payload() {
        let event = AgentEvent {
            run_id: "r1".to_string(),
            session_key: "discord:dm:alice".to_string(),
            seq: 3,
            timestamp: Utc::now(),
            payload: EventPayload::Assistant {
                text: "hi".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["run_id"], "r1");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["stream"], "assistant");

        let back: AgentEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
