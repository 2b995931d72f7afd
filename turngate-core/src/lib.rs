// ABOUTME: Run coordination and event multiplexing core for turngate.
// ABOUTME: Event bus, run registry, coordinator, session store, transcript access, send policy.

pub mod bus;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod mux;
pub mod policy;
pub mod registry;
pub mod session;
pub mod transcript;

pub use bus::EventBus;
pub use coordinator::{AbortOutcome, AdmitOutcome, RunCoordinator};
pub use error::{ErrorCode, GatewayError};
pub use mux::{ChatState, ConnectionMux, Delivery, Frame};
pub use policy::{PolicyAction, PolicyDecision, PolicyRule, RouteInfo, SendPolicy};
pub use registry::{RunOutcome, RunRegistry, RunSnapshot, RunStatus};
pub use session::{SessionEntry, SessionStore, ThinkingLevel, VerboseLevel};
pub use transcript::{SqliteTranscript, TranscriptEntry, TranscriptLog};

// Re-export engine types for convenience
pub use turngate_engine::{AgentEvent, EventPayload, TurnEngine, TurnRequest, TurnResult};
