// ABOUTME: Agent engine boundary for turngate.
// ABOUTME: Event payload types, turn request/result, the TurnEngine trait, and a scripted mock.

pub mod engine;
pub mod event;
pub mod registry;
pub mod request;
pub mod testing;

pub use engine::{EventSender, TurnEngine};
pub use event::{
    AgentEvent, CompactionPhase, EventPayload, LifecyclePhase, ToolPhase, TurnResult, Usage,
};
pub use registry::{EngineFactory, EngineRegistry};
pub use request::{Attachment, DeliverTarget, TurnRequest};
