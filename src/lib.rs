// ABOUTME: Root library module for the turngate gateway binary.
// ABOUTME: Transport adapters, shared operations layer, config, and server wiring.

pub mod bridge;
pub mod config;
pub mod nodes;
pub mod ops;
pub mod server;
pub mod socket;

pub use config::Config;
pub use nodes::NodeRegistry;
pub use ops::{Caller, Operations};

// Re-export the core types adapters and embedders work with
pub use turngate_core::{
    ConnectionMux, EventBus, GatewayError, RunCoordinator, RunRegistry, SessionStore,
};
pub use turngate_engine::{EngineRegistry, TurnEngine};
