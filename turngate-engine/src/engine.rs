// ABOUTME: TurnEngine trait - the boundary between the gateway and the agent runtime.
// ABOUTME: Cancel is advisory, completion is authoritative.

use crate::event::{EventPayload, TurnResult};
use crate::request::TurnRequest;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel on which an engine streams events while a turn runs.
pub type EventSender = mpsc::Sender<EventPayload>;

/// The external agent execution engine, consumed by the coordinator.
///
/// `run_turn` is the only long-suspending operation in the system. The engine
/// streams assistant/tool/compaction payloads on `events` while running and
/// returns the terminal result; lifecycle events are published by the caller.
///
/// Cancellation contract: the engine is expected to observe `cancel` promptly
/// but the caller does not assume it returns instantly. A cancelled turn may
/// return either an error or a partial result; the caller decides the run's
/// terminal status from the token, not from the return value.
#[async_trait]
pub trait TurnEngine: Send + Sync {
    async fn run_turn(
        &self,
        request: TurnRequest,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<TurnResult>;

    /// Engine name for logs and diagnostics.
    fn name(&self) -> &'static str;
}
