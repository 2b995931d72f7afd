// ABOUTME: Scripted mock engine for deterministic tests.
// ABOUTME: Per-prompt event scripts with delays, hang-until-cancel, and failure injection.
//!
//! # Example
//!
//! ```no_run
//! use turngate_engine::testing::MockEngine;
//!
//! let engine = MockEngine::new()
//!     .on_prompt("hello")
//!     .respond_text("Hi there!")
//!     .on_prompt("slow")
//!     .delay_ms(50)
//!     .respond_text("finally")
//!     .on_prompt("stuck")
//!     .hang_until_cancel();
//! ```

use crate::engine::{EventSender, TurnEngine};
use crate::event::{EventPayload, TurnResult, Usage};
use crate::request::TurnRequest;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

enum Step {
    Emit(EventPayload),
    Delay(Duration),
}

enum Outcome {
    Succeed(TurnResult),
    Fail(String),
    HangUntilCancel,
}

struct Script {
    pattern: String,
    steps: Vec<Step>,
    outcome: Outcome,
}

/// Mock engine that replays pre-configured scripts.
///
/// Scripts are matched FIFO-first against the prompt text, falling back to a
/// queue search, so in-order prompts are deterministic while out-of-order
/// prompts still find their script. With no matching script the engine echoes
/// the prompt when built via [`MockEngine::echo`], otherwise it fails.
pub struct MockEngine {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    echo_fallback: bool,
}

impl MockEngine {
    /// Create a mock with no scripts; unmatched prompts fail.
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            echo_fallback: false,
        }
    }

    /// Create a shared mock that echoes any prompt back as the result.
    pub fn echo() -> Arc<dyn TurnEngine> {
        Arc::new(Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            echo_fallback: true,
        })
    }

    /// Begin a script for prompts containing `pattern`.
    pub fn on_prompt(self, pattern: &str) -> ScriptBuilder {
        ScriptBuilder {
            engine: self,
            pattern: pattern.to_string(),
            steps: Vec::new(),
        }
    }

    /// Wrap in an `Arc<dyn TurnEngine>` for the coordinator.
    pub fn into_shared(self) -> Arc<dyn TurnEngine> {
        Arc::new(self)
    }

    fn take_script(&self, prompt: &str) -> Option<Script> {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(front) = scripts.front() {
            if prompt.contains(&front.pattern) {
                return scripts.pop_front();
            }
        }
        scripts
            .iter()
            .position(|s| prompt.contains(&s.pattern))
            .and_then(|i| scripts.remove(i))
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for one scripted prompt.
pub struct ScriptBuilder {
    engine: MockEngine,
    pattern: String,
    steps: Vec<Step>,
}

impl ScriptBuilder {
    /// Emit an arbitrary event payload mid-turn.
    pub fn emit(mut self, payload: EventPayload) -> Self {
        self.steps.push(Step::Emit(payload));
        self
    }

    /// Emit an assistant text delta.
    pub fn emit_delta(self, text: &str) -> Self {
        self.emit(EventPayload::Assistant {
            text: text.to_string(),
        })
    }

    /// Sleep before the next step, observing cancellation.
    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.steps.push(Step::Delay(Duration::from_millis(ms)));
        self
    }

    /// Finish the script with a successful result.
    pub fn respond(self, result: TurnResult) -> MockEngine {
        self.finish(Outcome::Succeed(result))
    }

    /// Finish the script with a plain-text result.
    pub fn respond_text(self, text: &str) -> MockEngine {
        self.respond(TurnResult {
            text: text.to_string(),
            model: Some("mock-model".to_string()),
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 20,
            }),
        })
    }

    /// Finish the script with an engine failure.
    pub fn fail(self, message: &str) -> MockEngine {
        self.finish(Outcome::Fail(message.to_string()))
    }

    /// Finish the script by blocking until the cancel token fires.
    pub fn hang_until_cancel(self) -> MockEngine {
        self.finish(Outcome::HangUntilCancel)
    }

    fn finish(self, outcome: Outcome) -> MockEngine {
        let script = Script {
            pattern: self.pattern,
            steps: self.steps,
            outcome,
        };
        self.engine
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(script);
        self.engine
    }
}

#[async_trait]
impl TurnEngine for MockEngine {
    async fn run_turn(
        &self,
        request: TurnRequest,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<TurnResult> {
        let script = match self.take_script(&request.message) {
            Some(s) => s,
            None if self.echo_fallback => {
                let text = format!("echo: {}", request.message);
                let _ = events
                    .send(EventPayload::Assistant { text: text.clone() })
                    .await;
                return Ok(TurnResult {
                    text,
                    model: request.model.clone(),
                    usage: Some(Usage {
                        input_tokens: request.message.len() as u64,
                        output_tokens: request.message.len() as u64,
                    }),
                });
            }
            None => return Err(anyhow!("no script for prompt: {}", request.message)),
        };

        for step in script.steps {
            match step {
                Step::Emit(payload) => {
                    let _ = events.send(payload).await;
                }
                Step::Delay(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = cancel.cancelled() => {
                            return Err(anyhow!("turn cancelled"));
                        }
                    }
                }
            }
        }

        match script.outcome {
            Outcome::Succeed(result) => {
                if cancel.is_cancelled() {
                    return Err(anyhow!("turn cancelled"));
                }
                Ok(result)
            }
            Outcome::Fail(message) => Err(anyhow!(message)),
            Outcome::HangUntilCancel => {
                cancel.cancelled().await;
                Err(anyhow!("turn cancelled"))
            }
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
