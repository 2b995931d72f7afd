// ABOUTME: Shared operations facade dispatching the logical method set for both transports.
// ABOUTME: Socket clients and bridged devices are peers; everything funnels through here.

use crate::nodes::NodeRegistry;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use turngate_core::coordinator::AdmitOutcome;
use turngate_core::mux::ActiveRun;
use turngate_core::session::{SessionEntry, ThinkingLevel, VerboseLevel};
use turngate_core::{
    EventBus, GatewayError, RunCoordinator, RunOutcome, SendPolicy, SessionStore,
};
use turngate_engine::{Attachment, DeliverTarget, TurnRequest};

const DEFAULT_WAIT_MS: u64 = 60_000;
const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;

/// Who is calling. Socket clients are implicitly trusted; bridge connections
/// must be linked (paired and verified) before touching chat state.
#[derive(Debug, Clone)]
pub enum Caller {
    Socket,
    Bridge { node_id: Option<String>, linked: bool },
}

impl Caller {
    fn is_linked(&self) -> bool {
        match self {
            Caller::Socket => true,
            Caller::Bridge { linked, .. } => *linked,
        }
    }
}

/// The logical operation set exposed by both transport adapters.
pub struct Operations {
    coordinator: Arc<RunCoordinator>,
    bus: Arc<EventBus>,
    nodes: Arc<NodeRegistry>,
    default_session_key: String,
    pairing_required: bool,
}

impl Operations {
    pub fn new(
        coordinator: Arc<RunCoordinator>,
        bus: Arc<EventBus>,
        nodes: Arc<NodeRegistry>,
        default_session_key: String,
        pairing_required: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            bus,
            nodes,
            default_session_key,
            pairing_required,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        self.coordinator.sessions()
    }

    pub fn default_session_key(&self) -> &str {
        &self.default_session_key
    }

    pub fn pairing_required(&self) -> bool {
        self.pairing_required
    }

    /// Session entry used by adapters to seed subscription defaults.
    pub async fn session_entry(&self, session_key: &str) -> SessionEntry {
        self.sessions().get_or_create(session_key).await
    }

    pub fn active_runs(&self, session_keys: &[String]) -> Vec<ActiveRun> {
        self.coordinator.active_runs(session_keys)
    }

    /// Dispatch one logical request. Subscription management (`chat.subscribe`
    /// / `chat.unsubscribe`) lives in the adapters, which own connection state.
    pub async fn dispatch(
        &self,
        caller: &Caller,
        method: &str,
        params: Value,
    ) -> Result<Value, GatewayError> {
        // Pairing ops are reachable before a bridge connection is linked.
        match method {
            "node.pair.request" => return self.node_pair_request(params).await,
            "node.pair.verify" => return self.node_pair_verify(params).await,
            _ => {}
        }

        if !caller.is_linked() {
            return Err(GatewayError::not_linked(
                "node is not paired; call node.pair.request first",
            ));
        }

        match method {
            "chat.send" => self.chat_send(params, true).await,
            "chat.abort" => self.chat_abort(params).await,
            "chat.history" => self.chat_history(params).await,
            "agent" => self.chat_send(params, false).await,
            "agent.wait" => self.agent_wait(params).await,
            "sessions.list" => self.sessions_list().await,
            "sessions.get" => self.sessions_get(params).await,
            "sessions.reset" => self.sessions_reset(params).await,
            "sessions.delete" => self.sessions_delete(params).await,
            "sessions.patch" => self.sessions_patch(params).await,
            "node.pair.approve" => self.node_pair_approve(params).await,
            "node.pair.reject" => self.node_pair_reject(params).await,
            "node.list" => self.node_list().await,
            "node.invoke" => self.node_invoke(params).await,
            other => Err(GatewayError::invalid_request(format!(
                "unknown method: {}",
                other
            ))),
        }
    }

    async fn chat_send(&self, params: Value, allow_stop: bool) -> Result<Value, GatewayError> {
        let params: ChatSendParams = parse(params)?;
        if params.message.is_empty() {
            return Err(GatewayError::invalid_request("message is required"));
        }

        // "/stop" is an abort in disguise, never a new turn.
        if allow_stop && RunCoordinator::is_stop_message(&params.message) {
            let outcome = self.coordinator.abort(&params.session_key, None).await?;
            return Ok(json!({
                "stopped": true,
                "aborted": outcome.aborted,
                "runIds": outcome.run_ids,
            }));
        }

        if let Some(ref thinking) = params.thinking {
            thinking
                .parse::<ThinkingLevel>()
                .map_err(|e| GatewayError::invalid_request(e.to_string()))?;
        }

        let mut attachments = Vec::with_capacity(params.attachments.len());
        for wire in &params.attachments {
            let attachment = Attachment::from_wire(
                &wire.kind,
                &wire.mime_type,
                wire.file_name.as_deref(),
                &wire.content,
            )
            .map_err(|e| GatewayError::invalid_request(format!("bad attachment: {}", e)))?;
            attachments.push(attachment);
        }

        let request = TurnRequest {
            session_key: params.session_key.clone(),
            session_id: String::new(),
            message: params.message,
            thinking_level: params.thinking,
            model: None,
            deliver: params.deliver.map(|d| DeliverTarget {
                provider: d.provider,
                to: d.to,
            }),
            attachments,
            timeout_ms: params.timeout_ms,
        };

        let outcome = self
            .coordinator
            .admit(&params.session_key, &params.idempotency_key, request)
            .await?;
        Ok(admit_payload(outcome))
    }

    async fn chat_abort(&self, params: Value) -> Result<Value, GatewayError> {
        let params: ChatAbortParams = parse(params)?;
        let outcome = self
            .coordinator
            .abort(&params.session_key, params.run_id.as_deref())
            .await?;
        Ok(json!({
            "aborted": outcome.aborted,
            "runIds": outcome.run_ids,
        }))
    }

    async fn chat_history(&self, params: Value) -> Result<Value, GatewayError> {
        let params: ChatHistoryParams = parse(params)?;
        let history = self
            .coordinator
            .history(&params.session_key, params.limit)
            .await?;
        Ok(json!({
            "sessionId": history.session_id,
            "messages": history.messages,
            "thinkingLevel": history.thinking_level,
        }))
    }

    async fn agent_wait(&self, params: Value) -> Result<Value, GatewayError> {
        let params: AgentWaitParams = parse(params)?;
        let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_WAIT_MS));
        let snapshot = self.coordinator.wait(&params.run_id, timeout).await?;
        let mut payload = json!({
            "runId": snapshot.run_id,
            "status": snapshot.status.to_string(),
        });
        attach_result(&mut payload, snapshot.result);
        Ok(payload)
    }

    async fn sessions_list(&self) -> Result<Value, GatewayError> {
        let sessions = self.sessions().list().await;
        Ok(json!({ "sessions": sessions }))
    }

    async fn sessions_get(&self, params: Value) -> Result<Value, GatewayError> {
        let params: SessionKeyParams = parse(params)?;
        let entry = self.sessions().get_or_create(&params.session_key).await;
        serde_json::to_value(entry).map_err(internal)
    }

    async fn sessions_reset(&self, params: Value) -> Result<Value, GatewayError> {
        let params: SessionKeyParams = parse(params)?;
        let entry = self.sessions().reset(&params.session_key).await;
        serde_json::to_value(entry).map_err(internal)
    }

    async fn sessions_delete(&self, params: Value) -> Result<Value, GatewayError> {
        let params: SessionKeyParams = parse(params)?;
        let deleted = self
            .sessions()
            .delete(&params.session_key)
            .await
            .map_err(|e| GatewayError::unavailable(e.to_string()))?;
        Ok(json!({ "deleted": deleted }))
    }

    async fn sessions_patch(&self, params: Value) -> Result<Value, GatewayError> {
        let params: SessionPatchParams = parse(params)?;

        let thinking = params
            .thinking_level
            .map(|s| s.parse::<ThinkingLevel>())
            .transpose()
            .map_err(|e| GatewayError::invalid_request(e.to_string()))?;
        let verbose = params
            .verbose_level
            .map(|s| s.parse::<VerboseLevel>())
            .transpose()
            .map_err(|e| GatewayError::invalid_request(e.to_string()))?;
        let send_policy = params
            .send_policy
            .map(serde_json::from_value::<SendPolicy>)
            .transpose()
            .map_err(|e| GatewayError::invalid_request(format!("bad sendPolicy: {}", e)))?;
        let model = params.model;
        let history_override = params.history_override;

        // Admin patches never touch the route fields a completing turn saves.
        let entry = self
            .sessions()
            .save(&params.session_key, move |entry| {
                if let Some(thinking) = thinking {
                    entry.thinking_level = thinking;
                }
                if let Some(verbose) = verbose {
                    entry.verbose_level = verbose;
                }
                if let Some(model) = model {
                    entry.model = Some(model);
                }
                if let Some(policy) = send_policy {
                    entry.send_policy = Some(policy);
                }
                if let Some(history_override) = history_override {
                    entry.history_override = if history_override.is_empty() {
                        None
                    } else {
                        Some(history_override)
                    };
                }
            })
            .await;
        serde_json::to_value(entry).map_err(internal)
    }

    async fn node_pair_request(&self, params: Value) -> Result<Value, GatewayError> {
        let params: NodePairParams = parse(params)?;
        let state = self.nodes.request_pairing(
            &params.node_id,
            params.display_name.as_deref().unwrap_or(&params.node_id),
        );
        Ok(json!({ "state": state }))
    }

    async fn node_pair_approve(&self, params: Value) -> Result<Value, GatewayError> {
        let params: NodePairParams = parse(params)?;
        let token = self.nodes.approve(&params.node_id)?;
        Ok(json!({ "token": token }))
    }

    async fn node_pair_reject(&self, params: Value) -> Result<Value, GatewayError> {
        let params: NodePairParams = parse(params)?;
        self.nodes.reject(&params.node_id)?;
        Ok(json!({ "rejected": true }))
    }

    async fn node_pair_verify(&self, params: Value) -> Result<Value, GatewayError> {
        let params: NodeVerifyParams = parse(params)?;
        let linked = self.nodes.verify(&params.node_id, &params.token);
        Ok(json!({ "linked": linked }))
    }

    async fn node_list(&self) -> Result<Value, GatewayError> {
        let (paired, pending) = self.nodes.list();
        Ok(json!({ "paired": paired, "pending": pending }))
    }

    async fn node_invoke(&self, params: Value) -> Result<Value, GatewayError> {
        let params: NodeInvokeParams = parse(params)?;
        let timeout =
            Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_INVOKE_TIMEOUT_MS));
        let result = self
            .nodes
            .invoke(
                &params.node_id,
                &params.command,
                params.params.unwrap_or_else(|| json!({})),
                &params.idempotency_key,
                timeout,
            )
            .await?;
        Ok(json!({ "result": result }))
    }
}

fn admit_payload(outcome: AdmitOutcome) -> Value {
    let mut payload = json!({
        "runId": outcome.run_id,
        "status": outcome.status.to_string(),
    });
    attach_result(&mut payload, outcome.result);
    payload
}

fn attach_result(payload: &mut Value, result: Option<RunOutcome>) {
    match result {
        Some(RunOutcome::Ok(result)) => {
            if let Ok(value) = serde_json::to_value(result) {
                payload["result"] = value;
            }
        }
        Some(RunOutcome::Error(err)) => {
            if let Ok(value) = serde_json::to_value(err) {
                payload["error"] = value;
            }
        }
        None => {}
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, GatewayError> {
    serde_json::from_value(params)
        .map_err(|e| GatewayError::invalid_request(format!("bad params: {}", e)))
}

fn internal(e: serde_json::Error) -> GatewayError {
    GatewayError::unavailable(format!("serialization failed: {}", e))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatSendParams {
    session_key: String,
    message: String,
    idempotency_key: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    deliver: Option<DeliverParam>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliverParam {
    provider: String,
    to: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAttachment {
    #[serde(rename = "type")]
    kind: String,
    mime_type: String,
    #[serde(default)]
    file_name: Option<String>,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatAbortParams {
    session_key: String,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatHistoryParams {
    session_key: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentWaitParams {
    run_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionKeyParams {
    session_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPatchParams {
    session_key: String,
    #[serde(default)]
    thinking_level: Option<String>,
    #[serde(default)]
    verbose_level: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    send_policy: Option<Value>,
    #[serde(default)]
    history_override: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodePairParams {
    node_id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeVerifyParams {
    node_id: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeInvokeParams {
    node_id: String,
    command: String,
    #[serde(default)]
    params: Option<Value>,
    idempotency_key: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}
