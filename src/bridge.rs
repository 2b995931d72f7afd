// ABOUTME: Bridge protocol adapter for remote paired devices.
// ABOUTME: {id, method, paramsJSON} envelopes plus server-pushed {event, payloadJSON} frames.

use crate::nodes::NodeCommand;
use crate::ops::{Caller, Operations};
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use turngate_core::mux::Delivery;
use turngate_core::session::VerboseLevel;
use turngate_core::{ConnectionMux, GatewayError};

/// Inbound frames: requests carry an id and method; events carry only a name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeInbound {
    Req {
        id: String,
        method: String,
        #[serde(rename = "paramsJSON", default)]
        params_json: Option<String>,
    },
    Event {
        event: String,
        #[serde(rename = "payloadJSON", default)]
        payload_json: Option<String>,
    },
}

/// Outbound frames mirroring the request/event split.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum BridgeOutbound {
    Res {
        id: String,
        ok: bool,
        #[serde(rename = "payloadJSON", skip_serializing_if = "Option::is_none")]
        payload_json: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<GatewayError>,
    },
    Event {
        event: String,
        #[serde(rename = "payloadJSON")]
        payload_json: String,
    },
}

impl BridgeOutbound {
    fn ok(id: &str, payload: &Value) -> Self {
        Self::Res {
            id: id.to_string(),
            ok: true,
            payload_json: Some(payload.to_string()),
            error: None,
        }
    }

    fn err(id: &str, error: GatewayError) -> Self {
        Self::Res {
            id: id.to_string(),
            ok: false,
            payload_json: None,
            error: Some(error),
        }
    }

    fn event(name: &str, payload: &Value) -> Self {
        Self::Event {
            event: name.to_string(),
            payload_json: payload.to_string(),
        }
    }

    fn delivery(delivery: Delivery) -> Self {
        let payload = json!({
            "event": delivery.frame.event_name(),
            "payload": delivery.frame.payload(),
            "seq": delivery.seq,
            "stateVersion": delivery.state_version,
        });
        Self::Event {
            event: delivery.frame.event_name().to_string(),
            payload_json: payload.to_string(),
        }
    }
}

/// Per-connection identity; a connection is linked once its node id and token
/// verify (or pairing is disabled).
#[derive(Default)]
struct ConnState {
    node_id: Option<String>,
    linked: bool,
}

impl ConnState {
    fn caller(&self) -> Caller {
        Caller::Bridge {
            node_id: self.node_id.clone(),
            linked: self.linked,
        }
    }
}

/// WebSocket upgrade handler at /bridge.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_bridge(socket, state))
}

async fn handle_bridge(socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let ops = Arc::clone(&state.ops);
    let mux = Arc::new(Mutex::new(ConnectionMux::new(&connection_id)));
    let conn = Arc::new(Mutex::new(ConnState::default()));
    tracing::info!(connection_id = %connection_id, "Bridge client connected");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<BridgeOutbound>(64);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialize bridge frame");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Initial snapshot; reconciliation is an explicit history fetch.
    {
        let delivery = mux.lock().await.snapshot(ops.active_runs(&[]));
        let _ = out_tx.send(BridgeOutbound::delivery(delivery)).await;
    }

    let bus_task = {
        let mux = Arc::clone(&mux);
        let out_tx = out_tx.clone();
        let mut bus_rx = ops.bus().subscribe();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(event) => {
                        let delivery = mux.lock().await.observe(&event);
                        if let Some(delivery) = delivery {
                            if out_tx
                                .send(BridgeOutbound::delivery(delivery))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Bridge connection lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let inbound: BridgeInbound = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::debug!(error = %e, "Dropping malformed bridge frame");
                        continue;
                    }
                };
                match inbound {
                    BridgeInbound::Req {
                        id,
                        method,
                        params_json,
                    } => {
                        let params = parse_params(params_json.as_deref());
                        let ops = Arc::clone(&ops);
                        let mux = Arc::clone(&mux);
                        let conn = Arc::clone(&conn);
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            let frame = match params {
                                Ok(params) => {
                                    handle_request(&ops, &mux, &conn, &out_tx, &id, &method, params)
                                        .await
                                }
                                Err(error) => BridgeOutbound::err(&id, error),
                            };
                            let _ = out_tx.send(frame).await;
                        });
                    }
                    BridgeInbound::Event {
                        event,
                        payload_json,
                    } => {
                        let payload = parse_params(payload_json.as_deref()).unwrap_or(Value::Null);
                        handle_event(&ops, &mux, &conn, &out_tx, &event, payload).await;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Tear down the node's command channel on disconnect.
    {
        let conn = conn.lock().await;
        if let Some(ref node_id) = conn.node_id {
            ops.nodes().detach_channel(node_id);
        }
    }
    bus_task.abort();
    drop(out_tx);
    let _ = writer_task.await;
    tracing::info!(connection_id = %connection_id, "Bridge client disconnected");
}

fn parse_params(raw: Option<&str>) -> Result<Value, GatewayError> {
    match raw {
        None | Some("") => Ok(json!({})),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| GatewayError::invalid_request(format!("bad paramsJSON: {}", e))),
    }
}

async fn handle_request(
    ops: &Arc<Operations>,
    mux: &Arc<Mutex<ConnectionMux>>,
    conn: &Arc<Mutex<ConnState>>,
    out_tx: &mpsc::Sender<BridgeOutbound>,
    id: &str,
    method: &str,
    params: Value,
) -> BridgeOutbound {
    let result = match method {
        "node.hello" => hello(ops, conn, out_tx, params).await,
        "node.invoke.result" => invoke_result(ops, params).await,
        "chat.subscribe" | "chat.unsubscribe" => {
            let caller = conn.lock().await.caller();
            subscribe(ops, mux, &caller, params, method == "chat.subscribe").await
        }
        _ => {
            let caller = conn.lock().await.caller();
            ops.dispatch(&caller, method, params).await
        }
    };

    match result {
        Ok(payload) => BridgeOutbound::ok(id, &payload),
        Err(error) => BridgeOutbound::err(id, error),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelloParams {
    node_id: String,
    #[serde(default)]
    token: Option<String>,
}

/// Identify the connection. A valid token (or pairing disabled) links it and
/// attaches the node's command channel for node.invoke.
async fn hello(
    ops: &Arc<Operations>,
    conn: &Arc<Mutex<ConnState>>,
    out_tx: &mpsc::Sender<BridgeOutbound>,
    params: Value,
) -> Result<Value, GatewayError> {
    let params: HelloParams = serde_json::from_value(params)
        .map_err(|e| GatewayError::invalid_request(format!("bad params: {}", e)))?;

    let linked = if !ops.pairing_required() {
        true
    } else {
        match params.token.as_deref() {
            Some(token) => ops.nodes().verify(&params.node_id, token),
            None => false,
        }
    };

    {
        let mut conn = conn.lock().await;
        conn.node_id = Some(params.node_id.clone());
        conn.linked = linked;
    }

    if linked {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<NodeCommand>(16);
        ops.nodes().attach_channel(&params.node_id, cmd_tx);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                let payload = serde_json::to_value(&command).unwrap_or(Value::Null);
                if out_tx
                    .send(BridgeOutbound::event("node.invoke", &payload))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    tracing::info!(node_id = %params.node_id, linked, "Bridge hello");
    Ok(json!({ "linked": linked }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeResultParams {
    invoke_id: String,
    ok: bool,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// A device answering a previously pushed node.invoke command.
async fn invoke_result(ops: &Arc<Operations>, params: Value) -> Result<Value, GatewayError> {
    let params: InvokeResultParams = serde_json::from_value(params)
        .map_err(|e| GatewayError::invalid_request(format!("bad params: {}", e)))?;

    let result = if params.ok {
        Ok(params.payload.unwrap_or(Value::Null))
    } else {
        Err(GatewayError::unavailable(
            params.error.unwrap_or_else(|| "command failed".to_string()),
        ))
    };
    ops.nodes().complete_invoke(&params.invoke_id, result);
    Ok(json!({ "accepted": true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeParams {
    session_key: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    verbose: Option<String>,
    #[serde(default)]
    always_summarize_tools: Option<bool>,
}

async fn subscribe(
    ops: &Arc<Operations>,
    mux: &Arc<Mutex<ConnectionMux>>,
    caller: &Caller,
    params: Value,
    on: bool,
) -> Result<Value, GatewayError> {
    if let Caller::Bridge { linked: false, .. } = caller {
        return Err(GatewayError::not_linked(
            "node is not paired; call node.pair.request first",
        ));
    }

    let params: SubscribeParams = serde_json::from_value(params)
        .map_err(|e| GatewayError::invalid_request(format!("bad params: {}", e)))?;

    if !on {
        mux.lock().await.unsubscribe(&params.session_key);
        return Ok(json!({ "subscribed": false }));
    }

    let entry = ops.session_entry(&params.session_key).await;
    let verbose = match params.verbose.as_deref() {
        Some(v) => v
            .parse::<VerboseLevel>()
            .map_err(|e| GatewayError::invalid_request(e.to_string()))?,
        None => entry.verbose_level,
    };
    mux.lock().await.subscribe(
        &params.session_key,
        params.run_id,
        verbose,
        params.always_summarize_tools.unwrap_or(false),
    );
    Ok(json!({ "subscribed": true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoicePayload {
    text: String,
    #[serde(default)]
    session_key: Option<String>,
}

/// Inbound fire-and-forget events from the device.
async fn handle_event(
    ops: &Arc<Operations>,
    mux: &Arc<Mutex<ConnectionMux>>,
    conn: &Arc<Mutex<ConnState>>,
    out_tx: &mpsc::Sender<BridgeOutbound>,
    event: &str,
    payload: Value,
) {
    match event {
        // Voice transcripts synthesize a chat.send against the default
        // session when no session key is supplied.
        "voice.transcript" => {
            let caller = conn.lock().await.caller();
            if let Caller::Bridge { linked: false, .. } = caller {
                tracing::debug!("Dropping voice event from unlinked node");
                return;
            }
            let Ok(voice) = serde_json::from_value::<VoicePayload>(payload) else {
                tracing::debug!("Dropping malformed voice event");
                return;
            };
            if voice.text.trim().is_empty() {
                return;
            }

            let session_key = voice
                .session_key
                .unwrap_or_else(|| ops.default_session_key().to_string());
            let entry = ops.session_entry(&session_key).await;
            mux.lock()
                .await
                .subscribe(&session_key, None, entry.verbose_level, false);

            let params = json!({
                "sessionKey": session_key,
                "message": voice.text,
                "idempotencyKey": uuid::Uuid::new_v4().to_string(),
            });
            match ops.dispatch(&caller, "chat.send", params).await {
                Ok(payload) => {
                    let _ = out_tx
                        .send(BridgeOutbound::event("voice.accepted", &payload))
                        .await;
                }
                Err(error) => {
                    let payload = serde_json::to_value(&error).unwrap_or(Value::Null);
                    let _ = out_tx
                        .send(BridgeOutbound::event("voice.rejected", &payload))
                        .await;
                }
            }
        }
        other => {
            tracing::debug!(event = %other, "Ignoring unknown bridge event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_req_parses() {
        let raw = r#"{"id":"7","method":"chat.send","paramsJSON":"{\"sessionKey\":\"s\"}"}"#;
        let inbound: BridgeInbound = serde_json::from_str(raw).unwrap();
        match inbound {
            BridgeInbound::Req {
                id,
                method,
                params_json,
            } => {
                assert_eq!(id, "7");
                assert_eq!(method, "chat.send");
                let params = parse_params(params_json.as_deref()).unwrap();
                assert_eq!(params["sessionKey"], "s");
            }
            BridgeInbound::Event { .. } => panic!("Expected Req"),
        }
    }

    #[test]
    fn test_inbound_event_parses() {
        let raw = r#"{"event":"voice.transcript","payloadJSON":"{\"text\":\"hi\"}"}"#;
        let inbound: BridgeInbound = serde_json::from_str(raw).unwrap();
        match inbound {
            BridgeInbound::Event {
                event,
                payload_json,
            } => {
                assert_eq!(event, "voice.transcript");
                let payload = parse_params(payload_json.as_deref()).unwrap();
                assert_eq!(payload["text"], "hi");
            }
            BridgeInbound::Req { .. } => panic!("Expected Event"),
        }
    }

    #[test]
    fn test_outbound_res_shape() {
        let frame = BridgeOutbound::ok("7", &json!({"runId": "r1"}));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["id"], "7");
        assert_eq!(json["ok"], true);
        let payload: Value = serde_json::from_str(json["payloadJSON"].as_str().unwrap()).unwrap();
        assert_eq!(payload["runId"], "r1");
    }

    #[test]
    fn test_outbound_error_shape() {
        let frame = BridgeOutbound::err("7", GatewayError::not_linked("nope"));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "NOT_LINKED");
    }

    #[test]
    fn test_empty_params_json_is_empty_object() {
        assert_eq!(parse_params(None).unwrap(), json!({}));
        assert_eq!(parse_params(Some("")).unwrap(), json!({}));
        assert!(parse_params(Some("not json")).is_err());
    }
}
