// ABOUTME: Socket protocol adapter - typed JSON envelopes over a persistent WebSocket.
// ABOUTME: Frames are {type: req|res|event}; responses echo the request id and carry ok/error.

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
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use turngate_core::mux::Delivery;
use turngate_core::session::VerboseLevel;
use turngate_core::{ConnectionMux, GatewayError};

/// Frames from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
}

/// Frames to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Res {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<GatewayError>,
    },
    Event {
        event: String,
        payload: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(rename = "stateVersion", skip_serializing_if = "Option::is_none")]
        state_version: Option<u64>,
    },
}

impl ServerFrame {
    fn ok(id: &str, payload: Value) -> Self {
        Self::Res {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    fn err(id: &str, error: GatewayError) -> Self {
        Self::Res {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    fn event(delivery: Delivery) -> Self {
        Self::Event {
            event: delivery.frame.event_name().to_string(),
            payload: delivery.frame.payload(),
            seq: Some(delivery.seq),
            state_version: Some(delivery.state_version),
        }
    }
}

/// WebSocket upgrade handler at /ws.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let ops = Arc::clone(&state.ops);
    let mux = Arc::new(Mutex::new(ConnectionMux::new(&connection_id)));
    tracing::info!(connection_id = %connection_id, "Socket client connected");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);

    // Writer task: serializes outbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialize socket frame");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // A (re)connecting client gets a snapshot, not a replay of missed events.
    {
        let delivery = mux.lock().await.snapshot(ops.active_runs(&[]));
        let _ = out_tx.send(ServerFrame::event(delivery)).await;
    }

    // Bus pump: projects published events through this connection's mux.
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
                            if out_tx.send(ServerFrame::event(delivery)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Socket connection lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // Reader: one spawned task per request so a long agent.wait cannot stall
    // the connection.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        respond_parse_error(&out_tx, &text, &e).await;
                        continue;
                    }
                };
                let ClientFrame::Req { id, method, params } = frame;
                let ops = Arc::clone(&ops);
                let mux = Arc::clone(&mux);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let frame = handle_request(&ops, &mux, &id, &method, params).await;
                    let _ = out_tx.send(frame).await;
                });
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    bus_task.abort();
    drop(out_tx);
    let _ = writer_task.await;
    tracing::info!(connection_id = %connection_id, "Socket client disconnected");
}

/// Reply INVALID_REQUEST when the malformed frame still carries a usable id;
/// otherwise there is nothing to address the response to.
async fn respond_parse_error(
    out_tx: &mpsc::Sender<ServerFrame>,
    raw: &str,
    error: &serde_json::Error,
) {
    let id = serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string));
    match id {
        Some(id) => {
            let frame = ServerFrame::err(
                &id,
                GatewayError::invalid_request(format!("malformed frame: {}", error)),
            );
            let _ = out_tx.send(frame).await;
        }
        None => {
            tracing::debug!(error = %error, "Dropping malformed frame without id");
        }
    }
}

async fn handle_request(
    ops: &Arc<Operations>,
    mux: &Arc<Mutex<ConnectionMux>>,
    id: &str,
    method: &str,
    params: Value,
) -> ServerFrame {
    let result = match method {
        "chat.subscribe" => subscribe(ops, mux, params, true).await,
        "chat.unsubscribe" => subscribe(ops, mux, params, false).await,
        "chat.send" => {
            // The sender is implicitly interested in its own session's events.
            if let Some(session_key) = params.get("sessionKey").and_then(Value::as_str) {
                ensure_subscribed(ops, mux, session_key).await;
            }
            ops.dispatch(&Caller::Socket, method, params).await
        }
        _ => ops.dispatch(&Caller::Socket, method, params).await,
    };

    match result {
        Ok(payload) => ServerFrame::ok(id, payload),
        Err(error) => ServerFrame::err(id, error),
    }
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
    params: Value,
    on: bool,
) -> Result<Value, GatewayError> {
    let params: SubscribeParams = serde_json::from_value(params)
        .map_err(|e| GatewayError::invalid_request(format!("bad params: {}", e)))?;

    if !on {
        mux.lock().await.unsubscribe(&params.session_key);
        return Ok(serde_json::json!({ "subscribed": false }));
    }

    // Connection overrides fall back to the session's verbosity.
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
    Ok(serde_json::json!({ "subscribed": true }))
}

async fn ensure_subscribed(
    ops: &Arc<Operations>,
    mux: &Arc<Mutex<ConnectionMux>>,
    session_key: &str,
) {
    {
        let mux = mux.lock().await;
        if mux.is_subscribed(session_key) {
            return;
        }
    }
    let entry = ops.session_entry(session_key).await;
    mux.lock()
        .await
        .subscribe(session_key, None, entry.verbose_level, false);
}
