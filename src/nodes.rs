// ABOUTME: Paired-node registry for the bridge protocol.
// ABOUTME: Pairing lifecycle, token verification, and idempotent command invocation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use turngate_core::GatewayError;

/// A device that completed the pairing handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedNode {
    pub node_id: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub paired_at: DateTime<Utc>,
    pub connected: bool,
}

/// A pairing request awaiting approval.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPairing {
    pub node_id: String,
    pub display_name: String,
    pub requested_at: DateTime<Utc>,
}

/// Outcome of a pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Pending,
    Paired,
}

/// A command pushed to a connected node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCommand {
    pub invoke_id: String,
    pub command: String,
    pub params: Value,
}

enum InvokeState {
    InFlight,
    Done(Value),
}

#[derive(Default)]
struct Inner {
    paired: HashMap<String, PairedNode>,
    pending: HashMap<String, PendingPairing>,
    channels: HashMap<String, mpsc::Sender<NodeCommand>>,
    invoke_waiters: HashMap<String, oneshot::Sender<Result<Value, GatewayError>>>,
    invoke_cache: HashMap<(String, String), InvokeState>,
}

/// In-memory registry of remote paired devices.
pub struct NodeRegistry {
    inner: Mutex<Inner>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A device asks to be paired. Idempotent while pending; a no-op for an
    /// already-paired node.
    pub fn request_pairing(&self, node_id: &str, display_name: &str) -> PairingState {
        let mut inner = self.lock();
        if inner.paired.contains_key(node_id) {
            return PairingState::Paired;
        }
        inner
            .pending
            .entry(node_id.to_string())
            .or_insert_with(|| PendingPairing {
                node_id: node_id.to_string(),
                display_name: display_name.to_string(),
                requested_at: Utc::now(),
            });
        tracing::info!(node_id = %node_id, "Pairing requested");
        PairingState::Pending
    }

    /// Approve a pending request, minting the node's token.
    pub fn approve(&self, node_id: &str) -> Result<String, GatewayError> {
        let mut inner = self.lock();
        let Some(pending) = inner.pending.remove(node_id) else {
            return Err(GatewayError::invalid_request(format!(
                "no pending pairing for node {}",
                node_id
            )));
        };
        let token = uuid::Uuid::new_v4().to_string();
        inner.paired.insert(
            node_id.to_string(),
            PairedNode {
                node_id: node_id.to_string(),
                display_name: pending.display_name,
                token: token.clone(),
                paired_at: Utc::now(),
                connected: false,
            },
        );
        tracing::info!(node_id = %node_id, "Pairing approved");
        Ok(token)
    }

    pub fn reject(&self, node_id: &str) -> Result<(), GatewayError> {
        let mut inner = self.lock();
        if inner.pending.remove(node_id).is_none() {
            return Err(GatewayError::invalid_request(format!(
                "no pending pairing for node {}",
                node_id
            )));
        }
        tracing::info!(node_id = %node_id, "Pairing rejected");
        Ok(())
    }

    /// Check a node's token. Never reveals whether the node exists.
    pub fn verify(&self, node_id: &str, token: &str) -> bool {
        let inner = self.lock();
        inner
            .paired
            .get(node_id)
            .map(|node| node.token == token)
            .unwrap_or(false)
    }

    pub fn is_paired(&self, node_id: &str) -> bool {
        self.lock().paired.contains_key(node_id)
    }

    pub fn list(&self) -> (Vec<PairedNode>, Vec<PendingPairing>) {
        let inner = self.lock();
        let mut paired: Vec<PairedNode> = inner.paired.values().cloned().collect();
        paired.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let mut pending: Vec<PendingPairing> = inner.pending.values().cloned().collect();
        pending.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        (paired, pending)
    }

    /// Register the command channel of a connected node.
    pub fn attach_channel(&self, node_id: &str, tx: mpsc::Sender<NodeCommand>) {
        let mut inner = self.lock();
        inner.channels.insert(node_id.to_string(), tx);
        if let Some(node) = inner.paired.get_mut(node_id) {
            node.connected = true;
        }
    }

    pub fn detach_channel(&self, node_id: &str) {
        let mut inner = self.lock();
        inner.channels.remove(node_id);
        if let Some(node) = inner.paired.get_mut(node_id) {
            node.connected = false;
        }
    }

    /// Invoke a command on a connected node and wait for its reply.
    ///
    /// Completed invocations are cached by idempotency key and replayed;
    /// a duplicate of an in-flight invocation conflicts rather than running
    /// the command twice.
    pub async fn invoke(
        &self,
        node_id: &str,
        command: &str,
        params: Value,
        idempotency_key: &str,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let cache_key = (node_id.to_string(), idempotency_key.to_string());
        let invoke_id = uuid::Uuid::new_v4().to_string();

        let (tx, rx) = oneshot::channel();
        let channel = {
            let mut inner = self.lock();
            if !inner.paired.contains_key(node_id) {
                return Err(GatewayError::not_linked(format!(
                    "node {} is not paired",
                    node_id
                )));
            }
            match inner.invoke_cache.get(&cache_key) {
                Some(InvokeState::Done(result)) => return Ok(result.clone()),
                Some(InvokeState::InFlight) => {
                    return Err(GatewayError::conflict(format!(
                        "command with idempotencyKey {} is already in flight",
                        idempotency_key
                    )));
                }
                None => {}
            }
            let Some(channel) = inner.channels.get(node_id).cloned() else {
                return Err(GatewayError::unavailable(format!(
                    "node {} is not connected",
                    node_id
                )));
            };
            inner.invoke_cache.insert(cache_key.clone(), InvokeState::InFlight);
            inner.invoke_waiters.insert(invoke_id.clone(), tx);
            channel
        };

        let command = NodeCommand {
            invoke_id: invoke_id.clone(),
            command: command.to_string(),
            params,
        };
        if channel.send(command).await.is_err() {
            self.clear_invoke(&invoke_id, &cache_key);
            return Err(GatewayError::unavailable(format!(
                "node {} connection closed",
                node_id
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => {
                let mut inner = self.lock();
                inner
                    .invoke_cache
                    .insert(cache_key, InvokeState::Done(result.clone()));
                Ok(result)
            }
            Ok(Ok(Err(err))) => {
                self.clear_invoke(&invoke_id, &cache_key);
                Err(err)
            }
            Ok(Err(_)) => {
                self.clear_invoke(&invoke_id, &cache_key);
                Err(GatewayError::unavailable("node reply channel dropped"))
            }
            Err(_) => {
                self.clear_invoke(&invoke_id, &cache_key);
                Err(GatewayError::agent_timeout(format!(
                    "node {} did not answer within {}ms",
                    node_id,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Deliver a node's reply to the waiting invoker.
    pub fn complete_invoke(&self, invoke_id: &str, result: Result<Value, GatewayError>) {
        let waiter = self.lock().invoke_waiters.remove(invoke_id);
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        } else {
            tracing::debug!(invoke_id = %invoke_id, "Reply for unknown or expired invoke");
        }
    }

    fn clear_invoke(&self, invoke_id: &str, cache_key: &(String, String)) {
        let mut inner = self.lock();
        inner.invoke_waiters.remove(invoke_id);
        inner.invoke_cache.remove(cache_key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pairing_lifecycle() {
        let registry = NodeRegistry::new();
        assert_eq!(
            registry.request_pairing("n1", "Phone"),
            PairingState::Pending
        );
        // Re-requesting while pending stays pending.
        assert_eq!(
            registry.request_pairing("n1", "Phone"),
            PairingState::Pending
        );

        let token = registry.approve("n1").unwrap();
        assert!(registry.verify("n1", &token));
        assert!(!registry.verify("n1", "wrong"));
        assert!(!registry.verify("ghost", &token));
        assert_eq!(registry.request_pairing("n1", "Phone"), PairingState::Paired);
    }

    #[test]
    fn test_reject_clears_pending() {
        let registry = NodeRegistry::new();
        registry.request_pairing("n1", "Phone");
        registry.reject("n1").unwrap();
        assert!(registry.reject("n1").is_err());
        assert!(!registry.is_paired("n1"));
    }

    #[test]
    fn test_approve_without_request_fails() {
        let registry = NodeRegistry::new();
        assert!(registry.approve("n1").is_err());
    }

    #[tokio::test]
    async fn test_invoke_round_trip_and_replay() {
        let registry = NodeRegistry::new();
        registry.request_pairing("n1", "Phone");
        registry.approve("n1").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        registry.attach_channel("n1", tx);

        let invoke = registry.invoke(
            "n1",
            "camera.capture",
            json!({"facing": "back"}),
            "idem-1",
            Duration::from_secs(1),
        );

        let reply = async {
            let cmd = rx.recv().await.unwrap();
            assert_eq!(cmd.command, "camera.capture");
            registry.complete_invoke(&cmd.invoke_id, Ok(json!({"photo": "abc"})));
        };

        let (result, ()) = tokio::join!(invoke, reply);
        assert_eq!(result.unwrap(), json!({"photo": "abc"}));

        // Same idempotency key replays the cached result without a new command.
        let replay = registry
            .invoke(
                "n1",
                "camera.capture",
                json!({"facing": "back"}),
                "idem-1",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(replay, json!({"photo": "abc"}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invoke_unpaired_is_not_linked() {
        let registry = NodeRegistry::new();
        let err = registry
            .invoke("ghost", "x", json!({}), "i1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code, turngate_core::ErrorCode::NotLinked);
    }

    #[tokio::test]
    async fn test_invoke_times_out_and_allows_retry() {
        let registry = NodeRegistry::new();
        registry.request_pairing("n1", "Phone");
        registry.approve("n1").unwrap();
        let (tx, mut _rx) = mpsc::channel(8);
        registry.attach_channel("n1", tx);

        let err = registry
            .invoke("n1", "x", json!({}), "i1", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err.code, turngate_core::ErrorCode::AgentTimeout);

        // A timed-out invoke is cleared from the cache, so a retry re-sends.
        let err = registry
            .invoke("n1", "x", json!({}), "i1", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err.code, turngate_core::ErrorCode::AgentTimeout);
    }
}
