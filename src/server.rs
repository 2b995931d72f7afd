// ABOUTME: Composition root wiring - axum router exposing both transports.
// ABOUTME: One bus, one registry, one coordinator; adapters receive shared references.

use crate::ops::Operations;
use crate::{bridge, socket};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state handed to every connection handler.
#[derive(Clone)]
pub struct AppState {
    pub ops: Arc<Operations>,
}

/// Build the gateway router: socket protocol at /ws, bridge protocol at
/// /bridge, plus a liveness probe.
pub fn build_router(ops: Arc<Operations>) -> Router {
    Router::new()
        .route("/ws", get(socket::ws_handler))
        .route("/bridge", get(bridge::ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(AppState { ops })
        .layer(TraceLayer::new_for_http())
}

/// Serve until ctrl-c.
pub async fn run(listen_addr: &str, ops: Arc<Operations>) -> Result<()> {
    let router = build_router(ops);
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    tracing::info!(addr = %listen_addr, "Gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;
    Ok(())
}
