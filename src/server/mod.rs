// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! API server
//!
//! Thin HTTP adapter over the session store. Handlers parse the request,
//! call one store operation, and map the result to JSON; no authorization
//! logic lives here.
//!
//! # Endpoints
//!
//! - `GET  /health` - Health check
//! - `POST /session` - Create a session and mint claim tokens
//! - `POST /session/claim` - Claim a token, receive a capability signature
//! - `POST /session/heartbeat` - Liveness ping with integrity signals
//! - `POST /session/event` - Report an integrity violation
//! - `POST /session/reconnect` - Re-admit a device with a lapsed signature
//! - `GET  /session/launch` - Launch URL, provider, whitelist
//! - `GET  /session/whitelist` - Current whitelist
//! - `GET  /session/pin/status` - Proctor PIN status
//! - `POST /session/pin/verify` - Check a presented exit PIN
//! - `GET  /exam/launch` - Whether a target URL is allowed
//! - `GET  /admin/monitor` - Proctor monitor view
//! - `POST /admin/whitelist` - Add a whitelist URL
//! - `POST /admin/launch-url` - Replace the launch URL
//! - `POST /admin/pin` - Set the proctor exit PIN
//! - `POST /admin/finish` - End the session normally
//! - `POST /admin/revoke` - End the session forcibly
//! - `POST /admin/revoke-token` - Revoke one student token
//! - `POST /admin/pause` / `POST /admin/resume` - Pause control
//! - `POST /admin/reissue` - Unlock a binding, issue a fresh signature
//! - `GET  /realtime` - WebSocket feed of broadcast events

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use crate::broadcast::BroadcastHub;
use crate::error::EngineError;
use crate::store::{
    ClaimSessionInput, CreateSessionInput, HeartbeatInput, ReconnectInput, ReportEventInput,
    SessionStore, SetProctorPinInput,
};

/// Maximum request body: heartbeat payloads are small, nothing here needs
/// more than this.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Server state shared across handlers.
pub struct AppState {
    pub store: SessionStore,
    pub hub: Arc<BroadcastHub>,
}

/// The HTTP server. Build with [`Server::new`], then [`Server::start`].
pub struct Server {
    port: u16,
    bind_address: String,
    store: SessionStore,
    hub: Arc<BroadcastHub>,
}

impl Server {
    pub fn new(port: u16, store: SessionStore, hub: Arc<BroadcastHub>) -> Self {
        Self {
            port,
            bind_address: "127.0.0.1".to_string(),
            store,
            hub,
        }
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        let state = Arc::new(AppState {
            store: self.store.clone(),
            hub: self.hub.clone(),
        });

        Router::new()
            .route("/health", get(health_handler))
            .route("/session", post(create_session_handler))
            .route("/session/claim", post(claim_handler))
            .route("/session/heartbeat", post(heartbeat_handler))
            .route("/session/event", post(report_event_handler))
            .route("/session/reconnect", post(reconnect_handler))
            .route("/session/launch", get(launch_config_handler))
            .route("/session/whitelist", get(whitelist_handler))
            .route("/session/pin/status", get(pin_status_handler))
            .route("/session/pin/verify", post(pin_verify_handler))
            .route("/exam/launch", get(check_launch_handler))
            .route("/admin/monitor", get(monitor_handler))
            .route("/admin/whitelist", post(add_whitelist_handler))
            .route("/admin/launch-url", post(update_launch_url_handler))
            .route("/admin/pin", post(set_pin_handler))
            .route("/admin/finish", post(finish_handler))
            .route("/admin/revoke", post(revoke_handler))
            .route("/admin/revoke-token", post(revoke_token_handler))
            .route("/admin/pause", post(pause_handler))
            .route("/admin/resume", post(resume_handler))
            .route("/admin/reissue", post(reissue_handler))
            .route("/realtime", get(realtime_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .layer(TimeoutLayer::new(Duration::from_secs(15)))
            .with_state(state)
    }

    /// Start the server with graceful shutdown.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router();
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!("Starting server on {}", addr);

        if self.bind_address == "127.0.0.1" {
            tracing::warn!(
                "Server is binding to 127.0.0.1; exam devices on the network cannot reach it. \
                Use 0.0.0.0 to accept connections from the exam room."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Another examgate instance may be running; \
                    stop it or pick a different port with --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Pull the capability signature from `Authorization: Bearer <sig>` or the
/// `x-session-signature` header.
fn signature_from_headers(headers: &HeaderMap) -> Result<String, EngineError> {
    if let Some(value) = headers.get("authorization") {
        let raw = value.to_str().map_err(|_| {
            EngineError::unauthorized("SIGNATURE_REQUIRED", "Malformed authorization header")
        })?;
        if let Some(token) = raw.strip_prefix("Bearer ") {
            return Ok(token.trim().to_string());
        }
    }
    if let Some(value) = headers.get("x-session-signature") {
        let raw = value.to_str().map_err(|_| {
            EngineError::unauthorized("SIGNATURE_REQUIRED", "Malformed signature header")
        })?;
        return Ok(raw.trim().to_string());
    }
    Err(EngineError::unauthorized(
        "SIGNATURE_REQUIRED",
        "Capability signature is required",
    ))
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "subscribers": state.hub.subscriber_count(),
    }))
}

async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CreateSessionInput>,
) -> Result<Response, EngineError> {
    let output = state.store.create_session(input).await?;
    Ok(Json(output).into_response())
}

async fn claim_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ClaimSessionInput>,
) -> Result<Response, EngineError> {
    let output = state.store.claim_session(input).await?;
    Ok(Json(output).into_response())
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    // The raw body is archived verbatim with the heartbeat row.
    let input: HeartbeatInput = serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::validation("HEARTBEAT_MALFORMED", e.to_string()))?;
    let output = state.store.handle_heartbeat(&signature, input, raw).await?;
    Ok(Json(output).into_response())
}

async fn report_event_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<ReportEventInput>,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let output = state.store.report_event(&signature, input).await?;
    Ok(Json(output).into_response())
}

async fn reconnect_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ReconnectInput>,
) -> Result<Response, EngineError> {
    let output = state.store.reconnect_session(input).await?;
    Ok(Json(output).into_response())
}

async fn launch_config_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let output = state.store.get_launch_config(&signature).await?;
    Ok(Json(output).into_response())
}

async fn whitelist_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let urls = state.store.get_whitelist(&signature).await?;
    Ok(Json(serde_json::json!({ "whitelist": urls })).into_response())
}

#[derive(Deserialize)]
struct CheckLaunchQuery {
    url: String,
}

async fn check_launch_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CheckLaunchQuery>,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let allowed = state
        .store
        .check_launch_target(&signature, &query.url)
        .await?;
    Ok(Json(serde_json::json!({ "allowed": allowed })).into_response())
}

async fn pin_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let output = state.store.proctor_pin_status(&signature).await?;
    Ok(Json(output).into_response())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct VerifyPinBody {
    pin: String,
}

async fn pin_verify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<VerifyPinBody>,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let outcome = state.store.verify_proctor_pin(&signature, &body.pin).await?;
    Ok(Json(serde_json::json!({ "outcome": outcome })).into_response())
}

async fn monitor_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let output = state.store.monitor(&signature).await?;
    Ok(Json(output).into_response())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UrlBody {
    url: String,
}

async fn add_whitelist_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UrlBody>,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let urls = state.store.add_whitelist_url(&signature, &body.url).await?;
    Ok(Json(serde_json::json!({ "whitelist": urls })).into_response())
}

async fn update_launch_url_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UrlBody>,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let output = state.store.update_launch_url(&signature, &body.url).await?;
    Ok(Json(output).into_response())
}

async fn set_pin_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<SetProctorPinInput>,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let output = state.store.set_proctor_pin(&signature, input).await?;
    Ok(Json(output).into_response())
}

async fn finish_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let output = state.store.finish_session(&signature).await?;
    Ok(Json(output).into_response())
}

async fn revoke_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let output = state.store.revoke_session(&signature).await?;
    Ok(Json(output).into_response())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RevokeTokenBody {
    token: String,
}

async fn revoke_token_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RevokeTokenBody>,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    state
        .store
        .revoke_student_token(&signature, &body.token)
        .await?;
    Ok(Json(serde_json::json!({ "revoked": true })).into_response())
}

async fn pause_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let session = state.store.pause_session(&signature).await?;
    Ok(Json(session).into_response())
}

async fn resume_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let session = state.store.resume_session(&signature).await?;
    Ok(Json(session).into_response())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReissueBody {
    binding_id: String,
}

async fn reissue_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ReissueBody>,
) -> Result<Response, EngineError> {
    let signature = signature_from_headers(&headers)?;
    let output = state
        .store
        .reissue_student_signature(&signature, &body.binding_id)
        .await?;
    Ok(Json(output).into_response())
}

// =============================================================================
// REALTIME FEED
// =============================================================================

async fn realtime_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| realtime_feed(socket, state))
}

/// Forward broadcast events to one WebSocket subscriber until either side
/// goes away. A subscriber that falls behind skips the missed window and
/// keeps receiving; it never stalls the hub.
async fn realtime_feed(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.hub.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "realtime subscriber lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Graceful shutdown signal handler. Waits for SIGINT/SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }

    tracing::info!("Shutting down server");
}
