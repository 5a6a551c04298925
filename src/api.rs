//! The WebSocket gateway: where browser clients meet the session registry.
//!
//! One WebSocket connection = one client id = at most one host session.
//! Frames are the tagged JSON events of [`crate::protocol`]. The handler
//! fans in: session events arrive on a per-client channel and go out as
//! text frames; inbound frames are dispatched to the registry.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::handshake::Credentials;
use crate::protocol::{latin1_encode, ClientEvent, ServerEvent, SessionStatus};
use crate::session::{EventSink, RegistryError, SessionRegistry};
use crate::shutdown::ShutdownCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub shutdown: ShutdownCoordinator,
}

/// Structured error for the HTTP surface.
///
/// Small on purpose: everything session-related travels over the WebSocket
/// as `error` events, so only the pre-upgrade surface needs HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via Authorization header or ?token= query parameter.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
}

/// Extract a `?token=` value from the query string.
///
/// Browser WebSocket clients cannot set headers, so the upgrade request
/// carries the token in the query instead.
fn extract_query_token(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(|v| v.to_string()))
    })
}

/// Auth middleware: Bearer header or `?token=` query, compared in constant
/// time.
pub async fn require_auth(
    expected_token: String,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match extract_bearer(&req).or_else(|| extract_query_token(&req)) {
        Some(token) if token.as_bytes().ct_eq(expected_token.as_bytes()).into() => {
            Ok(next.run(req).await)
        }
        Some(_) => Err(ApiError::AuthInvalid),
        None => Err(ApiError::AuthRequired),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub fn router(state: AppState, token: Option<String>) -> Router {
    let routes = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let routes = match token {
        Some(token) => routes.layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            async move { require_auth(t, req, next).await }
        })),
        None => routes,
    };

    Router::new()
        .route("/health", get(health))
        .merge(routes)
        // The terminal page may be served from anywhere on the LAN.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_event(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize server event");
            Ok(())
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    // Register for graceful shutdown so the close frame gets flushed.
    let (_guard, mut shutdown_rx) = state.shutdown.register();

    let client_id = Uuid::new_v4().to_string();
    tracing::info!(client = %client_id, "websocket client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // The sink stays alive in this scope, so `events_rx` can never yield
    // `None` while the loop runs.
    let (events, mut events_rx) = EventSink::channel();

    if send_event(
        &mut ws_tx,
        &ServerEvent::Connected {
            session_id: client_id.clone(),
        },
    )
    .await
    .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            // Session events -> WebSocket.
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut ws_tx, &event).await.is_err() {
                    break;
                }
            }

            // WebSocket -> registry.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => dispatch(&state, &client_id, event, &events).await,
                            Err(e) => {
                                tracing::debug!(client = %client_id, error = %e, "unparseable client event");
                                events.send(ServerEvent::error(format!("invalid message: {e}"))).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled by axum
                    Some(Err(_)) => break,
                }
            }

            // Server shutdown.
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(client = %client_id, "websocket closing for shutdown");
                    let close_frame = CloseFrame {
                        code: axum::extract::ws::close_code::NORMAL,
                        reason: "server shutting down".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }

    // The transport is gone; whatever session the client had goes with it.
    state.sessions.close(&client_id);
    tracing::info!(client = %client_id, "websocket client disconnected");
}

async fn dispatch(state: &AppState, client_id: &str, event: ClientEvent, events: &EventSink) {
    match event {
        ClientEvent::StartSession { username, password } => {
            // The handshake takes tens of seconds; run it off the event loop
            // so output forwarding and disconnects stay responsive.
            let registry = state.sessions.clone();
            let events = events.clone();
            let client_id = client_id.to_string();
            tokio::spawn(async move {
                let creds = Credentials { username, password };
                let ok = registry.start(&client_id, &creds, events.clone()).await;
                let status = if ok {
                    SessionStatus::Ok
                } else {
                    SessionStatus::Error
                };
                events.send(ServerEvent::SessionStarted { status }).await;
            });
        }
        ClientEvent::Input { data } => {
            let bytes = latin1_encode(&data);
            if let Err(RegistryError::NoActiveSession) =
                state.sessions.input(client_id, bytes).await
            {
                events.send(ServerEvent::error("no active session")).await;
            }
        }
        ClientEvent::Disconnect => {
            state.sessions.close(client_id);
            events.send(ServerEvent::Closed).await;
        }
        // The host is fixed at 80x24; nothing to resize.
        ClientEvent::Resize { .. } => {}
    }
}
