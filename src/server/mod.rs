//! Transport shell: axum router for the hook ingress, read-only snapshot
//! endpoints, and the per-client WebSocket fan-out described in §4.6.
//! Pure transport-edge policy; holds no business logic beyond request
//! validation and event-filtering against a `StateManager` handle.

use crate::hooks::{HookEvent, HookHandler};
use crate::model::{now_ms, BroadcastEvent};
use crate::state::StateManager;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const KNOWN_HOOK_EVENTS: &[&str] = &[
    "PreToolUse",
    "PostToolUse",
    "PostToolUseFailure",
    "PermissionRequest",
    "SubagentStart",
    "SubagentStop",
    "PreCompact",
    "Stop",
    "SessionStart",
    "SessionEnd",
    "TeammateIdle",
    "TaskCompleted",
    "UserPromptSubmit",
    "Notification",
];

static SESSION_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._-]{1,128}$").unwrap());

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<StateManager>,
    pub hooks: Arc<HookHandler>,
    pub auth_token: Option<String>,
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/hook", post(post_hook))
        .route("/api/state", get(get_state))
        .route("/api/sessions", get(get_sessions))
        .route("/api/health", get(get_health))
        .route("/ws", get(ws_upgrade))
        .layer(axum::middleware::from_fn_with_state(app_state.clone(), auth_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn auth_middleware(
    State(app_state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let Some(expected) = &app_state.auth_token else {
        return next.run(request).await;
    };

    let from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let authorized = from_header == Some(expected.as_str()) || query.token.as_deref() == Some(expected.as_str());

    if authorized {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
    }
}

fn validate_hook_body(body: &Value) -> Result<(), String> {
    let Some(event_name) = body.get("hook_event_name").and_then(Value::as_str) else {
        return Err("missing hook_event_name".to_string());
    };
    if !KNOWN_HOOK_EVENTS.contains(&event_name) {
        return Err(format!("unknown hook_event_name: {event_name}"));
    }
    let Some(session_id) = body.get("session_id").and_then(Value::as_str) else {
        return Err("missing session_id".to_string());
    };
    if !SESSION_ID_PATTERN.is_match(session_id) {
        return Err("invalid session_id".to_string());
    }
    if let Some(cwd) = body.get("cwd").and_then(Value::as_str) {
        if cwd.len() > 1024 || cwd.contains('\0') || !cwd.starts_with('/') {
            return Err("invalid cwd".to_string());
        }
    }
    Ok(())
}

async fn post_hook(State(app_state): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Err(reason) = validate_hook_body(&body) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": reason}))).into_response();
    }

    let event: HookEvent = match serde_json::from_value(body) {
        Ok(e) => e,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response();
        }
    };

    if let Err(e) = app_state.hooks.handle_event(event).await {
        tracing::warn!(error = %e, "hook event rejected");
        return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response();
    }

    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

async fn get_state(State(app_state): State<AppState>) -> Json<crate::model::TeamState> {
    Json(app_state.state.current_state())
}

async fn get_sessions(State(app_state): State<AppState>) -> Json<Vec<crate::model::SessionListEntry>> {
    Json(app_state.state.sessions_snapshot().flat_sessions)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    timestamp: i64,
}

async fn get_health() -> Json<Health> {
    Json(Health {
        status: "ok",
        timestamp: now_ms(),
    })
}

async fn ws_upgrade(State(app_state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SelectSession { session_id: String },
}

async fn handle_socket(mut socket: WebSocket, app_state: AppState) {
    let mut selected_session_id = app_state.state.get_most_interesting_session_id();
    let mut explicitly_selected = false;
    let mut rx = app_state.state.subscribe();

    send_client_snapshot(&mut socket, &app_state, selected_session_id.as_deref(), true).await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if !forward_event(&mut socket, &app_state, &event, selected_session_id.as_deref(), explicitly_selected).await {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(ClientMessage::SelectSession { session_id }) = serde_json::from_str(&text) {
                            selected_session_id = Some(session_id);
                            explicitly_selected = true;
                            send_client_snapshot(&mut socket, &app_state, selected_session_id.as_deref(), true).await;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: &impl Serialize) -> bool {
    let Ok(text) = serde_json::to_string(value) else { return true };
    socket.send(WsMessage::Text(text.into())).await.is_ok()
}

async fn send_client_snapshot(
    socket: &mut WebSocket,
    app_state: &AppState,
    session_id: Option<&str>,
    include_full_state: bool,
) {
    if include_full_state {
        if let Some(sid) = session_id {
            if let Some(state) = app_state.state.get_state_for_session(sid) {
                let _ = send_json(socket, &BroadcastEvent::FullState(state)).await;
            }
        }
    }
    let grouped = app_state.state.sessions_snapshot();
    let _ = send_json(socket, &BroadcastEvent::SessionsList(grouped.flat_sessions.clone())).await;
    let _ = send_json(socket, &BroadcastEvent::SessionsGrouped(grouped)).await;
}

/// §4.6 per-client filter: returns false if the socket is gone and the
/// connection loop should end.
async fn forward_event(
    socket: &mut WebSocket,
    app_state: &AppState,
    event: &BroadcastEvent,
    selected: Option<&str>,
    explicitly_selected: bool,
) -> bool {
    match event {
        BroadcastEvent::FullState(_) => {
            send_client_snapshot(socket, app_state, selected, true).await;
            true
        }
        BroadcastEvent::SessionsList(_) | BroadcastEvent::SessionsGrouped(_) => {
            send_client_snapshot(socket, app_state, selected, false).await;
            true
        }
        BroadcastEvent::SessionStarted(_) | BroadcastEvent::SessionEnded { .. } => {
            let ok = send_json(socket, event).await;
            // A client that never explicitly chose a session is still
            // following the server's auto-selected default, which may now
            // be stale, so resend full_state too.
            send_client_snapshot(socket, app_state, selected, !explicitly_selected).await;
            ok
        }
        BroadcastEvent::AgentRemoved { .. } => send_json(socket, event).await,
        BroadcastEvent::AgentUpdate(agent) | BroadcastEvent::AgentAdded(agent) => {
            let belongs = selected
                .map(|sid| app_state.state.agent_belongs_to_session(&agent.id, sid))
                .unwrap_or(false);
            if belongs {
                send_json(socket, event).await
            } else {
                true
            }
        }
        BroadcastEvent::TaskUpdate(_) | BroadcastEvent::NewMessage(_) => send_json(socket, event).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitprobe::GitExecutor;
    use async_trait::async_trait;
    use tower::ServiceExt;

    struct NoopExecutor;
    #[async_trait]
    impl GitExecutor for NoopExecutor {
        async fn run(&self, _cwd: &std::path::Path, _args: &[&str]) -> Result<String, crate::errors::ParseError> {
            Err(crate::errors::ParseError::GitFailed("no git in tests".into()))
        }
    }

    fn test_app(auth_token: Option<String>) -> Router {
        let state = StateManager::new();
        let hooks = HookHandler::new(state.clone(), Arc::new(NoopExecutor));
        router(AppState {
            state,
            hooks,
            auth_token,
        })
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = test_app(None);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/api/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn hook_endpoint_rejects_unknown_event_name() {
        let app = test_app(None);
        let body = json!({"hook_event_name": "NotARealEvent", "session_id": "s1"}).to_string();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/hook")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn hook_endpoint_accepts_valid_event() {
        let app = test_app(None);
        let body = json!({
            "hook_event_name": "UserPromptSubmit",
            "session_id": "abc123",
            "cwd": "/tmp/project"
        })
        .to_string();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/hook")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_routes_require_bearer_token() {
        let app = test_app(Some("secret".to_string()));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/api/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn protected_routes_accept_valid_bearer_token() {
        let app = test_app(Some("secret".to_string()));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health")
                    .header("authorization", "Bearer secret")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
