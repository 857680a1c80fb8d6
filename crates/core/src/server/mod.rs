//! Gateway HTTP surface: the status WebSocket plus a small JSON API.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::config::{AppConfig, HeartbeatConfig, SessionConfig};
use crate::envelope::Envelope;
use crate::rpc::RenderBackend;
use crate::session::{ChannelError, SessionSnapshot, StatusChannel, StatusSession};
use crate::workspace::Workspace;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    session: SessionConfig,
    heartbeat: HeartbeatConfig,
    workspace: Workspace,
    backend: Arc<dyn RenderBackend>,
    sessions: DashMap<String, watch::Receiver<SessionSnapshot>>,
}

impl AppState {
    pub fn new(config: &AppConfig, workspace: Workspace, backend: Arc<dyn RenderBackend>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                session: config.session.clone(),
                heartbeat: config.heartbeat.clone(),
                workspace,
                backend,
                sessions: DashMap::new(),
            }),
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().borrow().clone())
            .collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }
}

#[derive(Debug, Deserialize)]
pub struct MakeAnimationQuery {
    pub ad_id: String,
    pub ad_animation: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/make_animation", any(make_animation))
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.session_count(),
    })
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.session_snapshots())
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn make_animation(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<MakeAnimationQuery>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(state, socket, query))
}

async fn run_session(state: AppState, socket: WebSocket, query: MakeAnimationQuery) {
    let inner = &state.inner;
    let session = StatusSession::new(
        query.ad_id,
        query.ad_animation,
        inner.session.clone(),
        inner.heartbeat.clone(),
    );
    let session_id = session.id();
    inner.sessions.insert(session_id.clone(), session.subscribe());

    let mut channel = WsChannel::new(socket);
    let outcome = session
        .run(&mut channel, inner.backend.as_ref(), &inner.workspace)
        .await;

    inner.sessions.remove(&session_id);
    info!(
        session_id = %session_id,
        state = ?outcome.state,
        job_id = outcome.job_id.as_deref().unwrap_or("-"),
        "Client connection released"
    );
}

/// [`StatusChannel`] over an axum WebSocket. Envelopes travel as text frames;
/// transport-level ping/pong frames are skipped.
pub struct WsChannel {
    socket: WebSocket,
}

impl WsChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl StatusChannel for WsChannel {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        self.socket
            .send(Message::Text(envelope.encode().into()))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Envelope, ChannelError>> {
        loop {
            let message = match self.socket.recv().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(ChannelError::Transport(err.to_string()))),
            };
            let decoded = match message {
                Message::Text(text) => Envelope::decode(text.as_str()),
                Message::Binary(bytes) => Envelope::decode_slice(&bytes),
                Message::Close(_) => return None,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            return Some(decoded.map_err(|err| ChannelError::Decode(err.to_string())));
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.socket.send(Message::Close(None)).await {
            debug!(error = %err, "WebSocket already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::session::test_support::FakeBackend;
    use crate::session::SessionState;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::{Service, ServiceExt};

    fn test_state() -> AppState {
        let workspace = Workspace::new(PathsConfig {
            files_dir: std::env::temp_dir().join("drawanim-gateway-tests"),
            ..PathsConfig::default()
        });
        AppState::new(
            &AppConfig::default(),
            workspace,
            Arc::new(FakeBackend::admitting("job-1")),
        )
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn snapshot(id: &str, state: SessionState) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            ad_id: "ad-1".to_string(),
            animation: "dab".to_string(),
            state,
            job_id: Some("job-1".to_string()),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let mut app = app_router(test_state());
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = json_body(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_sessions"], 0);
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_json_404() {
        let mut app = app_router(test_state());
        let req = Request::builder()
            .uri("/api/does/not/exist")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let json = json_body(resp).await;
        assert_eq!(json["error"], "api endpoint not found: /api/does/not/exist");
    }

    #[tokio::test]
    async fn test_list_sessions_reports_live_state() {
        let state = test_state();
        let (tx, rx) = watch::channel(snapshot("s-1", SessionState::Polling));
        state.inner.sessions.insert("s-1".to_string(), rx);
        let mut app = app_router(state.clone());

        let req = Request::builder()
            .uri("/api/sessions")
            .body(Body::empty())
            .unwrap();
        let json = json_body(send_request(&mut app, req).await).await;
        assert_eq!(json[0]["id"], "s-1");
        assert_eq!(json[0]["state"], "POLLING");
        assert_eq!(json[0]["job_id"], "job-1");

        tx.send_modify(|s| s.state = SessionState::Complete);
        let req = Request::builder()
            .uri("/api/sessions")
            .body(Body::empty())
            .unwrap();
        let json = json_body(send_request(&mut app, req).await).await;
        assert_eq!(json[0]["state"], "COMPLETE");
        assert_eq!(state.session_count(), 1);
    }

    #[tokio::test]
    async fn test_make_animation_requires_websocket_upgrade() {
        let mut app = app_router(test_state());
        let req = Request::builder()
            .uri("/make_animation?ad_id=ad-1&ad_animation=dab")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert!(resp.status().is_client_error());
    }

    #[test]
    fn test_app_error_maps_status_codes() {
        assert_eq!(
            AppError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(anyhow::anyhow!("boom")).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
