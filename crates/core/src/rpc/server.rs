use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{debug, error};

use super::RpcRequest;
use crate::envelope::Envelope;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::server::AppError;

#[derive(Clone)]
struct RenderHostState {
    scheduler: Arc<Scheduler>,
}

#[derive(Serialize)]
pub struct RenderHostHealth {
    pub status: String,
    #[serde(flatten)]
    pub scheduler: SchedulerStats,
}

/// Render host surface: `POST /rpc` and `GET /health`.
pub fn render_host_router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/rpc", post(rpc))
        .route("/health", get(health))
        .with_state(RenderHostState { scheduler })
}

async fn health(State(state): State<RenderHostState>) -> Json<RenderHostHealth> {
    Json(RenderHostHealth {
        status: "ok".to_string(),
        scheduler: state.scheduler.stats(),
    })
}

async fn rpc(
    State(state): State<RenderHostState>,
    payload: Result<Json<RpcRequest>, JsonRejection>,
) -> Result<Json<Envelope>, AppError> {
    let Json(request) =
        payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let method = request.method();
    debug!(method, "RPC request received");

    // Cancellation joins the killed worker, so keep it off the async workers.
    let scheduler = state.scheduler.clone();
    let result = tokio::task::spawn_blocking(move || scheduler.dispatch(request))
        .await
        .map_err(|err| AppError::Internal(format!("{method} task failed: {err}")))?;

    match result {
        Ok(envelope) => Ok(Json(envelope)),
        Err(err) => {
            error!(method, error = %err, "RPC request failed");
            Err(AppError::Internal(err.to_string()))
        }
    }
}
