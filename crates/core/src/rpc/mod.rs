//! Request/response transport between the gateway and the render host.
//!
//! Each call is one `POST /rpc` carrying an [`RpcRequest`] and answered with
//! an [`Envelope`]. Business outcomes (`FULL_JOB`, `TERMINATE`) are normal
//! responses; only transport and protocol failures become [`RpcError`].

pub mod client;
pub mod server;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::{EnvelopeError, MessageKind};
pub use crate::scheduler::FinishStatus;
pub use client::RenderHostClient;
pub use server::render_host_router;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    Ping { n: i64 },
    StartRender { config_path: String },
    CancelRender { job_id: String },
    IsFinishRender { job_id: String },
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Ping { .. } => "ping",
            RpcRequest::StartRender { .. } => "start_render",
            RpcRequest::CancelRender { .. } => "cancel_render",
            RpcRequest::IsFinishRender { .. } => "is_finish_render",
        }
    }

    /// Response kinds a well-behaved render host may answer with. Anything
    /// else is treated as a failure.
    pub fn expected_kinds(&self) -> &'static [MessageKind] {
        match self {
            RpcRequest::Ping { .. } => &[MessageKind::Ping],
            RpcRequest::StartRender { .. } => &[MessageKind::Running, MessageKind::FullJob],
            RpcRequest::CancelRender { .. } => &[MessageKind::Terminate],
            RpcRequest::IsFinishRender { .. } => &[MessageKind::Terminate, MessageKind::Running],
        }
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{method} timed out after {timeout_ms} ms")]
    Timeout {
        method: &'static str,
        timeout_ms: u128,
    },
    #[error("{method} could not reach the render host: {message}")]
    Connection {
        method: &'static str,
        message: String,
    },
    #[error("{method} failed on the render host (HTTP {status}): {message}")]
    Remote {
        method: &'static str,
        status: u16,
        message: String,
    },
    #[error("{method} returned an undecodable response: {source}")]
    Protocol {
        method: &'static str,
        #[source]
        source: EnvelopeError,
    },
    #[error("{method} returned an unexpected {kind} response")]
    UnexpectedKind {
        method: &'static str,
        kind: MessageKind,
    },
    #[error("{method} response is missing `{field}`")]
    MissingField {
        method: &'static str,
        field: &'static str,
    },
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

/// Outcome of asking the render host to start a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Admitted {
        job_id: String,
        queue_position: Option<usize>,
        text: String,
    },
    Full {
        text: String,
    },
}

/// The four render-host operations as seen by a status session. Completion is
/// polled through `is_finish_render`; a push-based host can satisfy the same
/// contract by answering from its own notifications.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn ping(&self, n: i64) -> Result<i64, RpcError>;

    async fn start_render(&self, config_path: &str) -> Result<StartOutcome, RpcError>;

    async fn cancel_render(&self, job_id: &str) -> Result<(), RpcError>;

    async fn is_finish_render(&self, job_id: &str) -> Result<FinishStatus, RpcError>;
}
