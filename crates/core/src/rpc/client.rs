use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::{FinishStatus, RenderBackend, RpcError, RpcRequest, StartOutcome};
use crate::config::RpcConfig;
use crate::envelope::Envelope;
use crate::server::ErrorResponse;

/// HTTP client for the render host's `/rpc` endpoint. Every call carries its
/// own deadline; no call outlives it.
#[derive(Debug, Clone)]
pub struct RenderHostClient {
    rpc_url: Url,
    client: reqwest::Client,
    call_timeout: Duration,
    finish_check_timeout: Duration,
}

impl RenderHostClient {
    pub fn new(base_url: &str, config: &RpcConfig) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid render host URL")?;
        let rpc_url = base_url
            .join("rpc")
            .context("failed to build render host RPC URL")?;

        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            rpc_url,
            client,
            call_timeout: config.call_timeout(),
            finish_check_timeout: config.finish_check_timeout(),
        })
    }

    pub fn rpc_url(&self) -> &Url {
        &self.rpc_url
    }

    /// Sends one request and validates that the reply kind belongs to the
    /// operation's contract.
    pub async fn call(&self, request: &RpcRequest, timeout: Duration) -> Result<Envelope, RpcError> {
        let method = request.method();
        let envelope = match tokio::time::timeout(timeout, self.send(request, timeout)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RpcError::Timeout {
                    method,
                    timeout_ms: timeout.as_millis(),
                })
            }
        };

        if !request.expected_kinds().contains(&envelope.kind()) {
            return Err(RpcError::UnexpectedKind {
                method,
                kind: envelope.kind(),
            });
        }

        debug!(method, kind = %envelope.kind(), "RPC call completed");
        Ok(envelope)
    }

    async fn send(&self, request: &RpcRequest, timeout: Duration) -> Result<Envelope, RpcError> {
        let method = request.method();
        let transport_error = |err: reqwest::Error| {
            if err.is_timeout() {
                RpcError::Timeout {
                    method,
                    timeout_ms: timeout.as_millis(),
                }
            } else {
                RpcError::Connection {
                    method,
                    message: err.to_string(),
                }
            }
        };

        let resp = self
            .client
            .post(self.rpc_url.clone())
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(transport_error)?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorResponse>(&body)
                .map(|err| err.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            return Err(RpcError::Remote {
                method,
                status: status.as_u16(),
                message,
            });
        }

        Envelope::decode_slice(&body).map_err(|source| RpcError::Protocol { method, source })
    }
}

#[async_trait]
impl RenderBackend for RenderHostClient {
    async fn ping(&self, n: i64) -> Result<i64, RpcError> {
        let request = RpcRequest::Ping { n };
        match self.call(&request, self.call_timeout).await? {
            Envelope::Ping { echo: Some(echo), .. } => Ok(echo),
            Envelope::Ping { echo: None, .. } => Err(RpcError::MissingField {
                method: request.method(),
                field: "echo",
            }),
            other => Err(RpcError::UnexpectedKind {
                method: request.method(),
                kind: other.kind(),
            }),
        }
    }

    async fn start_render(&self, config_path: &str) -> Result<StartOutcome, RpcError> {
        let request = RpcRequest::StartRender {
            config_path: config_path.to_string(),
        };
        match self.call(&request, self.call_timeout).await? {
            Envelope::Running {
                text,
                job_id: Some(job_id),
                queue_position,
            } => Ok(StartOutcome::Admitted {
                job_id,
                queue_position,
                text,
            }),
            Envelope::Running { job_id: None, .. } => Err(RpcError::MissingField {
                method: request.method(),
                field: "job_id",
            }),
            Envelope::FullJob { text } => Ok(StartOutcome::Full { text }),
            other => Err(RpcError::UnexpectedKind {
                method: request.method(),
                kind: other.kind(),
            }),
        }
    }

    async fn cancel_render(&self, job_id: &str) -> Result<(), RpcError> {
        let request = RpcRequest::CancelRender {
            job_id: job_id.to_string(),
        };
        self.call(&request, self.call_timeout).await.map(|_| ())
    }

    async fn is_finish_render(&self, job_id: &str) -> Result<FinishStatus, RpcError> {
        let request = RpcRequest::IsFinishRender {
            job_id: job_id.to_string(),
        };
        match self.call(&request, self.finish_check_timeout).await? {
            Envelope::Terminate { .. } => Ok(FinishStatus::Finished),
            Envelope::Running { .. } => Ok(FinishStatus::Running),
            other => Err(RpcError::UnexpectedKind {
                method: request.method(),
                kind: other.kind(),
            }),
        }
    }
}
