//! Gateway-side status session. One session runs per client connection: it
//! validates the request, asks the render host for a job, then polls for
//! completion while keeping a heartbeat with the client.

pub mod heartbeat;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{HeartbeatConfig, SessionConfig};
use crate::envelope::Envelope;
use crate::rpc::{FinishStatus, RenderBackend, RpcError, StartOutcome};
use crate::workspace::{path_string, Animation, JobLayout, Workspace, WorkspaceError};
pub use heartbeat::{Heartbeat, HeartbeatError};

pub const COMPLETE_TEXT: &str = "Animation has been created.";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("status channel transport failed: {0}")]
    Transport(String),
    #[error("undecodable status message: {0}")]
    Decode(String),
}

/// Bidirectional message channel to one connected client.
#[async_trait]
pub trait StatusChannel: Send {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError>;

    /// Next inbound message, or `None` once the client has gone away.
    async fn recv(&mut self) -> Option<Result<Envelope, ChannelError>>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Accepted,
    Validating,
    AlreadyComplete,
    Preparing,
    RequestingRender,
    Polling,
    Complete,
    Error,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Accepted, Validating)
                | (Validating, AlreadyComplete | Preparing | Error)
                | (Preparing, RequestingRender | Error)
                | (RequestingRender, Polling | Error)
                | (Polling, Complete | Error)
                | (AlreadyComplete | Complete | Error, Closed)
        )
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    InvalidRequest(#[from] WorkspaceError),
    #[error("Failed to prepare the render configuration: {0:#}")]
    Prepare(anyhow::Error),
    #[error("Render host request failed: {0}")]
    Transport(#[from] RpcError),
    #[error("The connection with the client has been lost: {0}")]
    Disconnected(String),
    #[error("Rendering exceeded the time limit of {ticks} ticks.")]
    RenderTimeout { ticks: u64 },
    #[error("Rendering finished but {0} is missing.")]
    MissingArtifact(String),
}

impl From<HeartbeatError> for SessionError {
    fn from(err: HeartbeatError) -> Self {
        SessionError::Disconnected(err.to_string())
    }
}

/// Live view of a session, published for the gateway's session listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub ad_id: String,
    pub animation: String,
    pub state: SessionState,
    pub job_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Last state before `CLOSED`.
    pub state: SessionState,
    pub terminal: Envelope,
    pub job_id: Option<String>,
}

pub struct StatusSession {
    id: Uuid,
    ad_id: String,
    animation_name: String,
    state: SessionState,
    job_id: Option<String>,
    connection_timer: u64,
    render_timer: u64,
    config: SessionConfig,
    heartbeat: Heartbeat,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl StatusSession {
    pub fn new(
        ad_id: impl Into<String>,
        animation_name: impl Into<String>,
        config: SessionConfig,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        let id = Uuid::new_v4();
        let ad_id = ad_id.into();
        let animation_name = animation_name.into();
        let (snapshot, _) = watch::channel(SessionSnapshot {
            id: id.to_string(),
            ad_id: ad_id.clone(),
            animation: animation_name.clone(),
            state: SessionState::Accepted,
            job_id: None,
            started_at: Utc::now(),
        });

        Self {
            id,
            ad_id,
            animation_name,
            state: SessionState::Accepted,
            job_id: None,
            connection_timer: 0,
            render_timer: 0,
            config,
            heartbeat: Heartbeat::new(heartbeat),
            snapshot,
        }
    }

    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Drives the session to completion. The client receives exactly one
    /// terminal message, after which the channel is closed.
    pub async fn run<C, B>(
        mut self,
        channel: &mut C,
        backend: &B,
        workspace: &Workspace,
    ) -> SessionOutcome
    where
        C: StatusChannel + ?Sized,
        B: RenderBackend + ?Sized,
    {
        info!(
            session_id = %self.id,
            ad_id = %self.ad_id,
            animation = %self.animation_name,
            "Status session accepted"
        );

        let terminal = self.drive(channel, backend, workspace).await;
        if let Err(err) = channel.send(&terminal).await {
            warn!(session_id = %self.id, error = %err, "Failed to deliver terminal message");
        }
        channel.close().await;

        let state = self.state;
        self.transition(SessionState::Closed);
        info!(
            session_id = %self.id,
            state = ?state,
            kind = %terminal.kind(),
            "Status session closed"
        );

        SessionOutcome {
            state,
            terminal,
            job_id: self.job_id.take(),
        }
    }

    async fn drive<C, B>(&mut self, channel: &mut C, backend: &B, workspace: &Workspace) -> Envelope
    where
        C: StatusChannel + ?Sized,
        B: RenderBackend + ?Sized,
    {
        self.transition(SessionState::Validating);
        let layout = match self.validate(workspace) {
            Ok(layout) => layout,
            Err(err) => return self.fail(err),
        };
        let artifact = path_string(&layout.relative_artifact_path());

        if layout.artifact_exists() {
            self.transition(SessionState::AlreadyComplete);
            info!(session_id = %self.id, ad_id = %self.ad_id, %artifact, "Animation already rendered");
            return Envelope::complete(COMPLETE_TEXT, Some(artifact));
        }

        self.transition(SessionState::Preparing);
        let config_path = match workspace.prepare_render_config(&layout) {
            Ok(path) => path,
            Err(err) => return self.fail(SessionError::Prepare(err)),
        };

        self.transition(SessionState::RequestingRender);
        let (job_id, running) = match backend.start_render(&config_path).await {
            Ok(StartOutcome::Admitted {
                job_id,
                queue_position,
                text,
            }) => {
                let running = Envelope::Running {
                    text,
                    job_id: Some(job_id.clone()),
                    queue_position,
                };
                (job_id, running)
            }
            Ok(StartOutcome::Full { text }) => {
                warn!(session_id = %self.id, ad_id = %self.ad_id, "Render host is at capacity");
                self.transition(SessionState::Error);
                return Envelope::full_job(text);
            }
            Err(err) => return self.fail(err.into()),
        };

        self.job_id = Some(job_id.clone());
        self.transition(SessionState::Polling);
        info!(session_id = %self.id, job_id = %job_id, "Render job admitted");

        let polled = match channel.send(&running).await {
            Ok(()) => self.poll(channel, backend, &layout, &job_id).await,
            Err(err) => Err(SessionError::Disconnected(err.to_string())),
        };

        match polled {
            Ok(()) => {
                self.transition(SessionState::Complete);
                info!(session_id = %self.id, job_id = %job_id, %artifact, "Animation rendered");
                Envelope::complete(COMPLETE_TEXT, Some(artifact))
            }
            Err(err) => {
                self.cancel(backend, &job_id).await;
                self.fail(err)
            }
        }
    }

    fn validate(&self, workspace: &Workspace) -> Result<JobLayout, SessionError> {
        let animation: Animation = self.animation_name.parse()?;
        Ok(workspace.layout(&self.ad_id, animation)?)
    }

    /// One iteration per tick: heartbeat, then finish check, then the render
    /// time limit.
    async fn poll<C, B>(
        &mut self,
        channel: &mut C,
        backend: &B,
        layout: &JobLayout,
        job_id: &str,
    ) -> Result<(), SessionError>
    where
        C: StatusChannel + ?Sized,
        B: RenderBackend + ?Sized,
    {
        loop {
            if self.connection_timer % self.config.connection_period.max(1) == 0 {
                self.heartbeat.check(channel).await?;
            }

            if self.finish_check_due() {
                match backend.is_finish_render(job_id).await? {
                    FinishStatus::Finished if layout.artifact_exists() => return Ok(()),
                    FinishStatus::Finished => {
                        let artifact = path_string(&layout.relative_artifact_path());
                        error!(
                            session_id = %self.id,
                            job_id,
                            %artifact,
                            "Render job finished without producing an artifact"
                        );
                        return Err(SessionError::MissingArtifact(artifact));
                    }
                    FinishStatus::Running => {
                        debug!(session_id = %self.id, job_id, ticks = self.render_timer, "Render in progress")
                    }
                }
            }

            if self.render_timer >= self.config.max_render_time {
                return Err(SessionError::RenderTimeout {
                    ticks: self.render_timer,
                });
            }

            sleep(self.config.tick()).await;
            self.connection_timer += 1;
            self.render_timer += 1;
        }
    }

    fn finish_check_due(&self) -> bool {
        self.render_timer > self.config.finish_check_grace
            && self.render_timer % self.config.finish_check_period.max(1) == 0
    }

    async fn cancel<B>(&self, backend: &B, job_id: &str)
    where
        B: RenderBackend + ?Sized,
    {
        match backend.cancel_render(job_id).await {
            Ok(()) => info!(session_id = %self.id, job_id, "Cancelled render job"),
            Err(err) => error!(session_id = %self.id, job_id, error = %err, "Failed to cancel render job"),
        }
    }

    fn fail(&mut self, err: SessionError) -> Envelope {
        error!(session_id = %self.id, ad_id = %self.ad_id, error = %err, "Status session failed");
        self.transition(SessionState::Error);
        Envelope::error(err.to_string())
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!(session_id = %self.id, from = ?self.state, to = ?next, "Unexpected session transition");
        }
        debug!(session_id = %self.id, from = ?self.state, to = ?next, "Session transition");
        self.state = next;

        let job_id = self.job_id.clone();
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = next;
            snapshot.job_id = job_id;
        });
    }
}
