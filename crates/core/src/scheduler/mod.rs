//! Admission control and lifecycle of render jobs on the render host.
//!
//! All bookkeeping sits behind one mutex so admission, reaping and cancellation
//! never interleave. Renders themselves run in isolated workers from a
//! [`WorkerPool`]; a crashing render cannot touch the tables.

pub mod pool;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::envelope::Envelope;
use crate::rpc::RpcRequest;
pub use pool::{ProcessPool, Worker, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Cancelled,
}

impl JobState {
    /// Forward-only; `Cancelled` is reachable from `Queued` or `Running`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Finished)
                | (JobState::Running, JobState::Cancelled)
        )
    }
}

pub struct RenderJob {
    id: String,
    config_path: String,
    state: JobState,
    worker: Option<Box<dyn Worker>>,
    admitted_at: DateTime<Utc>,
}

impl RenderJob {
    fn new(config_path: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config_path: config_path.to_string(),
            state: JobState::Queued,
            worker: None,
            admitted_at: Utc::now(),
        }
    }

    fn transition(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid job transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

impl fmt::Debug for RenderJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderJob")
            .field("id", &self.id)
            .field("config_path", &self.config_path)
            .field("state", &self.state)
            .field("pid", &self.worker.as_ref().and_then(|w| w.pid()))
            .field("admitted_at", &self.admitted_at)
            .finish()
    }
}

/// Result of `start_render`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Running immediately (`queue_position == None`) or queued at the given
    /// 1-based position.
    Running {
        job_id: String,
        queue_position: Option<usize>,
    },
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    Finished,
    Running,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to start render worker: {0:#}")]
    Spawn(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub active: usize,
    pub queued: usize,
    pub outstanding: usize,
    pub max_concurrent_jobs: usize,
    pub max_queue_length: usize,
}

#[derive(Default)]
struct JobTables {
    active: HashMap<String, RenderJob>,
    pending: VecDeque<RenderJob>,
    /// Every job admitted and not yet finished or cancelled, queued or active.
    /// Completion is observed by absence from this set.
    outstanding: HashSet<String>,
}

pub struct Scheduler {
    limits: SchedulerConfig,
    pool: Box<dyn WorkerPool>,
    tables: Mutex<JobTables>,
}

impl Scheduler {
    pub fn new(limits: SchedulerConfig, pool: Box<dyn WorkerPool>) -> Self {
        Self {
            limits,
            pool,
            tables: Mutex::new(JobTables::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobTables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ping(&self, n: i64) -> i64 {
        debug!(n, "ping");
        n
    }

    pub fn start_render(&self, config_path: &str) -> Result<Admission, SchedulerError> {
        let mut tables = self.lock();
        self.reap(&mut tables);

        let mut job = RenderJob::new(config_path);
        let job_id = job.id.clone();

        if tables.active.len() < self.limits.max_concurrent_jobs {
            let worker = self
                .pool
                .spawn(&job.id, &job.config_path)
                .map_err(SchedulerError::Spawn)?;
            job.worker = Some(worker);
            job.transition(JobState::Running);
            tables.outstanding.insert(job_id.clone());
            tables.active.insert(job_id.clone(), job);
            info!(job_id = %job_id, config_path, "Render job started");
            return Ok(Admission::Running {
                job_id,
                queue_position: None,
            });
        }

        if tables.pending.len() < self.limits.max_queue_length {
            tables.pending.push_back(job);
            tables.outstanding.insert(job_id.clone());
            let queue_position = tables.pending.len();
            info!(job_id = %job_id, queue_position, "All render slots busy; job queued");
            return Ok(Admission::Running {
                job_id,
                queue_position: Some(queue_position),
            });
        }

        info!(
            max_queue_length = self.limits.max_queue_length,
            "Render queue is full; rejecting job"
        );
        Ok(Admission::Full)
    }

    /// Idempotent: unknown, finished or already cancelled ids are a no-op.
    pub fn cancel_render(&self, job_id: &str) {
        let mut tables = self.lock();

        if !tables.outstanding.remove(job_id) {
            info!(job_id, "Cancel requested for a job that is not outstanding");
            return;
        }

        if let Some(mut job) = tables.active.remove(job_id) {
            if let Some(worker) = job.worker.as_mut() {
                if let Err(err) = worker.terminate() {
                    error!(job_id, error = ?err, "Failed to terminate render worker");
                }
            }
            job.transition(JobState::Cancelled);
            info!(job_id, "Running render job cancelled");
        } else if let Some(index) = tables.pending.iter().position(|job| job.id == job_id) {
            if let Some(mut job) = tables.pending.remove(index) {
                job.transition(JobState::Cancelled);
            }
            info!(job_id, "Queued render job cancelled");
        }

        self.process_queue(&mut tables);
    }

    pub fn is_finish_render(&self, job_id: &str) -> FinishStatus {
        let mut tables = self.lock();
        self.reap(&mut tables);

        if tables.outstanding.contains(job_id) {
            FinishStatus::Running
        } else {
            FinishStatus::Finished
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let tables = self.lock();
        SchedulerStats {
            active: tables.active.len(),
            queued: tables.pending.len(),
            outstanding: tables.outstanding.len(),
            max_concurrent_jobs: self.limits.max_concurrent_jobs,
            max_queue_length: self.limits.max_queue_length,
        }
    }

    /// Terminates every active worker and drops the queue.
    pub fn shutdown(&self) {
        let mut tables = self.lock();
        let queued = tables.pending.len();
        tables.pending.clear();

        for (job_id, mut job) in tables.active.drain() {
            if let Some(worker) = job.worker.as_mut() {
                if let Err(err) = worker.terminate() {
                    error!(job_id = %job_id, error = ?err, "Failed to terminate render worker on shutdown");
                }
            }
        }
        tables.outstanding.clear();
        info!(dropped_queued = queued, "Scheduler shut down");
    }

    /// Executes one RPC request against the tables. Blocking: cancellation
    /// joins the terminated worker.
    pub fn dispatch(&self, request: RpcRequest) -> Result<Envelope, SchedulerError> {
        let envelope = match request {
            RpcRequest::Ping { n } => Envelope::Ping {
                text: format!("render host connection successful! Received: {n}"),
                echo: Some(self.ping(n)),
            },
            RpcRequest::StartRender { config_path } => match self.start_render(&config_path)? {
                Admission::Running {
                    job_id,
                    queue_position: None,
                } => Envelope::Running {
                    text: format!("Render job started. job_id: {job_id}"),
                    job_id: Some(job_id),
                    queue_position: None,
                },
                Admission::Running {
                    job_id,
                    queue_position: Some(position),
                } => Envelope::Running {
                    text: format!(
                        "All render slots are busy; job queued at position {position}."
                    ),
                    job_id: Some(job_id),
                    queue_position: Some(position),
                },
                Admission::Full => Envelope::full_job(format!(
                    "Render queue is full. At most {} jobs may wait.",
                    self.limits.max_queue_length
                )),
            },
            RpcRequest::CancelRender { job_id } => {
                self.cancel_render(&job_id);
                Envelope::terminate(format!("Render job {job_id} terminated."))
            }
            RpcRequest::IsFinishRender { job_id } => match self.is_finish_render(&job_id) {
                FinishStatus::Finished => {
                    Envelope::terminate(format!("Render job {job_id} is finished."))
                }
                FinishStatus::Running => {
                    Envelope::running(format!("Render job {job_id} is in progress."), None)
                }
            },
        };
        Ok(envelope)
    }

    fn reap(&self, tables: &mut JobTables) {
        let finished: Vec<String> = tables
            .active
            .iter_mut()
            .filter_map(|(job_id, job)| {
                let alive = job.worker.as_mut().is_some_and(|worker| worker.is_alive());
                (!alive).then(|| job_id.clone())
            })
            .collect();

        for job_id in finished {
            if let Some(mut job) = tables.active.remove(&job_id) {
                job.transition(JobState::Finished);
                let elapsed_ms = (Utc::now() - job.admitted_at).num_milliseconds();
                info!(job_id = %job_id, elapsed_ms, "Render job finished");
            }
            tables.outstanding.remove(&job_id);
        }

        self.process_queue(tables);
    }

    /// Promotes queued jobs, oldest first, into free slots.
    fn process_queue(&self, tables: &mut JobTables) {
        while tables.active.len() < self.limits.max_concurrent_jobs {
            let Some(mut job) = tables.pending.pop_front() else {
                break;
            };

            match self.pool.spawn(&job.id, &job.config_path) {
                Ok(worker) => {
                    job.worker = Some(worker);
                    job.transition(JobState::Running);
                    info!(job_id = %job.id, "Queued render job started");
                    tables.active.insert(job.id.clone(), job);
                }
                Err(err) => {
                    // The waiting session observes the job as finished and then
                    // reports the missing artifact.
                    warn!(job_id = %job.id, error = ?err, "Failed to start queued render job");
                    tables.outstanding.remove(&job.id);
                }
            }
        }
    }
}
