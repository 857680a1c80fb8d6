use std::process::{Child, Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::WorkerConfig;

/// A running render owned by the scheduler.
pub trait Worker: Send {
    fn pid(&self) -> Option<u32>;

    /// Reaps the worker if it has exited. Once this returns `false` it keeps
    /// returning `false`.
    fn is_alive(&mut self) -> bool;

    /// Forcibly stops the worker and blocks until it has been reaped.
    fn terminate(&mut self) -> Result<()>;
}

/// Starts isolated render workers. The scheduler never looks past this trait,
/// so the isolation mechanism (OS process, container, sandbox) is swappable.
pub trait WorkerPool: Send + Sync {
    fn spawn(&self, job_id: &str, config_path: &str) -> Result<Box<dyn Worker>>;
}

/// Runs each render as a separate OS process: `program args... <config_path>`.
#[derive(Debug, Clone)]
pub struct ProcessPool {
    program: String,
    args: Vec<String>,
}

impl ProcessPool {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }
}

impl WorkerPool for ProcessPool {
    fn spawn(&self, job_id: &str, config_path: &str) -> Result<Box<dyn Worker>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(config_path)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn render worker `{}` for job {job_id}",
                    self.program
                )
            })?;

        info!(job_id, pid = child.id(), config_path, "Spawned render worker");

        Ok(Box::new(ProcessWorker {
            job_id: job_id.to_string(),
            child,
            exited: false,
        }))
    }
}

struct ProcessWorker {
    job_id: String,
    child: Child,
    exited: bool,
}

impl ProcessWorker {
    fn record_exit(&mut self, status: ExitStatus) {
        self.exited = true;
        if status.success() {
            info!(job_id = %self.job_id, pid = self.child.id(), "Render worker exited");
        } else {
            warn!(
                job_id = %self.job_id,
                pid = self.child.id(),
                %status,
                "Render worker exited with failure status"
            );
        }
    }
}

impl Worker for ProcessWorker {
    fn pid(&self) -> Option<u32> {
        (!self.exited).then(|| self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(err) => {
                // Keep the slot occupied; a process we cannot query may still be running.
                warn!(job_id = %self.job_id, error = %err, "Failed to poll render worker");
                true
            }
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }

        if let Err(err) = self.child.kill() {
            warn!(job_id = %self.job_id, error = %err, "Failed to kill render worker");
        }
        let status = self
            .child
            .wait()
            .with_context(|| format!("failed to reap render worker for job {}", self.job_id))?;
        self.record_exit(status);
        Ok(())
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if !self.exited {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh_pool(script: &str) -> ProcessPool {
        ProcessPool::new(&WorkerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "render".to_string()],
        })
    }

    fn wait_until_exited(worker: &mut dyn Worker) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !worker.is_alive() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn worker_receives_config_path_as_last_argument() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("seen.txt");
        let pool = sh_pool(&format!("echo \"$1\" > {}", marker.display()));

        let mut worker = pool.spawn("job-1", "/tmp/mvc_cfg.yaml").unwrap();
        assert!(wait_until_exited(worker.as_mut()));

        let seen = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(seen.trim(), "/tmp/mvc_cfg.yaml");
        assert_eq!(worker.pid(), None);
    }

    #[test]
    fn terminate_kills_and_reaps_a_running_worker() {
        let pool = sh_pool("sleep 30");
        let mut worker = pool.spawn("job-2", "cfg").unwrap();
        assert!(worker.is_alive());
        assert!(worker.pid().is_some());

        worker.terminate().unwrap();
        assert!(!worker.is_alive());
        // Terminating an already reaped worker is a no-op.
        worker.terminate().unwrap();
    }

    #[test]
    fn spawn_failure_is_reported() {
        let pool = ProcessPool::new(&WorkerConfig {
            program: "/nonexistent/drawanim-render".to_string(),
            args: Vec::new(),
        });
        let err = match pool.spawn("job-3", "cfg") {
            Ok(_) => panic!("spawning a missing binary must fail"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("job-3"));
    }
}
