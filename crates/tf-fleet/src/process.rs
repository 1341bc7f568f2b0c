//! OS process seam for the fleet controller
//!
//! `ProcessSpawner` and `SpawnedProcess` keep the controller testable; the
//! production implementations wrap `tokio::process`.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use tf_common::{Result, TaskFleetError};

/// A live worker process under fleet control.
pub trait SpawnedProcess: Send + Sync {
    fn pid(&self) -> u32;

    /// Deliver the termination signal. The worker is expected to disconnect
    /// from the transport and exit on its own.
    fn terminate(&self) -> Result<()>;

    /// Force the process down immediately.
    fn kill(&self) -> Result<()>;

    /// Non-blocking liveness probe.
    fn is_running(&self) -> bool;
}

/// Spawns one worker process per request.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, worker_id: &str) -> Result<Box<dyn SpawnedProcess>>;
}

/// Production spawner: invokes the configured worker entry point with the
/// worker id appended as `--worker-id <id>`.
pub struct WorkerProcessSpawner {
    command: String,
    args: Vec<String>,
}

impl WorkerProcessSpawner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl ProcessSpawner for WorkerProcessSpawner {
    fn spawn(&self, worker_id: &str) -> Result<Box<dyn SpawnedProcess>> {
        let child = Command::new(&self.command)
            .args(&self.args)
            .arg("--worker-id")
            .arg(worker_id)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskFleetError::ProcessSpawnFailed {
                worker_id: worker_id.to_string(),
                detail: e.to_string(),
            })?;

        let pid = child.id().ok_or_else(|| TaskFleetError::ProcessSpawnFailed {
            worker_id: worker_id.to_string(),
            detail: "process exited before pid could be read".to_string(),
        })?;

        debug!(worker_id = worker_id, pid = pid, command = %self.command, "Spawned worker process");
        Ok(Box::new(TokioProcess {
            pid,
            child: Mutex::new(child),
        }))
    }
}

struct TokioProcess {
    pid: u32,
    child: Mutex<Child>,
}

impl SpawnedProcess for TokioProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(&self) -> Result<()> {
        kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM).map_err(|e| {
            warn!(pid = self.pid, error = %e, "SIGTERM delivery failed");
            TaskFleetError::WorkerUnresponsive(format!("pid {}: {e}", self.pid))
        })
    }

    fn kill(&self) -> Result<()> {
        let mut child = self.child.lock();
        match child.start_kill() {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(TaskFleetError::WorkerUnresponsive(format!(
                "pid {}: {e}",
                self.pid
            ))),
        }
    }

    fn is_running(&self) -> bool {
        let mut child = self.child.lock();
        matches!(child.try_wait(), Ok(None))
    }
}
