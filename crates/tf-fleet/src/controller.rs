//! FleetController - worker process lifecycle
//!
//! Owns the worker handle registry. Other components read snapshots of it;
//! nothing outside this controller creates or destroys workers. Scale-down
//! stops the most recently started workers first, preserving the oldest
//! (warmed up) ones.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::process::{ProcessSpawner, SpawnedProcess};
use tf_common::{FleetSnapshot, Result, WorkerHandle};

#[derive(Debug, Clone)]
pub struct FleetControllerConfig {
    /// How long a graceful stop waits before escalating to a kill.
    pub stop_timeout: Duration,
}

impl Default for FleetControllerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
        }
    }
}

struct WorkerEntry {
    handle: WorkerHandle,
    process: Box<dyn SpawnedProcess>,
}

pub struct FleetController {
    config: FleetControllerConfig,
    spawner: Arc<dyn ProcessSpawner>,
    registry: DashMap<String, WorkerEntry>,
}

impl FleetController {
    pub fn new(config: FleetControllerConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            config,
            spawner,
            registry: DashMap::new(),
        }
    }

    /// Start a worker under the given id. Starting an id that is already
    /// running is a no-op. Spawn failure is reported to the caller and not
    /// retried here; the next scaling tick reconciles.
    pub fn start(&self, worker_id: &str) -> Result<()> {
        if self.registry.contains_key(worker_id) {
            warn!(worker_id = worker_id, "Worker already running, ignoring start");
            return Ok(());
        }

        let process = self.spawner.spawn(worker_id)?;
        let handle = WorkerHandle::new(worker_id, process.pid());
        info!(worker_id = worker_id, pid = handle.pid, "Worker started");

        self.registry
            .insert(worker_id.to_string(), WorkerEntry { handle, process });
        self.record_fleet_size();
        Ok(())
    }

    /// Stop a worker. Unknown ids are treated as already stopped.
    ///
    /// Graceful stops deliver the termination signal and wait up to the
    /// configured timeout before escalating to a kill.
    pub async fn stop(&self, worker_id: &str, graceful: bool) -> Result<()> {
        let Some((_, entry)) = self.registry.remove(worker_id) else {
            return Ok(());
        };
        self.record_fleet_size();

        if graceful {
            if entry.process.terminate().is_ok() {
                let deadline = Instant::now() + self.config.stop_timeout;
                while entry.process.is_running() && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
            if entry.process.is_running() {
                warn!(
                    worker_id = worker_id,
                    timeout_secs = self.config.stop_timeout.as_secs(),
                    "Worker ignored termination signal, killing"
                );
                entry.process.kill()?;
            } else {
                info!(worker_id = worker_id, "Worker stopped gracefully");
            }
        } else {
            entry.process.kill()?;
            info!(worker_id = worker_id, "Worker killed");
        }
        Ok(())
    }

    /// Stop and start a worker under the same id, stamping the new handle
    /// with the restart time for cooldown gating.
    pub async fn restart(&self, worker_id: &str) -> Result<()> {
        self.stop(worker_id, true).await?;

        let process = self.spawner.spawn(worker_id)?;
        let mut handle = WorkerHandle::new(worker_id, process.pid());
        handle.last_restart_at = Some(Instant::now());
        info!(worker_id = worker_id, pid = handle.pid, "Worker restarted");

        self.registry
            .insert(worker_id.to_string(), WorkerEntry { handle, process });
        self.record_fleet_size();
        Ok(())
    }

    /// Reconcile the live worker set toward `n`: start the shortfall, or
    /// stop the most recently started workers first (LIFO).
    pub async fn set_target_count(&self, n: usize) -> Result<()> {
        let current = self.registry.len();

        if current < n {
            for _ in 0..n - current {
                let worker_id = Self::generate_worker_id();
                self.start(&worker_id)?;
            }
        } else if current > n {
            let mut by_age: Vec<(String, Instant)> = self
                .registry
                .iter()
                .map(|e| (e.key().clone(), e.value().handle.started_at))
                .collect();
            // Most recently started first.
            by_age.sort_by(|a, b| b.1.cmp(&a.1));

            for (worker_id, _) in by_age.into_iter().take(current - n) {
                self.stop(&worker_id, true).await?;
            }
        }
        Ok(())
    }

    /// Stop every worker gracefully.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        info!(workers = ids.len(), "Stopping fleet");
        for worker_id in ids {
            if let Err(e) = self.stop(&worker_id, true).await {
                warn!(worker_id = %worker_id, error = %e, "Error stopping worker during shutdown");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.registry.contains_key(worker_id)
    }

    /// Clone of every worker handle, safe to hand to other loops.
    pub fn fleet_snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            workers: self
                .registry
                .iter()
                .map(|e| e.value().handle.clone())
                .collect(),
        }
    }

    /// Mutate one handle in place. Used by the health monitor for the
    /// health-owned fields; returns false when the worker is gone.
    pub fn with_handle_mut(&self, worker_id: &str, f: impl FnOnce(&mut WorkerHandle)) -> bool {
        match self.registry.get_mut(worker_id) {
            Some(mut entry) => {
                f(&mut entry.handle);
                true
            }
            None => false,
        }
    }

    /// Liveness of the underlying process, straight from the OS.
    pub fn is_process_running(&self, worker_id: &str) -> bool {
        self.registry
            .get(worker_id)
            .map(|e| e.process.is_running())
            .unwrap_or(false)
    }

    fn generate_worker_id() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("worker-{}", &id[..8])
    }

    fn record_fleet_size(&self) {
        metrics::gauge!("taskfleet_fleet_size").set(self.registry.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tf_common::TaskFleetError;

    struct MockProcess {
        pid: u32,
        running: Arc<AtomicBool>,
        exit_on_terminate: bool,
        killed: Arc<AtomicBool>,
    }

    impl SpawnedProcess for MockProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn terminate(&self) -> Result<()> {
            if self.exit_on_terminate {
                self.running.store(false, Ordering::SeqCst);
            }
            Ok(())
        }

        fn kill(&self) -> Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    struct MockSpawner {
        next_pid: AtomicUsize,
        spawned: AtomicUsize,
        fail: AtomicBool,
        exit_on_terminate: bool,
        last_killed: parking_lot::Mutex<Option<Arc<AtomicBool>>>,
    }

    impl MockSpawner {
        fn new(exit_on_terminate: bool) -> Self {
            Self {
                next_pid: AtomicUsize::new(1000),
                spawned: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                exit_on_terminate,
                last_killed: parking_lot::Mutex::new(None),
            }
        }
    }

    impl ProcessSpawner for MockSpawner {
        fn spawn(&self, worker_id: &str) -> Result<Box<dyn SpawnedProcess>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TaskFleetError::ProcessSpawnFailed {
                    worker_id: worker_id.to_string(),
                    detail: "mock spawn failure".to_string(),
                });
            }
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let killed = Arc::new(AtomicBool::new(false));
            *self.last_killed.lock() = Some(killed.clone());
            Ok(Box::new(MockProcess {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst) as u32,
                running: Arc::new(AtomicBool::new(true)),
                exit_on_terminate: self.exit_on_terminate,
                killed,
            }))
        }
    }

    fn controller(spawner: Arc<MockSpawner>) -> FleetController {
        FleetController::new(
            FleetControllerConfig {
                stop_timeout: Duration::from_millis(50),
            },
            spawner,
        )
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let spawner = Arc::new(MockSpawner::new(true));
        let fleet = controller(spawner.clone());

        fleet.start("w-1").unwrap();
        fleet.start("w-1").unwrap();
        assert_eq!(fleet.worker_count(), 1);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);

        fleet.stop("w-1", true).await.unwrap();
        fleet.stop("w-1", true).await.unwrap();
        fleet.stop("never-existed", false).await.unwrap();
        assert_eq!(fleet.worker_count(), 0);
    }

    #[tokio::test]
    async fn graceful_stop_escalates_to_kill_on_timeout() {
        let spawner = Arc::new(MockSpawner::new(false));
        let fleet = controller(spawner.clone());

        fleet.start("stubborn").unwrap();
        let killed = spawner.last_killed.lock().clone().unwrap();

        fleet.stop("stubborn", true).await.unwrap();
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn graceful_stop_does_not_kill_cooperative_worker() {
        let spawner = Arc::new(MockSpawner::new(true));
        let fleet = controller(spawner.clone());

        fleet.start("polite").unwrap();
        let killed = spawner.last_killed.lock().clone().unwrap();

        fleet.stop("polite", true).await.unwrap();
        assert!(!killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn scale_up_starts_shortfall() {
        let spawner = Arc::new(MockSpawner::new(true));
        let fleet = controller(spawner.clone());

        fleet.set_target_count(3).await.unwrap();
        assert_eq!(fleet.worker_count(), 3);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn scale_down_stops_newest_first() {
        let spawner = Arc::new(MockSpawner::new(true));
        let fleet = controller(spawner.clone());

        fleet.start("oldest").unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        fleet.start("middle").unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        fleet.start("newest").unwrap();

        fleet.set_target_count(1).await.unwrap();
        assert_eq!(fleet.worker_count(), 1);
        assert!(fleet.contains("oldest"));
        assert!(!fleet.contains("newest"));
        assert!(!fleet.contains("middle"));
    }

    #[tokio::test]
    async fn restart_stamps_cooldown_marker() {
        let spawner = Arc::new(MockSpawner::new(true));
        let fleet = controller(spawner.clone());

        fleet.start("w-1").unwrap();
        assert!(fleet.fleet_snapshot().workers[0].last_restart_at.is_none());

        fleet.restart("w-1").await.unwrap();
        let snapshot = fleet.fleet_snapshot();
        assert_eq!(snapshot.count(), 1);
        assert!(snapshot.workers[0].last_restart_at.is_some());
        assert_eq!(snapshot.workers[0].consecutive_unhealthy, 0);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_to_caller() {
        let spawner = Arc::new(MockSpawner::new(true));
        let fleet = controller(spawner.clone());

        spawner.fail.store(true, Ordering::SeqCst);
        let err = fleet.start("w-1").unwrap_err();
        assert!(matches!(err, TaskFleetError::ProcessSpawnFailed { .. }));
        assert_eq!(fleet.worker_count(), 0);
    }
}
