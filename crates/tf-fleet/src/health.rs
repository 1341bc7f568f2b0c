//! Health monitoring for the worker fleet
//!
//! Each check round samples every worker: OS-level liveness, CPU and
//! memory usage, and transport connectivity. A worker only becomes a
//! restart candidate after a configurable number of consecutive failed
//! rounds, and restarts are gated by a per-worker cooldown so a worker
//! that keeps failing its checks is not restart-thrashed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::controller::FleetController;
use crate::inspect::ResourceInspector;
use crate::notifier::Notifier;
use tf_common::WorkerHealth;

/// Answers whether a worker holds a live transport connection.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_connected(&self, worker_id: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub check_interval: Duration,
    /// Per-worker CPU percent above which a check round fails.
    pub cpu_threshold: f32,
    /// Per-worker memory percent above which a check round fails.
    pub mem_threshold: f32,
    /// Consecutive failed rounds before a restart is considered.
    pub unhealthy_threshold: u32,
    /// Minimum gap between restarts of the same worker.
    pub restart_cooldown: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            cpu_threshold: 80.0,
            mem_threshold: 80.0,
            unhealthy_threshold: 3,
            restart_cooldown: Duration::from_secs(300),
        }
    }
}

/// Outcome of one check round across the fleet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSummary {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub restarted: usize,
    /// Restart candidates left alone because their cooldown has not elapsed.
    pub deferred: usize,
}

pub struct HealthMonitor {
    config: HealthCheckConfig,
    fleet: Arc<FleetController>,
    inspector: Mutex<Box<dyn ResourceInspector>>,
    probe: Arc<dyn ConnectivityProbe>,
    notifier: Arc<dyn Notifier>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthCheckConfig,
        fleet: Arc<FleetController>,
        inspector: Box<dyn ResourceInspector>,
        probe: Arc<dyn ConnectivityProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            fleet,
            inspector: Mutex::new(inspector),
            probe,
            notifier,
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.config.check_interval
    }

    /// Run one check round over every registered worker.
    pub async fn run_checks(&self) -> HealthSummary {
        let snapshot = self.fleet.fleet_snapshot();
        let mut summary = HealthSummary {
            checked: snapshot.count(),
            ..Default::default()
        };

        for worker in &snapshot.workers {
            let sample = self.inspector.lock().sample_process(worker.pid);
            let connected = self.probe.is_connected(&worker.worker_id).await;

            let mut failure = None;
            if !sample.alive || !self.fleet.is_process_running(&worker.worker_id) {
                failure = Some("process not running");
            } else if sample.cpu_percent > self.config.cpu_threshold {
                failure = Some("cpu over threshold");
            } else if sample.mem_percent > self.config.mem_threshold {
                failure = Some("memory over threshold");
            } else if !connected {
                failure = Some("transport disconnected");
            }

            let mut restart_due = false;
            let mut in_cooldown = false;
            let updated = self.fleet.with_handle_mut(&worker.worker_id, |handle| {
                handle.last_health_check = Some(Instant::now());
                handle.cpu_percent = sample.cpu_percent;
                handle.mem_percent = sample.mem_percent;
                handle.has_transport_connection = connected;

                match failure {
                    None => {
                        handle.consecutive_unhealthy = 0;
                        handle.consecutive_healthy += 1;
                        // A single passing round is not recovery: the
                        // cooldown only lifts once the worker has passed
                        // as many rounds as it takes to fail.
                        if handle.consecutive_healthy >= self.config.unhealthy_threshold {
                            handle.last_restart_at = None;
                        }
                        handle.health = WorkerHealth::Healthy;
                    }
                    Some(_) => {
                        handle.consecutive_healthy = 0;
                        handle.consecutive_unhealthy += 1;
                        if handle.consecutive_unhealthy >= self.config.unhealthy_threshold {
                            handle.health = WorkerHealth::RestartCandidate;
                            match handle.last_restart_at {
                                Some(at) if at.elapsed() < self.config.restart_cooldown => {
                                    in_cooldown = true;
                                }
                                _ => restart_due = true,
                            }
                        } else {
                            handle.health = WorkerHealth::Unhealthy;
                        }
                    }
                }
            });
            if !updated {
                // Worker stopped between snapshot and update.
                continue;
            }

            match failure {
                None => {
                    summary.healthy += 1;
                    debug!(worker_id = %worker.worker_id, "Health check passed");
                }
                Some(reason) => {
                    summary.unhealthy += 1;
                    warn!(
                        worker_id = %worker.worker_id,
                        reason = reason,
                        cpu = sample.cpu_percent,
                        mem = sample.mem_percent,
                        "Health check failed"
                    );

                    if restart_due {
                        match self.fleet.restart(&worker.worker_id).await {
                            Ok(()) => {
                                summary.restarted += 1;
                                info!(worker_id = %worker.worker_id, reason = reason, "Restarted unhealthy worker");
                                self.notifier
                                    .notify(
                                        "worker restarted",
                                        &format!("{}: {}", worker.worker_id, reason),
                                    )
                                    .await;
                            }
                            Err(e) => {
                                warn!(worker_id = %worker.worker_id, error = %e, "Failed to restart worker");
                            }
                        }
                    } else if in_cooldown {
                        summary.deferred += 1;
                        debug!(worker_id = %worker.worker_id, "Restart deferred, cooldown active");
                    }
                }
            }
        }

        metrics::gauge!("taskfleet_unhealthy_workers").set(summary.unhealthy as f64);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::FleetControllerConfig;
    use crate::inspect::{HostSample, ProcessSample};
    use crate::notifier::testing::CollectingNotifier;
    use crate::process::{ProcessSpawner, SpawnedProcess};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tf_common::Result;

    struct AliveProcess {
        pid: u32,
    }

    impl SpawnedProcess for AliveProcess {
        fn pid(&self) -> u32 {
            self.pid
        }
        fn terminate(&self) -> Result<()> {
            Ok(())
        }
        fn kill(&self) -> Result<()> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            true
        }
    }

    struct AliveSpawner {
        next_pid: AtomicUsize,
    }

    impl ProcessSpawner for AliveSpawner {
        fn spawn(&self, _worker_id: &str) -> Result<Box<dyn SpawnedProcess>> {
            Ok(Box::new(AliveProcess {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst) as u32,
            }))
        }
    }

    struct FixedInspector {
        sample: ProcessSample,
    }

    impl ResourceInspector for FixedInspector {
        fn sample_process(&mut self, _pid: u32) -> ProcessSample {
            self.sample
        }
        fn sample_host(&mut self) -> HostSample {
            HostSample {
                cpu_percent: 10.0,
                mem_percent: 10.0,
            }
        }
    }

    struct FixedProbe {
        connected: AtomicBool,
    }

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn is_connected(&self, _worker_id: &str) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn fleet() -> Arc<FleetController> {
        Arc::new(FleetController::new(
            FleetControllerConfig {
                stop_timeout: Duration::from_millis(20),
            },
            Arc::new(AliveSpawner {
                next_pid: AtomicUsize::new(100),
            }),
        ))
    }

    fn monitor(
        fleet: Arc<FleetController>,
        sample: ProcessSample,
        connected: bool,
        restart_cooldown: Duration,
    ) -> (HealthMonitor, Arc<CollectingNotifier>) {
        let notifier = Arc::new(CollectingNotifier::new());
        let monitor = HealthMonitor::new(
            HealthCheckConfig {
                check_interval: Duration::from_millis(10),
                cpu_threshold: 80.0,
                mem_threshold: 80.0,
                unhealthy_threshold: 3,
                restart_cooldown,
            },
            fleet,
            Box::new(FixedInspector { sample }),
            Arc::new(FixedProbe {
                connected: AtomicBool::new(connected),
            }),
            notifier.clone(),
        );
        (monitor, notifier)
    }

    fn healthy_sample() -> ProcessSample {
        ProcessSample {
            cpu_percent: 5.0,
            mem_percent: 5.0,
            alive: true,
        }
    }

    fn hot_sample() -> ProcessSample {
        ProcessSample {
            cpu_percent: 95.0,
            mem_percent: 5.0,
            alive: true,
        }
    }

    #[tokio::test]
    async fn healthy_worker_stays_healthy() {
        let fleet = fleet();
        fleet.start("w-1").unwrap();
        let (monitor, notifier) = monitor(fleet.clone(), healthy_sample(), true, Duration::from_secs(300));

        let summary = monitor.run_checks().await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.restarted, 0);
        assert!(notifier.events.lock().is_empty());

        let handle = &fleet.fleet_snapshot().workers[0];
        assert_eq!(handle.health, WorkerHealth::Healthy);
        assert!(handle.last_health_check.is_some());
        assert!(handle.has_transport_connection);
    }

    #[tokio::test]
    async fn single_failed_round_does_not_restart() {
        let fleet = fleet();
        fleet.start("w-1").unwrap();
        let (monitor, _) = monitor(fleet.clone(), hot_sample(), true, Duration::from_secs(300));

        let summary = monitor.run_checks().await;
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.restarted, 0);

        let handle = &fleet.fleet_snapshot().workers[0];
        assert_eq!(handle.health, WorkerHealth::Unhealthy);
        assert_eq!(handle.consecutive_unhealthy, 1);
    }

    #[tokio::test]
    async fn recovery_resets_consecutive_count() {
        let fleet = fleet();
        fleet.start("w-1").unwrap();

        let (failing, _) = monitor(fleet.clone(), hot_sample(), true, Duration::from_secs(300));
        failing.run_checks().await;
        failing.run_checks().await;
        assert_eq!(fleet.fleet_snapshot().workers[0].consecutive_unhealthy, 2);

        let (passing, _) = monitor(fleet.clone(), healthy_sample(), true, Duration::from_secs(300));
        passing.run_checks().await;
        let handle = &fleet.fleet_snapshot().workers[0];
        assert_eq!(handle.consecutive_unhealthy, 0);
        assert_eq!(handle.health, WorkerHealth::Healthy);
    }

    #[tokio::test]
    async fn persistent_failure_restarts_once_within_cooldown() {
        let fleet = fleet();
        fleet.start("w-1").unwrap();
        let (monitor, notifier) = monitor(
            fleet.clone(),
            ProcessSample {
                cpu_percent: 5.0,
                mem_percent: 5.0,
                alive: true,
            },
            false, // transport never connects
            Duration::from_secs(300),
        );

        let mut restarts = 0;
        for _ in 0..6 {
            restarts += monitor.run_checks().await.restarted;
        }
        // Rounds 1-2 count up, round 3 restarts, the restart resets the
        // counter and stamps the cooldown, so round 6 is a deferred candidate.
        assert_eq!(restarts, 1);
        assert_eq!(notifier.events.lock().len(), 1);

        let summary = monitor.run_checks().await;
        assert_eq!(summary.restarted, 0);
        assert_eq!(summary.deferred, 1);
    }

    #[tokio::test]
    async fn flapping_worker_restarts_once_within_cooldown() {
        let fleet = fleet();
        fleet.start("w-1").unwrap();
        let cooldown = Duration::from_secs(300);

        let (failing, _) = monitor(fleet.clone(), hot_sample(), true, cooldown);
        let (passing, _) = monitor(fleet.clone(), healthy_sample(), true, cooldown);

        let mut restarts = 0;
        for _ in 0..3 {
            restarts += failing.run_checks().await.restarted;
        }
        assert_eq!(restarts, 1);

        // One good round, then the worker degrades again. The lone good
        // round must not have lifted the cooldown.
        passing.run_checks().await;
        let mut deferred = 0;
        for _ in 0..3 {
            let summary = failing.run_checks().await;
            restarts += summary.restarted;
            deferred += summary.deferred;
        }
        assert_eq!(restarts, 1);
        assert_eq!(deferred, 1);
    }

    #[tokio::test]
    async fn sustained_health_lifts_cooldown() {
        let fleet = fleet();
        fleet.start("w-1").unwrap();
        let cooldown = Duration::from_secs(300);

        let (failing, _) = monitor(fleet.clone(), hot_sample(), true, cooldown);
        let (passing, _) = monitor(fleet.clone(), healthy_sample(), true, cooldown);

        let mut restarts = 0;
        for _ in 0..3 {
            restarts += failing.run_checks().await.restarted;
        }
        assert_eq!(restarts, 1);

        // Three consecutive good rounds count as recovery.
        for _ in 0..3 {
            passing.run_checks().await;
        }
        assert!(fleet.fleet_snapshot().workers[0].last_restart_at.is_none());

        for _ in 0..3 {
            restarts += failing.run_checks().await.restarted;
        }
        assert_eq!(restarts, 2);
    }

    #[tokio::test]
    async fn restart_allowed_again_after_cooldown() {
        let fleet = fleet();
        fleet.start("w-1").unwrap();
        let (monitor, _) = monitor(fleet.clone(), hot_sample(), true, Duration::from_millis(30));

        let mut restarts = 0;
        for _ in 0..3 {
            restarts += monitor.run_checks().await.restarted;
        }
        assert_eq!(restarts, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        for _ in 0..3 {
            restarts += monitor.run_checks().await.restarted;
        }
        assert_eq!(restarts, 2);
    }
}
