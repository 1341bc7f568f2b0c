//! Lifecycle Manager - control loops for the orchestrator
//!
//! Runs:
//! - Dispatch loop (queue -> transport)
//! - Result loop (transport -> queue/credentials/dead-letter)
//! - Health check loop
//! - Scaling loop
//! - Queue expiry sweeper
//! - Graceful shutdown coordination
//!
//! Each loop runs independently on its own timer; a slow health round
//! never delays dispatch. Loops absorb their own errors and carry on at
//! the next tick.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use tf_common::{FleetMetrics, ScaleAction};
use tf_fleet::{FleetController, HealthMonitor, Notifier, ResourceInspector, ScalingPolicy};
use tf_queue::priority_queue::PriorityTaskQueue;
use tf_queue::transport::ResultConsumer;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval between dispatch drains when the queue is quiet.
    pub dispatch_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(500),
        }
    }
}

/// Owns the background loops and the shutdown channel.
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    fleet: Arc<FleetController>,
}

impl LifecycleManager {
    /// Start all control loops.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: LifecycleConfig,
        queue: Arc<PriorityTaskQueue>,
        fleet: Arc<FleetController>,
        dispatcher: Arc<Dispatcher>,
        health: Arc<HealthMonitor>,
        scaling: Arc<ScalingPolicy>,
        consumer: Arc<dyn ResultConsumer>,
        notifier: Arc<dyn Notifier>,
        host_inspector: Box<dyn ResourceInspector>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Dispatch loop
        {
            let dispatcher = dispatcher.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.dispatch_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let dispatched = dispatcher.drain_ready().await;
                            if dispatched > 0 {
                                debug!(dispatched = dispatched, "Dispatch drain complete");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Dispatch loop shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Result loop
        {
            let dispatcher = dispatcher.clone();
            let consumer = consumer.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = consumer.next_result() => {
                            match result {
                                Ok(Some(message)) => dispatcher.handle_result(message).await,
                                Ok(None) => {
                                    warn!("Result channel closed, result loop exiting");
                                    break;
                                }
                                Err(e) => {
                                    warn!(error = %e, "Malformed result, skipping");
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Result loop shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Health check loop
        {
            let health = health.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = health.check_interval();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let summary = health.run_checks().await;
                            if summary.unhealthy > 0 || summary.restarted > 0 {
                                warn!(
                                    checked = summary.checked,
                                    unhealthy = summary.unhealthy,
                                    restarted = summary.restarted,
                                    deferred = summary.deferred,
                                    "Health round complete"
                                );
                            } else {
                                debug!(checked = summary.checked, "Health round complete");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Health loop shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Scaling loop
        {
            let queue = queue.clone();
            let fleet = fleet.clone();
            let scaling = scaling.clone();
            let notifier = notifier.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = scaling.evaluation_interval();
            let inspector = Mutex::new(host_inspector);

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let host = inspector.lock().sample_host();
                            let metrics = FleetMetrics {
                                worker_count: fleet.worker_count(),
                                queue_depth: queue.size(),
                                host_cpu_percent: host.cpu_percent,
                                host_mem_percent: host.mem_percent,
                            };
                            let decision = scaling.evaluate(&metrics);
                            if decision.action == ScaleAction::Hold {
                                continue;
                            }

                            match fleet.set_target_count(decision.to_count).await {
                                Ok(()) => {
                                    scaling.mark_applied(&decision);
                                    notifier
                                        .notify(
                                            "fleet scaled",
                                            &format!(
                                                "scaled {}\u{2192}{} workers, queue depth {}",
                                                decision.from_count,
                                                decision.to_count,
                                                decision.queue_depth
                                            ),
                                        )
                                        .await;
                                }
                                Err(e) => {
                                    // Retried on the next tick; cooldown not started.
                                    warn!(error = %e, "Scaling action failed");
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Scaling loop shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Queue expiry sweeper
        queue.spawn_sweeper(shutdown_tx.subscribe());

        info!("Lifecycle manager started with all control loops");

        Self { shutdown_tx, fleet }
    }

    /// Signal every loop to stop, then stop the worker fleet.
    pub async fn shutdown(&self) {
        info!("Lifecycle manager shutting down...");
        let _ = self.shutdown_tx.send(());
        self.fleet.shutdown().await;
    }
}
