//! Fleet scaling policy
//!
//! A pure decision function over queue depth, worker count and host
//! resource usage, plus a small amount of state: the time of the last
//! applied decision (for the cooldown) and a bounded decision history.
//! Scale-up can jump several workers at once toward the backlog; scale
//! down always steps by one. The asymmetric thresholds plus the global
//! cooldown are the anti-oscillation mechanism; there is no separate
//! hysteresis band.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use tf_common::{FleetMetrics, ScaleAction, ScalingDecision};

const HISTORY_LIMIT: usize = 50;

/// Tasks one worker is assumed to absorb when sizing a scale-up jump.
const TASKS_PER_WORKER: usize = 3;

/// Below these host figures, any backlog at all justifies growing.
const IDLE_HOST_CPU_PERCENT: f32 = 50.0;
const IDLE_HOST_MEM_PERCENT: f32 = 50.0;

#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Queue depth above which the fleet grows.
    pub scale_up_threshold: usize,
    /// Queue depth at or below which the fleet shrinks.
    pub scale_down_threshold: usize,
    /// Minimum gap between applied scaling actions, either direction.
    pub cooldown: Duration,
    pub evaluation_interval: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 10,
            scale_down_threshold: 2,
            cooldown: Duration::from_secs(60),
            evaluation_interval: Duration::from_secs(30),
        }
    }
}

pub struct ScalingPolicy {
    config: ScalingConfig,
    last_applied: Mutex<Option<Instant>>,
    history: Mutex<VecDeque<ScalingDecision>>,
}

impl ScalingPolicy {
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            last_applied: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn evaluation_interval(&self) -> Duration {
        self.config.evaluation_interval
    }

    /// Decide what the fleet should do given current metrics.
    ///
    /// Holds while the cooldown from the last applied action is running,
    /// regardless of what the metrics say.
    pub fn evaluate(&self, metrics: &FleetMetrics) -> ScalingDecision {
        let decision = self.decide(metrics);
        debug!(
            action = ?decision.action,
            from = decision.from_count,
            to = decision.to_count,
            queue_depth = decision.queue_depth,
            "Scaling evaluation"
        );

        let mut history = self.history.lock();
        history.push_back(decision.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        decision
    }

    /// Record that a non-hold decision was acted on, starting the cooldown.
    pub fn mark_applied(&self, decision: &ScalingDecision) {
        if decision.action == ScaleAction::Hold {
            return;
        }
        *self.last_applied.lock() = Some(Instant::now());
        info!(
            action = ?decision.action,
            from = decision.from_count,
            to = decision.to_count,
            "Scaling action applied"
        );
        metrics::gauge!("taskfleet_scaling_target").set(decision.to_count as f64);
    }

    pub fn history(&self) -> Vec<ScalingDecision> {
        self.history.lock().iter().cloned().collect()
    }

    fn decide(&self, metrics: &FleetMetrics) -> ScalingDecision {
        let current = metrics.worker_count;
        let depth = metrics.queue_depth;
        let hold = ScalingDecision::hold(current, depth);

        if let Some(at) = *self.last_applied.lock() {
            if at.elapsed() < self.config.cooldown {
                return hold;
            }
        }

        if depth <= self.config.scale_down_threshold {
            if current > self.config.min_workers {
                return ScalingDecision::new(ScaleAction::Down, current, current - 1, depth);
            }
            return hold;
        }

        let backlog_deep = depth > self.config.scale_up_threshold;
        let fleet_outpaced = current * TASKS_PER_WORKER < depth;
        let host_idle = metrics.host_cpu_percent < IDLE_HOST_CPU_PERCENT
            && metrics.host_mem_percent < IDLE_HOST_MEM_PERCENT;

        if (backlog_deep || fleet_outpaced || host_idle) && current < self.config.max_workers {
            let wanted = depth.div_ceil(TASKS_PER_WORKER);
            let target = wanted.clamp(current + 1, self.config.max_workers);
            return ScalingDecision::new(ScaleAction::Up, current, target, depth);
        }

        hold
    }
}
