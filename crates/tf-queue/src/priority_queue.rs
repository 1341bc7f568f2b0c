//! PriorityTaskQueue - multi-level in-memory queue
//!
//! - One FIFO sub-queue per priority level, scanned most-urgent-first
//! - Expired tasks are dead-lettered and never surface to callers
//! - Bounded capacity with strictly-lower-priority eviction
//! - Rate-limit requeue with exponential backoff and a priority bump
//! - Background sweep so `size()` never counts dead work for long

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::dead_letter::DeadLetterSink;
use tf_common::{
    DeadLetterRecord, FailureReason, Priority, Result, Task, TaskFleetError, DEFAULT_MAX_RETRIES,
};

const LEVEL_COUNT: usize = Priority::LEVELS.len();

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Total capacity across all levels, delayed tasks included.
    /// Enforced at enqueue time.
    pub capacity: usize,
    /// Base delay for the requeue backoff (`base * 2^retry_count`).
    pub backoff_base: Duration,
    /// Interval for the background expiry sweep.
    pub sweep_interval: Duration,
    /// Retry budget for tasks that do not carry their own.
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            backoff_base: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Outcome of a `requeue` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Task re-inserted; it becomes dequeueable after `delay`.
    Requeued { delay: Duration },
    /// Retry budget exhausted; task went to the dead-letter sink.
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub total: usize,
    pub ready: usize,
    pub delayed: usize,
    pub depth_per_level: [usize; LEVEL_COUNT],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepStats {
    pub promoted: usize,
    pub expired: usize,
}

struct Delayed {
    task: Task,
    ready_at: Instant,
}

#[derive(Default)]
struct Inner {
    levels: [VecDeque<Task>; LEVEL_COUNT],
    delayed: Vec<Delayed>,
}

impl Inner {
    fn total(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum::<usize>() + self.delayed.len()
    }

    /// Move delayed tasks whose backoff has elapsed into their level queue,
    /// oldest ready-time first so FIFO order within a level is preserved.
    fn promote_ready(&mut self) -> usize {
        let now = Instant::now();
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].ready_at <= now {
                ready.push(self.delayed.swap_remove(i));
            } else {
                i += 1;
            }
        }
        let promoted = ready.len();
        ready.sort_by_key(|d| d.ready_at);
        for d in ready {
            self.levels[level_index(d.task.priority)].push_back(d.task);
        }
        promoted
    }
}

fn level_index(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
        Priority::Background => 4,
    }
}

pub struct PriorityTaskQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    dead_letter: Arc<dyn DeadLetterSink>,
}

impl PriorityTaskQueue {
    pub fn new(config: QueueConfig, dead_letter: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            dead_letter,
        }
    }

    /// Enqueue a task. On a full queue, evicts one strictly-less-urgent
    /// task first; if no victim exists the call fails with
    /// `CapacityExceeded` rather than dropping more urgent work.
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        let evicted = {
            let mut inner = self.inner.lock();
            inner.promote_ready();

            let mut evicted = None;
            if inner.total() >= self.config.capacity {
                evicted = Some(self.evict_one(&mut inner, task.priority)?);
            }

            inner.levels[level_index(task.priority)].push_back(task);
            self.record_depth(inner.total());
            evicted
        };

        if let Some(victim) = evicted {
            warn!(
                task_id = %victim.id,
                priority = victim.priority.as_str(),
                "Evicted task to admit more urgent work"
            );
            self.dead_letter_task(victim, FailureReason::Evicted, None).await;
        }
        Ok(())
    }

    /// Return the most urgent, oldest ready task, or `None` when no ready
    /// work exists. Expired tasks encountered on the way are dead-lettered
    /// and skipped transparently.
    pub async fn dequeue(&self) -> Option<Task> {
        let (found, expired) = {
            let mut inner = self.inner.lock();
            inner.promote_ready();

            let mut expired = Vec::new();
            let mut found = None;
            'levels: for level in inner.levels.iter_mut() {
                while let Some(task) = level.pop_front() {
                    if task.is_expired() {
                        expired.push(task);
                        continue;
                    }
                    found = Some(task);
                    break 'levels;
                }
            }
            self.record_depth(inner.total());
            (found, expired)
        };

        for task in expired {
            self.dead_letter_task(task, FailureReason::Expired, None).await;
        }
        found
    }

    /// Rate-limit requeue path: bump retry count and priority, re-insert
    /// with exponential backoff, or dead-letter once the budget is spent.
    pub async fn requeue(&self, mut task: Task) -> Result<RequeueOutcome> {
        task.retry_count += 1;

        let budget = task.retry_budget(self.config.default_max_retries);
        if task.retry_count > budget {
            info!(
                task_id = %task.id,
                retries = task.retry_count - 1,
                "Retry budget exhausted, dead-lettering"
            );
            self.dead_letter_task(
                task,
                FailureReason::RetryExhausted,
                Some(format!("max_retries={budget}")),
            )
            .await;
            return Ok(RequeueOutcome::DeadLettered);
        }

        task.priority = task.priority.bump();
        let exponent = task.retry_count.min(16);
        let delay = self.config.backoff_base * (1u32 << exponent);

        debug!(
            task_id = %task.id,
            retry = task.retry_count,
            delay_secs = delay.as_secs(),
            priority = task.priority.as_str(),
            "Requeueing task with backoff"
        );

        let mut inner = self.inner.lock();
        // Re-admission of already-admitted work skips the capacity check:
        // `total()` can sit above `capacity` until the backlog of delayed
        // retries drains. New intake still hits the enqueue-time bound.
        inner.delayed.push(Delayed {
            task,
            ready_at: Instant::now() + delay,
        });
        self.record_depth(inner.total());
        Ok(RequeueOutcome::Requeued { delay })
    }

    /// Withdraw a task by id before dispatch. Returns the task when found.
    pub fn withdraw(&self, task_id: &str) -> Option<Task> {
        let mut inner = self.inner.lock();
        let mut found = None;
        for idx in 0..LEVEL_COUNT {
            if let Some(pos) = inner.levels[idx].iter().position(|t| t.id == task_id) {
                found = inner.levels[idx].remove(pos);
                break;
            }
        }
        if found.is_none() {
            if let Some(pos) = inner.delayed.iter().position(|d| d.task.id == task_id) {
                found = Some(inner.delayed.swap_remove(pos).task);
            }
        }
        if found.is_some() {
            self.record_depth(inner.total());
        }
        found
    }

    pub fn size(&self) -> usize {
        self.inner.lock().total()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut depth_per_level = [0; LEVEL_COUNT];
        for (i, level) in inner.levels.iter().enumerate() {
            depth_per_level[i] = level.len();
        }
        let ready = depth_per_level.iter().sum();
        QueueStats {
            total: ready + inner.delayed.len(),
            ready,
            delayed: inner.delayed.len(),
            depth_per_level,
        }
    }

    /// One proactive pass: promote ready delayed tasks and dead-letter
    /// expired ones from every level and the delayed set.
    pub async fn sweep(&self) -> SweepStats {
        let (stats, expired) = {
            let mut inner = self.inner.lock();
            let promoted = inner.promote_ready();

            let mut expired = Vec::new();
            for level in inner.levels.iter_mut() {
                let mut kept = VecDeque::with_capacity(level.len());
                for task in level.drain(..) {
                    if task.is_expired() {
                        expired.push(task);
                    } else {
                        kept.push_back(task);
                    }
                }
                *level = kept;
            }
            let mut i = 0;
            while i < inner.delayed.len() {
                if inner.delayed[i].task.is_expired() {
                    expired.push(inner.delayed.swap_remove(i).task);
                } else {
                    i += 1;
                }
            }

            self.record_depth(inner.total());
            (
                SweepStats {
                    promoted,
                    expired: expired.len(),
                },
                expired,
            )
        };

        for task in expired {
            self.dead_letter_task(task, FailureReason::Expired, None).await;
        }
        stats
    }

    /// Run the background expiry sweep until shutdown is signalled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        let interval = queue.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = queue.sweep().await;
                        if stats.expired > 0 || stats.promoted > 0 {
                            debug!(
                                expired = stats.expired,
                                promoted = stats.promoted,
                                "Queue sweep complete"
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Queue sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Pick and remove one task strictly less urgent than `incoming`,
    /// youngest of the least urgent first.
    fn evict_one(&self, inner: &mut Inner, incoming: Priority) -> Result<Task> {
        let incoming_idx = level_index(incoming);
        for idx in (incoming_idx + 1..LEVEL_COUNT).rev() {
            if let Some(task) = inner.levels[idx].pop_back() {
                return Ok(task);
            }
        }

        // No ready victim; fall back to the delayed set.
        let mut victim: Option<usize> = None;
        for (i, d) in inner.delayed.iter().enumerate() {
            if !incoming.more_urgent_than(d.task.priority) {
                continue;
            }
            match victim {
                Some(v) if d.task.priority.more_urgent_than(inner.delayed[v].task.priority) => {}
                _ => victim = Some(i),
            }
        }
        if let Some(i) = victim {
            return Ok(inner.delayed.swap_remove(i).task);
        }

        Err(TaskFleetError::CapacityExceeded {
            capacity: self.config.capacity,
        })
    }

    async fn dead_letter_task(&self, task: Task, reason: FailureReason, detail: Option<String>) {
        let record = DeadLetterRecord::new(task, reason, detail);
        if let Err(e) = self.dead_letter.record(record).await {
            warn!(error = %e, "Failed to write dead-letter record");
        }
    }

    fn record_depth(&self, total: usize) {
        metrics::gauge!("taskfleet_queue_depth").set(total as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::InMemoryDeadLetterSink;
    use chrono::{Duration as ChronoDuration, Utc};

    fn test_queue(capacity: usize) -> (Arc<PriorityTaskQueue>, Arc<InMemoryDeadLetterSink>) {
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let queue = Arc::new(PriorityTaskQueue::new(
            QueueConfig {
                capacity,
                backoff_base: Duration::ZERO,
                ..QueueConfig::default()
            },
            sink.clone(),
        ));
        (queue, sink)
    }

    fn task(priority: Priority) -> Task {
        Task::new(serde_json::json!({}), priority, "test")
    }

    #[tokio::test]
    async fn dequeue_is_priority_first_then_fifo() {
        let (queue, _) = test_queue(100);

        let normal_ids: Vec<String> = {
            let mut ids = Vec::new();
            for _ in 0..5 {
                let t = task(Priority::Normal);
                ids.push(t.id.clone());
                queue.enqueue(t).await.unwrap();
            }
            ids
        };
        let critical = task(Priority::Critical);
        let critical_id = critical.id.clone();
        queue.enqueue(critical).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().id, critical_id);
        for id in normal_ids {
            assert_eq!(queue.dequeue().await.unwrap().id, id);
        }
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn critical_task_evicts_one_background_task() {
        let (queue, sink) = test_queue(1000);
        for _ in 0..1000 {
            queue.enqueue(task(Priority::Background)).await.unwrap();
        }
        assert_eq!(queue.size(), 1000);

        let critical = task(Priority::Critical);
        let critical_id = critical.id.clone();
        queue.enqueue(critical).await.unwrap();

        assert_eq!(queue.size(), 1000);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].reason, FailureReason::Evicted);
        assert_eq!(queue.dequeue().await.unwrap().id, critical_id);
    }

    #[tokio::test]
    async fn background_enqueue_fails_against_critical_saturation() {
        let (queue, sink) = test_queue(10);
        for _ in 0..10 {
            queue.enqueue(task(Priority::Critical)).await.unwrap();
        }

        let err = queue.enqueue(task(Priority::Background)).await.unwrap_err();
        assert!(matches!(err, TaskFleetError::CapacityExceeded { capacity: 10 }));
        assert_eq!(queue.size(), 10);
        assert_eq!(sink.len(), 0);
    }

    #[tokio::test]
    async fn equal_priority_is_not_evictable() {
        let (queue, _) = test_queue(3);
        for _ in 0..3 {
            queue.enqueue(task(Priority::Normal)).await.unwrap();
        }
        let err = queue.enqueue(task(Priority::Normal)).await.unwrap_err();
        assert!(matches!(err, TaskFleetError::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn expired_tasks_never_surface() {
        let (queue, sink) = test_queue(100);
        let expired = task(Priority::Critical)
            .with_expiry(Utc::now() - ChronoDuration::seconds(1));
        queue.enqueue(expired).await.unwrap();

        let live = task(Priority::Normal);
        let live_id = live.id.clone();
        queue.enqueue(live).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().id, live_id);
        assert!(queue.dequeue().await.is_none());
        assert!(queue.dequeue().await.is_none());

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].reason, FailureReason::Expired);
    }

    #[tokio::test]
    async fn sweep_drops_expired_work() {
        let (queue, sink) = test_queue(100);
        for _ in 0..3 {
            let t = task(Priority::Low).with_expiry(Utc::now() - ChronoDuration::seconds(1));
            queue.enqueue(t).await.unwrap();
        }
        queue.enqueue(task(Priority::Low)).await.unwrap();
        assert_eq!(queue.size(), 4);

        let stats = queue.sweep().await;
        assert_eq!(stats.expired, 3);
        assert_eq!(queue.size(), 1);
        assert_eq!(sink.len(), 3);
    }

    #[tokio::test]
    async fn requeue_bumps_priority_and_retry_count() {
        let (queue, _) = test_queue(100);
        let t = task(Priority::Normal);
        queue.enqueue(t).await.unwrap();

        let dispatched = queue.dequeue().await.unwrap();
        let outcome = queue.requeue(dispatched).await.unwrap();
        assert!(matches!(outcome, RequeueOutcome::Requeued { .. }));

        // Zero backoff base: the task is immediately ready again.
        let retried = queue.dequeue().await.unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.priority, Priority::High);
    }

    #[tokio::test]
    async fn requeue_honors_backoff_delay() {
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let queue = PriorityTaskQueue::new(
            QueueConfig {
                capacity: 100,
                backoff_base: Duration::from_millis(20),
                ..QueueConfig::default()
            },
            sink,
        );

        queue.enqueue(task(Priority::Normal)).await.unwrap();
        let dispatched = queue.dequeue().await.unwrap();
        queue.requeue(dispatched).await.unwrap();

        // Delay is base * 2^1 = 40ms; not ready yet.
        assert!(queue.dequeue().await.is_none());
        assert_eq!(queue.size(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(queue.dequeue().await.is_some());
    }

    #[tokio::test]
    async fn retry_exhaustion_dead_letters_and_restores_baseline() {
        let (queue, sink) = test_queue(100);
        let t = task(Priority::Normal).with_max_retries(2);
        queue.enqueue(t).await.unwrap();

        for _ in 0..2 {
            let dispatched = queue.dequeue().await.unwrap();
            let outcome = queue.requeue(dispatched).await.unwrap();
            assert!(matches!(outcome, RequeueOutcome::Requeued { .. }));
        }

        let dispatched = queue.dequeue().await.unwrap();
        let outcome = queue.requeue(dispatched).await.unwrap();
        assert_eq!(outcome, RequeueOutcome::DeadLettered);

        assert_eq!(queue.size(), 0);
        assert!(queue.dequeue().await.is_none());
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].reason, FailureReason::RetryExhausted);
    }

    #[tokio::test]
    async fn configured_default_retry_budget_applies_to_plain_tasks() {
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let queue = PriorityTaskQueue::new(
            QueueConfig {
                backoff_base: Duration::ZERO,
                default_max_retries: 1,
                ..QueueConfig::default()
            },
            sink.clone(),
        );

        // A task without its own budget inherits the queue default of one.
        queue.enqueue(task(Priority::Normal)).await.unwrap();
        let dispatched = queue.dequeue().await.unwrap();
        assert!(matches!(
            queue.requeue(dispatched).await.unwrap(),
            RequeueOutcome::Requeued { .. }
        ));
        let dispatched = queue.dequeue().await.unwrap();
        assert_eq!(
            queue.requeue(dispatched).await.unwrap(),
            RequeueOutcome::DeadLettered
        );
        assert_eq!(sink.len(), 1);

        // An explicit per-task budget still wins over the default.
        queue
            .enqueue(task(Priority::Normal).with_max_retries(2))
            .await
            .unwrap();
        for _ in 0..2 {
            let dispatched = queue.dequeue().await.unwrap();
            assert!(matches!(
                queue.requeue(dispatched).await.unwrap(),
                RequeueOutcome::Requeued { .. }
            ));
        }
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn requeue_readmits_past_capacity() {
        let (queue, sink) = test_queue(2);
        queue.enqueue(task(Priority::Normal)).await.unwrap();
        queue.enqueue(task(Priority::Normal)).await.unwrap();

        let dispatched = queue.dequeue().await.unwrap();
        queue.enqueue(task(Priority::Normal)).await.unwrap();
        assert_eq!(queue.size(), 2);

        // The retry is not dropped even though intake refilled the slot.
        let outcome = queue.requeue(dispatched).await.unwrap();
        assert!(matches!(outcome, RequeueOutcome::Requeued { .. }));
        assert_eq!(queue.size(), 3);
        assert_eq!(sink.len(), 0);
    }

    #[tokio::test]
    async fn withdraw_removes_pending_task() {
        let (queue, _) = test_queue(100);
        let t = task(Priority::Normal);
        let id = t.id.clone();
        queue.enqueue(t).await.unwrap();
        queue.enqueue(task(Priority::Normal)).await.unwrap();

        let withdrawn = queue.withdraw(&id).unwrap();
        assert_eq!(withdrawn.id, id);
        assert_eq!(queue.size(), 1);
        assert!(queue.withdraw(&id).is_none());
    }

    #[tokio::test]
    async fn stats_reflect_levels_and_delayed() {
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let queue = PriorityTaskQueue::new(
            QueueConfig {
                capacity: 100,
                backoff_base: Duration::from_secs(60),
                ..QueueConfig::default()
            },
            sink,
        );

        queue.enqueue(task(Priority::Critical)).await.unwrap();
        queue.enqueue(task(Priority::Normal)).await.unwrap();
        let dispatched = queue.dequeue().await.unwrap();
        queue.requeue(dispatched).await.unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.delayed, 1);
    }
}
