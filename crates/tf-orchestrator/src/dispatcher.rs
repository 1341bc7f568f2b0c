//! Task dispatcher
//!
//! Pulls ready tasks off the priority queue, attaches a credential and
//! publishes them to the worker role's channel. Tracks dispatched tasks
//! in an in-flight table until a result comes back, then settles them:
//! completions clear, rate limits requeue with backoff and park the
//! credential, hard failures go to the dead-letter sink.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use tf_common::{
    CallOutcome, ControlMessage, DeadLetterRecord, FailureReason, Result, Task, TaskFleetError,
    TaskResultMessage, TaskStatus,
};
use tf_fleet::CredentialPool;
use tf_queue::dead_letter::DeadLetterSink;
use tf_queue::priority_queue::{PriorityTaskQueue, RequeueOutcome};
use tf_queue::transport::{DispatchCredential, DispatchEnvelope, TaskPublisher};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Role channel tasks are published to.
    pub worker_role: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_role: "default".to_string(),
        }
    }
}

struct InFlight {
    task: Task,
    credential_alias: String,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    queue: Arc<PriorityTaskQueue>,
    publisher: Arc<dyn TaskPublisher>,
    credentials: Arc<CredentialPool>,
    dead_letter: Arc<dyn DeadLetterSink>,
    in_flight: DashMap<String, InFlight>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        queue: Arc<PriorityTaskQueue>,
        publisher: Arc<dyn TaskPublisher>,
        credentials: Arc<CredentialPool>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            config,
            queue,
            publisher,
            credentials,
            dead_letter,
            in_flight: DashMap::new(),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Dispatch every task the queue has ready. Per-task failures are
    /// absorbed (requeued or dead-lettered); the loop itself never fails.
    pub async fn drain_ready(&self) -> usize {
        let mut dispatched = 0;
        while let Some(task) = self.queue.dequeue().await {
            match self.dispatch(task).await {
                Ok(()) => dispatched += 1,
                Err(e @ TaskFleetError::Config(_)) => {
                    // The task went back to the ready queue, so another
                    // dequeue would hand it straight back. Stop draining
                    // until the next tick.
                    warn!(error = %e, "Dispatch halted");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Dispatch failed");
                }
            }
        }
        if dispatched > 0 {
            metrics::counter!("taskfleet_tasks_dispatched").increment(dispatched as u64);
        }
        dispatched
    }

    async fn dispatch(&self, task: Task) -> Result<()> {
        let Some(credential) = self.credentials.acquire() else {
            // Misconfiguration, not task failure: put the task back
            // without burning a retry.
            let task_id = task.id.clone();
            self.queue.enqueue(task).await?;
            warn!(task_id = %task_id, "No credentials configured, task returned to queue");
            return Err(TaskFleetError::Config(
                "credential pool is empty".to_string(),
            ));
        };

        let envelope = DispatchEnvelope {
            task: task.clone(),
            credential: DispatchCredential {
                alias: credential.alias.clone(),
                secret: credential.secret.clone(),
            },
            dispatched_at: Utc::now(),
        };

        self.in_flight.insert(
            task.id.clone(),
            InFlight {
                task: task.clone(),
                credential_alias: credential.alias.clone(),
            },
        );

        match self
            .publisher
            .publish_task(&self.config.worker_role, &envelope)
            .await
        {
            Ok(()) => {
                debug!(
                    task_id = %task.id,
                    priority = task.priority.as_str(),
                    credential = %credential.alias,
                    "Task dispatched"
                );
                Ok(())
            }
            Err(e) => {
                // Transport trouble is transient: pull the task back and
                // let the backoff path retry it.
                self.in_flight.remove(&task.id);
                warn!(task_id = %task.id, error = %e, "Publish failed, requeuing");
                self.queue.requeue(task).await?;
                Err(e)
            }
        }
    }

    /// Settle one worker result against the in-flight table.
    pub async fn handle_result(&self, result: TaskResultMessage) {
        let Some((_, entry)) = self.in_flight.remove(&result.task_id) else {
            // Duplicate delivery or a task settled by cancellation.
            debug!(task_id = %result.task_id, "Result for unknown task, ignoring");
            return;
        };

        match result.status {
            TaskStatus::Completed => {
                self.credentials
                    .report_outcome(&entry.credential_alias, CallOutcome::Success);
                metrics::counter!("taskfleet_tasks_completed").increment(1);
                debug!(task_id = %result.task_id, "Task completed");
            }
            TaskStatus::RateLimited => {
                self.credentials.report_outcome(
                    &entry.credential_alias,
                    CallOutcome::RateLimited {
                        reset_at: result.rate_limit_reset_at,
                    },
                );
                match self.queue.requeue(entry.task).await {
                    Ok(RequeueOutcome::Requeued { delay }) => {
                        info!(
                            task_id = %result.task_id,
                            delay_ms = delay.as_millis() as u64,
                            "Rate limited, task requeued with backoff"
                        );
                    }
                    Ok(RequeueOutcome::DeadLettered) => {
                        warn!(task_id = %result.task_id, "Rate limited and retries exhausted");
                    }
                    Err(e) => {
                        warn!(task_id = %result.task_id, error = %e, "Requeue after rate limit failed");
                    }
                }
            }
            TaskStatus::Failed => {
                metrics::counter!("taskfleet_tasks_failed").increment(1);
                warn!(
                    task_id = %result.task_id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Task failed on worker"
                );
                let record = DeadLetterRecord::new(
                    entry.task,
                    FailureReason::DispatchFailed,
                    result.error.clone(),
                );
                if let Err(e) = self.dead_letter.record(record).await {
                    warn!(task_id = %result.task_id, error = %e, "Dead-letter write failed");
                }
            }
        }
    }

    /// Cancel a task by id. Returns true when the task was still queued
    /// and has been withdrawn; once dispatched, cancellation is only a
    /// best-effort signal to the worker.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        if let Some(task) = self.queue.withdraw(task_id) {
            info!(task_id = task_id, "Task withdrawn before dispatch");
            let record = DeadLetterRecord::new(task, FailureReason::Cancelled, None);
            self.dead_letter.record(record).await?;
            return Ok(true);
        }

        if self.in_flight.contains_key(task_id) {
            let message = ControlMessage::Cancel {
                task_id: task_id.to_string(),
            };
            if let Err(e) = self
                .publisher
                .publish_control(&self.config.worker_role, &message)
                .await
            {
                warn!(task_id = task_id, error = %e, "Cancellation signal failed");
            } else {
                info!(task_id = task_id, "Cancellation signalled to worker");
            }
        }
        Ok(false)
    }
}
