//! Transport seam towards the durable message broker
//!
//! The orchestrator publishes dispatched tasks to one named channel per
//! worker role and consumes a single result channel. Durability is the
//! broker's concern, not ours; the in-memory broker here backs development
//! and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use tf_common::{ControlMessage, Result, Task, TaskFleetError, TaskResultMessage};

/// Credential material handed to the worker for its upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCredential {
    pub alias: String,
    pub secret: String,
}

/// What actually goes over the wire for one dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub task: Task,
    pub credential: DispatchCredential,
    pub dispatched_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish_task(&self, role: &str, envelope: &DispatchEnvelope) -> Result<()>;

    /// Best-effort control signal (e.g. cancellation). Failures are for the
    /// caller to log, not retry.
    async fn publish_control(&self, role: &str, message: &ControlMessage) -> Result<()>;
}

#[async_trait]
pub trait ResultConsumer: Send + Sync {
    /// Wait for the next worker result. `None` means the channel closed.
    async fn next_result(&self) -> Result<Option<TaskResultMessage>>;
}

/// Channel-backed broker. Messages are JSON strings, same as they would be
/// on a real broker.
pub struct InMemoryBroker {
    task_txs: DashMap<String, mpsc::UnboundedSender<String>>,
    task_rxs: DashMap<String, mpsc::UnboundedReceiver<String>>,
    control_txs: DashMap<String, mpsc::UnboundedSender<String>>,
    control_rxs: DashMap<String, mpsc::UnboundedReceiver<String>>,
    result_tx: mpsc::UnboundedSender<String>,
    result_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Self {
            task_txs: DashMap::new(),
            task_rxs: DashMap::new(),
            control_txs: DashMap::new(),
            control_rxs: DashMap::new(),
            result_tx,
            result_rx: tokio::sync::Mutex::new(result_rx),
        }
    }

    /// Take the consuming end of a role's task channel. Workers call this
    /// once; subsequent calls return `None`.
    pub fn take_task_channel(&self, role: &str) -> Option<mpsc::UnboundedReceiver<String>> {
        self.ensure_task_channel(role);
        self.task_rxs.remove(role).map(|(_, rx)| rx)
    }

    /// Take the consuming end of a role's control channel.
    pub fn take_control_channel(&self, role: &str) -> Option<mpsc::UnboundedReceiver<String>> {
        self.ensure_control_channel(role);
        self.control_rxs.remove(role).map(|(_, rx)| rx)
    }

    /// Whether some consumer has taken the role's task channel.
    pub fn has_consumer(&self, role: &str) -> bool {
        self.task_txs.contains_key(role) && !self.task_rxs.contains_key(role)
    }

    /// Worker-side: report a result back to the orchestrator.
    pub fn publish_result(&self, message: &TaskResultMessage) -> Result<()> {
        let body = serde_json::to_string(message)?;
        self.result_tx
            .send(body)
            .map_err(|_| TaskFleetError::Transport("result channel closed".to_string()))
    }

    fn ensure_task_channel(&self, role: &str) {
        if !self.task_txs.contains_key(role) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.task_txs.insert(role.to_string(), tx);
            self.task_rxs.insert(role.to_string(), rx);
        }
    }

    fn ensure_control_channel(&self, role: &str) {
        if !self.control_txs.contains_key(role) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.control_txs.insert(role.to_string(), tx);
            self.control_rxs.insert(role.to_string(), rx);
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskPublisher for InMemoryBroker {
    async fn publish_task(&self, role: &str, envelope: &DispatchEnvelope) -> Result<()> {
        self.ensure_task_channel(role);
        let body = serde_json::to_string(envelope)?;
        debug!(task_id = %envelope.task.id, role = role, "Publishing task");

        let tx = self
            .task_txs
            .get(role)
            .ok_or_else(|| TaskFleetError::Transport(format!("no task channel for role {role}")))?;
        tx.send(body)
            .map_err(|_| TaskFleetError::Transport(format!("task channel for {role} closed")))
    }

    async fn publish_control(&self, role: &str, message: &ControlMessage) -> Result<()> {
        self.ensure_control_channel(role);
        let body = serde_json::to_string(message)?;

        let tx = self.control_txs.get(role).ok_or_else(|| {
            TaskFleetError::Transport(format!("no control channel for role {role}"))
        })?;
        tx.send(body)
            .map_err(|_| TaskFleetError::Transport(format!("control channel for {role} closed")))
    }
}

#[async_trait]
impl ResultConsumer for InMemoryBroker {
    async fn next_result(&self) -> Result<Option<TaskResultMessage>> {
        let mut rx = self.result_rx.lock().await;
        match rx.recv().await {
            Some(body) => {
                let message: TaskResultMessage = serde_json::from_str(&body)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}
