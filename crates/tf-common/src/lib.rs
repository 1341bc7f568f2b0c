use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

// ============================================================================
// Task Model
// ============================================================================

/// Fixed priority levels. Lower number = more urgent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical = 1,
    High = 3,
    Normal = 5,
    Low = 7,
    Background = 9,
}

impl Priority {
    pub const LEVELS: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Raise urgency by one level, saturating at Critical.
    pub fn bump(self) -> Priority {
        match self {
            Priority::Critical | Priority::High => Priority::Critical,
            Priority::Normal => Priority::High,
            Priority::Low => Priority::Normal,
            Priority::Background => Priority::Low,
        }
    }

    /// True when `self` is strictly more urgent than `other`.
    pub fn more_urgent_than(self, other: Priority) -> bool {
        (self as u8) < (other as u8)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
            Priority::Background => "BACKGROUND",
        }
    }
}

/// One unit of dispatchable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Opaque payload. The orchestrator never interprets it.
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Per-task retry budget. `None` defers to the queue's configured
    /// default.
    pub max_retries: Option<u32>,
    /// Free-text origin tag.
    pub requester: String,
    /// Typed routing hints for the transport and workers.
    pub metadata: HashMap<String, String>,
}

pub const DEFAULT_TASK_TTL_HOURS: i64 = 24;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

impl Task {
    pub fn new(payload: serde_json::Value, priority: Priority, requester: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            priority,
            created_at: now,
            expires_at: now + ChronoDuration::hours(DEFAULT_TASK_TTL_HOURS),
            retry_count: 0,
            max_retries: None,
            requester: requester.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Retry budget after the queue default has been taken into account.
    pub fn retry_budget(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }
}

// ============================================================================
// Dead-Letter Records
// ============================================================================

/// Why a task reached the dead-letter sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    Expired,
    RetryExhausted,
    /// Evicted from a full queue by a more urgent task.
    Evicted,
    Cancelled,
    DispatchFailed,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Expired => "EXPIRED",
            FailureReason::RetryExhausted => "RETRY_EXHAUSTED",
            FailureReason::Evicted => "EVICTED",
            FailureReason::Cancelled => "CANCELLED",
            FailureReason::DispatchFailed => "DISPATCH_FAILED",
        }
    }
}

/// Terminal failure artifact. Write-once; the orchestrator only ever
/// appends these, it never reads them back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub task: Task,
    pub reason: FailureReason,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(task: Task, reason: FailureReason, detail: Option<String>) -> Self {
        Self {
            task,
            reason,
            detail,
            recorded_at: Utc::now(),
        }
    }
}

// ============================================================================
// Worker Fleet Model
// ============================================================================

/// Health verdict for a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerHealth {
    Healthy,
    Unhealthy,
    RestartCandidate,
}

/// One running worker process, owned by the fleet registry.
///
/// Lifecycle fields are written by the fleet controller; health fields by
/// the health monitor. Nothing else mutates a handle.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub pid: u32,
    pub started_at: Instant,
    pub last_health_check: Option<Instant>,
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub has_transport_connection: bool,
    pub consecutive_unhealthy: u32,
    /// Consecutive passing check rounds since the last failure.
    pub consecutive_healthy: u32,
    pub health: WorkerHealth,
    pub last_restart_at: Option<Instant>,
}

impl WorkerHandle {
    pub fn new(worker_id: impl Into<String>, pid: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            pid,
            started_at: Instant::now(),
            last_health_check: None,
            cpu_percent: 0.0,
            mem_percent: 0.0,
            has_transport_connection: false,
            consecutive_unhealthy: 0,
            consecutive_healthy: 0,
            health: WorkerHealth::Healthy,
            last_restart_at: None,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Point-in-time view of the whole fleet, safe to hand to other loops.
#[derive(Debug, Clone)]
pub struct FleetSnapshot {
    pub workers: Vec<WorkerHandle>,
}

impl FleetSnapshot {
    pub fn count(&self) -> usize {
        self.workers.len()
    }
}

// ============================================================================
// Scaling Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleAction {
    Up,
    Down,
    Hold,
}

/// Ephemeral record of one scaling evaluation. Kept in a bounded history
/// for cooldown enforcement and observability only.
#[derive(Debug, Clone)]
pub struct ScalingDecision {
    pub action: ScaleAction,
    pub from_count: usize,
    pub to_count: usize,
    pub queue_depth: usize,
    pub decided_at: DateTime<Utc>,
}

impl ScalingDecision {
    pub fn new(action: ScaleAction, from_count: usize, to_count: usize, queue_depth: usize) -> Self {
        Self {
            action,
            from_count,
            to_count,
            queue_depth,
            decided_at: Utc::now(),
        }
    }

    pub fn hold(current: usize, queue_depth: usize) -> Self {
        Self::new(ScaleAction::Hold, current, current, queue_depth)
    }
}

/// Inputs to one scaling tick.
#[derive(Debug, Clone, Copy)]
pub struct FleetMetrics {
    pub worker_count: usize,
    pub queue_depth: usize,
    pub host_cpu_percent: f32,
    pub host_mem_percent: f32,
}

// ============================================================================
// Credential Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialStatus {
    Active,
    RateLimited,
    Error,
    Cooldown,
}

/// One entry in the rotation pool. Never deleted, only reset.
#[derive(Debug, Clone)]
pub struct Credential {
    pub alias: String,
    pub secret: String,
    pub status: CredentialStatus,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub request_count: u64,
}

impl Credential {
    pub fn new(alias: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            secret: secret.into(),
            status: CredentialStatus::Active,
            rate_limit_reset_at: None,
            cooldown_until: None,
            error_count: 0,
            request_count: 0,
        }
    }
}

/// Outcome of one outbound call made with a credential.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Success,
    /// Upstream throttled us. `reset_at` is the server-provided reset time
    /// when present; otherwise the pool applies its configured default.
    RateLimited { reset_at: Option<DateTime<Utc>> },
    /// The credential itself was rejected.
    InvalidCredential,
    /// Some other hard error attributed to this credential.
    TransientError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationStrategy {
    RoundRobin,
    LeastErrors,
    Random,
}

impl FromStr for RotationStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" => Ok(RotationStrategy::RoundRobin),
            "least-errors" | "least_errors" => Ok(RotationStrategy::LeastErrors),
            "random" => Ok(RotationStrategy::Random),
            other => Err(format!("unknown rotation strategy: {other}")),
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Status reported by a worker on the result channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    RateLimited,
}

/// Message received from the result channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultMessage {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Best-effort control signal published towards workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    Cancel { task_id: String },
}

// ============================================================================
// Configuration
// ============================================================================

/// Static configuration surface, loaded once at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_queue_threshold: usize,
    pub scale_down_queue_threshold: usize,
    /// Global cooldown between applied scaling decisions.
    pub scale_cooldown: Duration,
    pub max_cpu_percent: f32,
    pub max_mem_percent: f32,
    /// Consecutive unhealthy checks before a restart is considered.
    pub unhealthy_threshold: u32,
    /// Cooldown measured from a worker's last restart.
    pub restart_cooldown: Duration,
    pub queue_capacity: usize,
    pub default_max_retries: u32,
    pub credential_strategy: RotationStrategy,
    /// Base delay for the rate-limit requeue backoff (`base * 2^retry`).
    pub retry_backoff_base: Duration,
    /// How long a graceful stop waits before escalating to a kill.
    pub stop_timeout: Duration,
    /// Applied when the upstream gives no rate-limit reset time.
    pub rate_limit_reset_default: Duration,
    /// Cooldown applied to a credential rejected as invalid.
    pub credential_cooldown: Duration,
    /// Command line invoked per worker; the worker id is appended.
    pub worker_command: String,
    pub worker_args: Vec<String>,
    /// Transport channel the fleet consumes from, one per worker role.
    pub worker_role: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_queue_threshold: 10,
            scale_down_queue_threshold: 2,
            scale_cooldown: Duration::from_secs(60),
            max_cpu_percent: 80.0,
            max_mem_percent: 80.0,
            unhealthy_threshold: 3,
            restart_cooldown: Duration::from_secs(300),
            queue_capacity: 1000,
            default_max_retries: DEFAULT_MAX_RETRIES,
            credential_strategy: RotationStrategy::LeastErrors,
            retry_backoff_base: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            rate_limit_reset_default: Duration::from_secs(3600),
            credential_cooldown: Duration::from_secs(900),
            worker_command: "taskfleet-worker".to_string(),
            worker_args: Vec::new(),
            worker_role: "default".to_string(),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TaskFleetError {
    #[error("queue at capacity ({capacity}) with no evictable task")]
    CapacityExceeded { capacity: usize },

    #[error("task {0} expired before dispatch")]
    Expired(String),

    #[error("task {task_id} exhausted its retry budget of {max_retries}")]
    RetryExhausted { task_id: String, max_retries: u32 },

    #[error("failed to spawn worker {worker_id}: {detail}")]
    ProcessSpawnFailed { worker_id: String, detail: String },

    #[error("upstream rate limited")]
    RateLimited,

    #[error("worker {0} unresponsive")]
    WorkerUnresponsive(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("dead-letter sink error: {0}")]
    DeadLetter(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl TaskFleetError {
    /// Transient conditions are absorbed and retried internally with
    /// backoff; terminal ones surface to the caller or the dead-letter sink.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TaskFleetError::RateLimited
                | TaskFleetError::Transport(_)
                | TaskFleetError::WorkerUnresponsive(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }
}

pub type Result<T> = std::result::Result<T, TaskFleetError>;
