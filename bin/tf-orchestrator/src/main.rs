//! TaskFleet Orchestrator
//!
//! Dispatches prioritized tasks to a self-managed fleet of worker
//! processes: priority queue with eviction and retry backoff, OS-level
//! worker lifecycle with health-gated restarts, queue-driven scaling and
//! credential rotation for the workers' upstream calls.
//!
//! Configuration is environment-based (`TASKFLEET_*`); credentials are
//! supplied as `TASKFLEET_CREDENTIALS=alias:secret[,alias:secret...]`.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tf_common::{Credential, OrchestratorConfig, RotationStrategy};
use tf_fleet::{
    CredentialPool, CredentialPoolConfig, FleetController, FleetControllerConfig,
    HealthCheckConfig, HealthMonitor, LogNotifier, ScalingConfig, ScalingPolicy,
    SysinfoInspector, WorkerProcessSpawner,
};
use tf_orchestrator::{Dispatcher, DispatcherConfig, LifecycleConfig, LifecycleManager};
use tf_queue::priority_queue::{PriorityTaskQueue, QueueConfig};
use tf_queue::transport::InMemoryBroker;
use tf_queue::JsonlDeadLetterSink;

mod transport_probe;

use transport_probe::BrokerConnectivityProbe;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting TaskFleet Orchestrator");

    let config = load_config()?;
    let credentials = load_credentials()?;

    // 1. Dead-letter sink
    let dead_letter_path = std::env::var("TASKFLEET_DEAD_LETTER_PATH")
        .unwrap_or_else(|_| "taskfleet-dead-letter.jsonl".to_string());
    let dead_letter = Arc::new(
        JsonlDeadLetterSink::create(&dead_letter_path)
            .await
            .with_context(|| format!("opening dead-letter sink at {dead_letter_path}"))?,
    );

    // 2. Priority queue
    let queue = Arc::new(PriorityTaskQueue::new(
        QueueConfig {
            capacity: config.queue_capacity,
            backoff_base: config.retry_backoff_base,
            sweep_interval: Duration::from_secs(30),
            default_max_retries: config.default_max_retries,
        },
        dead_letter.clone(),
    ));

    // 3. Transport
    let broker = Arc::new(InMemoryBroker::new());

    // 4. Worker fleet
    let spawner = Arc::new(WorkerProcessSpawner::new(
        config.worker_command.clone(),
        config.worker_args.clone(),
    ));
    let fleet = Arc::new(FleetController::new(
        FleetControllerConfig {
            stop_timeout: config.stop_timeout,
        },
        spawner,
    ));

    // 5. Credential pool
    let credential_pool = Arc::new(CredentialPool::new(
        CredentialPoolConfig {
            strategy: config.credential_strategy,
            rate_limit_reset_default: config.rate_limit_reset_default,
            cooldown: config.credential_cooldown,
        },
        credentials,
    ));

    // 6. Dispatcher
    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig {
            worker_role: config.worker_role.clone(),
        },
        queue.clone(),
        broker.clone(),
        credential_pool.clone(),
        dead_letter.clone(),
    ));

    // 7. Health monitor and scaling policy
    let notifier = Arc::new(LogNotifier);
    let health = Arc::new(HealthMonitor::new(
        HealthCheckConfig {
            cpu_threshold: config.max_cpu_percent,
            mem_threshold: config.max_mem_percent,
            unhealthy_threshold: config.unhealthy_threshold,
            restart_cooldown: config.restart_cooldown,
            ..Default::default()
        },
        fleet.clone(),
        Box::new(SysinfoInspector::new()),
        Arc::new(BrokerConnectivityProbe::new(
            broker.clone(),
            config.worker_role.clone(),
        )),
        notifier.clone(),
    ));
    let scaling = Arc::new(ScalingPolicy::new(ScalingConfig {
        min_workers: config.min_workers,
        max_workers: config.max_workers,
        scale_up_threshold: config.scale_up_queue_threshold,
        scale_down_threshold: config.scale_down_queue_threshold,
        cooldown: config.scale_cooldown,
        ..Default::default()
    }));

    // 8. Bring the fleet up to the floor before accepting work
    fleet
        .set_target_count(config.min_workers)
        .await
        .context("starting initial workers")?;

    // 9. Control loops
    let lifecycle = LifecycleManager::start(
        LifecycleConfig::default(),
        queue.clone(),
        fleet.clone(),
        dispatcher,
        health,
        scaling,
        broker.clone(),
        notifier,
        Box::new(SysinfoInspector::new()),
    );

    log_startup_summary(&config, &dead_letter_path);

    info!("TaskFleet Orchestrator started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    lifecycle.shutdown().await;

    info!("TaskFleet Orchestrator shutdown complete");
    Ok(())
}

/// Load orchestrator configuration from environment variables.
fn load_config() -> Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::default();

    config.min_workers = env_parse("TASKFLEET_MIN_WORKERS", config.min_workers);
    config.max_workers = env_parse("TASKFLEET_MAX_WORKERS", config.max_workers);
    config.scale_up_queue_threshold =
        env_parse("TASKFLEET_SCALE_UP_THRESHOLD", config.scale_up_queue_threshold);
    config.scale_down_queue_threshold = env_parse(
        "TASKFLEET_SCALE_DOWN_THRESHOLD",
        config.scale_down_queue_threshold,
    );
    config.scale_cooldown =
        Duration::from_secs(env_parse("TASKFLEET_SCALE_COOLDOWN_SECONDS", 60));
    config.max_cpu_percent = env_parse("TASKFLEET_MAX_CPU_PERCENT", config.max_cpu_percent);
    config.max_mem_percent = env_parse("TASKFLEET_MAX_MEM_PERCENT", config.max_mem_percent);
    config.unhealthy_threshold =
        env_parse("TASKFLEET_UNHEALTHY_THRESHOLD", config.unhealthy_threshold);
    config.restart_cooldown =
        Duration::from_secs(env_parse("TASKFLEET_RESTART_COOLDOWN_SECONDS", 300));
    config.queue_capacity = env_parse("TASKFLEET_QUEUE_CAPACITY", config.queue_capacity);
    config.default_max_retries =
        env_parse("TASKFLEET_DEFAULT_MAX_RETRIES", config.default_max_retries);
    config.retry_backoff_base =
        Duration::from_secs(env_parse("TASKFLEET_RETRY_BACKOFF_SECONDS", 30));
    config.stop_timeout = Duration::from_secs(env_parse("TASKFLEET_STOP_TIMEOUT_SECONDS", 30));

    if let Ok(strategy) = std::env::var("TASKFLEET_CREDENTIAL_STRATEGY") {
        config.credential_strategy = strategy
            .parse::<RotationStrategy>()
            .map_err(|e| anyhow::anyhow!(e))
            .context("TASKFLEET_CREDENTIAL_STRATEGY")?;
    }
    if let Ok(command) = std::env::var("TASKFLEET_WORKER_COMMAND") {
        config.worker_command = command;
    }
    if let Ok(args) = std::env::var("TASKFLEET_WORKER_ARGS") {
        config.worker_args = args.split_whitespace().map(str::to_string).collect();
    }
    if let Ok(role) = std::env::var("TASKFLEET_WORKER_ROLE") {
        config.worker_role = role;
    }

    if config.min_workers == 0 || config.min_workers > config.max_workers {
        bail!(
            "invalid worker bounds: min={} max={}",
            config.min_workers,
            config.max_workers
        );
    }

    Ok(config)
}

/// Parse `TASKFLEET_CREDENTIALS=alias:secret[,alias:secret...]`.
fn load_credentials() -> Result<Vec<Credential>> {
    let raw = std::env::var("TASKFLEET_CREDENTIALS")
        .context("TASKFLEET_CREDENTIALS must be set (alias:secret[,alias:secret...])")?;

    let mut credentials = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((alias, secret)) = entry.split_once(':') else {
            bail!("malformed credential entry (expected alias:secret): {entry}");
        };
        credentials.push(Credential::new(alias, secret));
    }
    if credentials.is_empty() {
        bail!("TASKFLEET_CREDENTIALS contained no credentials");
    }
    Ok(credentials)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn log_startup_summary(config: &OrchestratorConfig, dead_letter_path: &str) {
    info!("=== TaskFleet Orchestrator Startup Summary ===");
    info!(
        "  Fleet: {}-{} workers, role '{}', command '{}'",
        config.min_workers, config.max_workers, config.worker_role, config.worker_command
    );
    info!(
        "  Queue: capacity {}, scale thresholds up>={} down<={}",
        config.queue_capacity, config.scale_up_queue_threshold, config.scale_down_queue_threshold
    );
    info!(
        "  Health: {} consecutive checks, restart cooldown {}s",
        config.unhealthy_threshold,
        config.restart_cooldown.as_secs()
    );
    info!("  Credentials: {:?} rotation", config.credential_strategy);
    info!("  Dead letter: {}", dead_letter_path);
    info!("==============================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
