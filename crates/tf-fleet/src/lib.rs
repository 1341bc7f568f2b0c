//! TaskFleet worker fleet management
//!
//! This crate provides:
//! - FleetController: owns the worker process lifecycle and the handle
//!   registry (start/stop/restart/scale)
//! - HealthMonitor: samples per-worker resource usage and connectivity and
//!   drives cooldown-gated restarts
//! - ScalingPolicy: cooldown-gated scale-up/scale-down decisions
//! - CredentialPool: rotation across interchangeable API credentials
//! - Notifier: fire-and-forget human-readable status messages

pub mod controller;
pub mod credentials;
pub mod health;
pub mod inspect;
pub mod notifier;
pub mod process;
pub mod scaling;

pub use controller::{FleetController, FleetControllerConfig};
pub use credentials::{CredentialPool, CredentialPoolConfig};
pub use health::{ConnectivityProbe, HealthCheckConfig, HealthMonitor, HealthSummary};
pub use inspect::{HostSample, ProcessSample, ResourceInspector, SysinfoInspector};
pub use notifier::{LogNotifier, Notifier};
pub use process::{ProcessSpawner, SpawnedProcess, WorkerProcessSpawner};
pub use scaling::{ScalingConfig, ScalingPolicy};

pub use tf_common::Result;
