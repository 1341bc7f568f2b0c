//! TaskFleet queueing layer
//!
//! This crate provides:
//! - PriorityTaskQueue: in-memory multi-level queue with expiry, capacity
//!   eviction and rate-limit-aware requeue/backoff
//! - DeadLetterSink: write-once sink for terminal task failures
//! - TaskPublisher / ResultConsumer: transport seam towards the external
//!   durable broker, with an in-memory broker for development and tests

pub mod dead_letter;
pub mod priority_queue;
pub mod transport;

pub use dead_letter::{DeadLetterSink, InMemoryDeadLetterSink, JsonlDeadLetterSink};
pub use priority_queue::{PriorityTaskQueue, QueueConfig, QueueStats, RequeueOutcome, SweepStats};
pub use transport::{
    DispatchCredential, DispatchEnvelope, InMemoryBroker, ResultConsumer, TaskPublisher,
};

pub use tf_common::Result;
