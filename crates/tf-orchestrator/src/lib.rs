//! Orchestrator - ties queue, fleet and transport together
//!
//! The dispatcher moves tasks from the priority queue onto the transport
//! and folds worker results back into queue and credential state. The
//! lifecycle manager runs the control loops (dispatch, results, health,
//! scaling, queue sweep) and coordinates graceful shutdown.

pub mod dispatcher;
pub mod lifecycle;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use lifecycle::{LifecycleConfig, LifecycleManager};

pub use tf_common::Result;
