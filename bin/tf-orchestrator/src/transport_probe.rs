//! Connectivity probe over the in-process broker.
//!
//! The dev broker has no per-worker sessions, so connectivity is judged
//! at role granularity: a worker counts as connected while some consumer
//! holds the role's task channel. A broker with real per-connection
//! state would implement the probe per worker.

use async_trait::async_trait;
use std::sync::Arc;

use tf_fleet::ConnectivityProbe;
use tf_queue::transport::InMemoryBroker;

pub struct BrokerConnectivityProbe {
    broker: Arc<InMemoryBroker>,
    role: String,
}

impl BrokerConnectivityProbe {
    pub fn new(broker: Arc<InMemoryBroker>, role: impl Into<String>) -> Self {
        Self {
            broker,
            role: role.into(),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for BrokerConnectivityProbe {
    async fn is_connected(&self, _worker_id: &str) -> bool {
        self.broker.has_consumer(&self.role)
    }
}
