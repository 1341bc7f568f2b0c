//! Operator notification hooks
//!
//! Fleet events (worker restarts, credential exhaustion, scaling moves)
//! fan out through this trait. The default sink just logs; deployments
//! wire their own channel behind it.

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// Writes notifications to the structured log at warn level.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        warn!(subject = subject, body = body, "Fleet notification");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Test sink that records every notification.
    pub struct CollectingNotifier {
        pub events: Mutex<Vec<(String, String)>>,
    }

    impl CollectingNotifier {
        pub fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Notifier for CollectingNotifier {
        async fn notify(&self, subject: &str, body: &str) {
            self.events
                .lock()
                .push((subject.to_string(), body.to_string()));
        }
    }
}
