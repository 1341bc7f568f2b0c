//! Dead-letter sink - terminal storage for tasks that cannot proceed
//!
//! The orchestrator only ever writes this sink; it never reads it back.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use tf_common::{DeadLetterRecord, Result, TaskFleetError};

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, record: DeadLetterRecord) -> Result<()>;
}

/// In-memory sink used in tests and by the dev binary.
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, record: DeadLetterRecord) -> Result<()> {
        debug!(
            task_id = %record.task.id,
            reason = record.reason.as_str(),
            "Dead-lettering task"
        );
        self.records.lock().push(record);
        Ok(())
    }
}

/// Append-only JSON-lines file sink, one record per line keyed by task id.
pub struct JsonlDeadLetterSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlDeadLetterSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| TaskFleetError::DeadLetter(format!("open {}: {e}", path.display())))?;

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetterSink {
    async fn record(&self, record: DeadLetterRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(&line).await {
            error!(task_id = %record.task.id, error = %e, "Failed to write dead-letter record");
            return Err(TaskFleetError::DeadLetter(e.to_string()));
        }
        file.flush()
            .await
            .map_err(|e| TaskFleetError::DeadLetter(e.to_string()))?;

        debug!(
            task_id = %record.task.id,
            reason = record.reason.as_str(),
            path = %self.path.display(),
            "Dead-letter record written"
        );
        Ok(())
    }
}
