// JSON-lines sink - append-only metrics history on local disk
use crate::application::snapshot_sink::SnapshotSink;
use crate::domain::errors::PersistenceWriteError;
use crate::domain::snapshot::MetricsRecord;
use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    /// Serializes appends so concurrent writers never interleave lines.
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl SnapshotSink for JsonLinesSink {
    async fn append(&self, record: &MetricsRecord) -> Result<(), PersistenceWriteError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all(&self) -> anyhow::Result<Vec<MetricsRecord>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read history {}", self.path.display()))
            }
        };

        let mut records = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MetricsRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(line = index + 1, error = %e, "Skipping unreadable history line"),
            }
        }
        Ok(records)
    }
}
