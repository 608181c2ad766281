// Sink trait for persisting snapshot metrics records
use crate::domain::errors::PersistenceWriteError;
use crate::domain::snapshot::MetricsRecord;
use async_trait::async_trait;

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Append one record. Must never rewrite earlier records.
    async fn append(&self, record: &MetricsRecord) -> Result<(), PersistenceWriteError>;

    /// Every record appended so far, oldest first.
    async fn read_all(&self) -> anyhow::Result<Vec<MetricsRecord>>;
}
