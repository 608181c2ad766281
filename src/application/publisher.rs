// Snapshot publisher - immutable snapshots for display, metrics records for persistence
use crate::application::engine::OeeSummary;
use crate::application::snapshot_sink::SnapshotSink;
use crate::domain::chart::ChartId;
use crate::domain::errors::PublishError;
use crate::domain::snapshot::{ChartSeries, CycleActivity, IngestStats, MetricsRecord, Snapshot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Read side of the publisher. Cheap to clone; never sees a partially built snapshot.
#[derive(Clone)]
pub struct SnapshotHandle {
    rx: watch::Receiver<Arc<Snapshot>>,
}

impl SnapshotHandle {
    pub fn latest_snapshot(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.rx.clone()
    }
}

/// Write side of the persistence worker's queue.
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::Sender<MetricsRecord>,
}

impl PersistenceQueue {
    /// Queue a record without waiting. A full or closed queue drops it with a warning.
    pub fn enqueue(&self, record: MetricsRecord) {
        let sequence = record.sequence;
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(sequence, "Persistence queue full; dropping metrics record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(sequence, "Persistence worker stopped; dropping metrics record");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PersistenceSettings {
    pub queue_capacity: usize,
    pub retries: u32,
    pub retry_delay: Duration,
}

/// Spawn the task that appends queued records to `sink`, retrying failed writes.
/// The task ends once every `PersistenceQueue` clone is dropped and the queue is drained.
pub fn spawn_persistence(
    sink: Arc<dyn SnapshotSink>,
    settings: PersistenceSettings,
) -> (PersistenceQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<MetricsRecord>(settings.queue_capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let mut attempt = 0;
            loop {
                match sink.append(&record).await {
                    Ok(()) => break,
                    Err(e) if attempt < settings.retries => {
                        tracing::warn!(
                            sequence = record.sequence,
                            attempt,
                            error = %e,
                            "Persisting metrics record failed; retrying"
                        );
                        tokio::time::sleep(settings.retry_delay * 2u32.saturating_pow(attempt)).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            sequence = record.sequence,
                            error = %e,
                            "Giving up on metrics record"
                        );
                        break;
                    }
                }
            }
        }
        tracing::debug!("Persistence worker finished");
    });

    (PersistenceQueue { tx }, handle)
}

pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<Snapshot>>,
    persistence: Option<PersistenceQueue>,
}

impl SnapshotPublisher {
    pub fn new(persistence: Option<PersistenceQueue>, now: DateTime<Utc>) -> (Self, SnapshotHandle) {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::empty(now)));
        (Self { tx, persistence }, SnapshotHandle { rx })
    }

    /// Assemble, validate and hand off a new snapshot, then queue its metrics record
    /// together with `activity`, the points and intervals the cycle added.
    /// On error nothing is handed off and the previous snapshot stays current.
    pub fn publish(
        &mut self,
        charts: BTreeMap<ChartId, ChartSeries>,
        oee: OeeSummary,
        stats: IngestStats,
        activity: &CycleActivity,
        now: DateTime<Utc>,
    ) -> Result<Arc<Snapshot>, PublishError> {
        let previous = self.tx.borrow().clone();
        let generated_at = if now > previous.generated_at {
            now
        } else {
            previous.generated_at + chrono::Duration::microseconds(1)
        };

        let snapshot = Snapshot {
            sequence: previous.sequence + 1,
            generated_at,
            charts,
            oee: oee.latest,
            oee_in_progress: oee.in_progress,
            oee_history: oee.history,
            oee_averages: oee.averages,
            stats,
        };
        snapshot.validate()?;

        let snapshot = Arc::new(snapshot);
        let record = MetricsRecord::new(&snapshot, activity);
        self.tx.send_replace(snapshot.clone());
        if let Some(queue) = &self.persistence {
            queue.enqueue(record);
        }
        Ok(snapshot)
    }

    /// The current snapshot, unchanged. Used by cycles that saw no new records.
    pub fn republish(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }
}
