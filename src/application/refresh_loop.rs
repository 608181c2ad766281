// Refresh loop - fixed-cadence ingest, compute and publish
use crate::application::engine::{BatchOutcome, SpcEngine};
use crate::application::observation_feed::ObservationFeed;
use crate::application::publisher::SnapshotPublisher;
use crate::domain::observation::RawRecord;
use crate::domain::snapshot::Snapshot;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    pub cadence: Duration,
    /// Longest a cycle waits on the feed before treating it as stalled.
    pub feed_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub batch: BatchOutcome,
    pub snapshot: Arc<Snapshot>,
    /// False when the previous snapshot was re-published unchanged.
    pub published: bool,
}

pub struct RefreshLoop {
    feed: Arc<dyn ObservationFeed>,
    engine: SpcEngine,
    publisher: SnapshotPublisher,
    settings: RefreshSettings,
}

impl RefreshLoop {
    pub fn new(
        feed: Arc<dyn ObservationFeed>,
        engine: SpcEngine,
        publisher: SnapshotPublisher,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            feed,
            engine,
            publisher,
            settings,
        }
    }

    async fn pull(&self) -> Vec<RawRecord> {
        match tokio::time::timeout(self.settings.feed_wait, self.feed.next_batch()).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Feed read failed; skipping ingest this cycle");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    wait_ms = self.settings.feed_wait.as_millis() as u64,
                    "Feed stalled; skipping ingest this cycle"
                );
                Vec::new()
            }
        }
    }

    /// One cycle: pull, ingest, publish. Never fails; problems degrade to a re-publish.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let records = self.pull().await;
        let batch = self.engine.ingest_batch(&records);

        if batch.accepted == 0 {
            tracing::debug!(rejected = batch.rejected, "No new observations; re-publishing");
            return CycleReport {
                batch,
                snapshot: self.publisher.republish(),
                published: false,
            };
        }

        let published = self.publisher.publish(
            self.engine.charts(),
            self.engine.oee(),
            self.engine.stats(),
            &batch.activity,
            Utc::now(),
        );
        match published {
            Ok(snapshot) => {
                tracing::debug!(
                    sequence = snapshot.sequence,
                    accepted = batch.accepted,
                    rejected = batch.rejected,
                    out_of_control = batch.out_of_control_points,
                    "Published snapshot"
                );
                CycleReport {
                    batch,
                    snapshot,
                    published: true,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Snapshot failed validation; keeping previous");
                CycleReport {
                    batch,
                    snapshot: self.publisher.republish(),
                    published: false,
                }
            }
        }
    }

    /// Run cycles on the configured cadence until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(self.settings.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(
            cadence_ms = self.settings.cadence.as_millis() as u64,
            "Refresh loop started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        tracing::info!("Refresh loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::tests::{raw, settings};
    use crate::application::publisher::tests::MemorySink;
    use crate::application::publisher::{spawn_persistence, PersistenceSettings, SnapshotHandle};
    use crate::application::snapshot_sink::SnapshotSink;
    use crate::domain::chart::ChartId;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Hands out scripted batches, then empty ones.
    struct ScriptedFeed {
        batches: Mutex<VecDeque<anyhow::Result<Vec<RawRecord>>>>,
    }

    impl ScriptedFeed {
        fn new(batches: Vec<anyhow::Result<Vec<RawRecord>>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
            })
        }
    }

    #[async_trait]
    impl ObservationFeed for ScriptedFeed {
        async fn next_batch(&self) -> anyhow::Result<Vec<RawRecord>> {
            self.batches.lock().await.pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    struct StalledFeed;

    #[async_trait]
    impl ObservationFeed for StalledFeed {
        async fn next_batch(&self) -> anyhow::Result<Vec<RawRecord>> {
            futures::future::pending::<()>().await;
            Ok(Vec::new())
        }
    }

    fn refresh_loop(feed: Arc<dyn ObservationFeed>) -> (RefreshLoop, SnapshotHandle) {
        let (publisher, handle) = SnapshotPublisher::new(None, Utc::now());
        let timing = RefreshSettings {
            cadence: Duration::from_millis(10),
            feed_wait: Duration::from_millis(20),
        };
        (
            RefreshLoop::new(feed, SpcEngine::new(settings()), publisher, timing),
            handle,
        )
    }

    #[tokio::test]
    async fn test_cycle_publishes_new_observations() {
        let feed = ScriptedFeed::new(vec![Ok(vec![raw(1, 8, 4.0, 45.0), raw(1, 9, 5.0, 46.0)])]);
        let (mut refresh, handle) = refresh_loop(feed);

        let report = refresh.run_cycle().await;
        assert!(report.published);
        assert_eq!(report.batch.accepted, 2);
        let latest = handle.latest_snapshot();
        assert_eq!(latest.sequence, 1);
        assert_eq!(latest.stats.accepted, 2);
        assert_eq!(latest.charts[&ChartId::PChart].points.len(), 2);
    }

    #[tokio::test]
    async fn test_mid_batch_spike_is_persisted() {
        let baseline: Vec<RawRecord> = (8..14).map(|hour| raw(1, hour, 4.0, 45.0 + (hour % 2) as f64)).collect();
        let spike = vec![raw(1, 14, 4.0, 45.5), raw(1, 15, 4.0, 400.0), raw(1, 16, 4.0, 45.2)];
        let feed = ScriptedFeed::new(vec![Ok(baseline), Ok(spike)]);

        let sink = Arc::new(MemorySink::default());
        let persistence = PersistenceSettings {
            queue_capacity: 8,
            retries: 0,
            retry_delay: Duration::from_millis(1),
        };
        let (queue, worker) = spawn_persistence(sink.clone(), persistence);
        let (publisher, _handle) = SnapshotPublisher::new(Some(queue), Utc::now());
        let timing = RefreshSettings {
            cadence: Duration::from_millis(10),
            feed_wait: Duration::from_millis(20),
        };
        let mut refresh = RefreshLoop::new(feed, SpcEngine::new(settings()), publisher, timing);
        refresh.run_cycle().await;
        let report = refresh.run_cycle().await;
        assert!(report.published);
        drop(refresh);
        worker.await.unwrap();

        let records = sink.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        let cycle_points: Vec<_> = records[1]
            .points
            .iter()
            .filter(|p| p.chart == "cycle_time_i")
            .collect();
        assert_eq!(
            cycle_points.iter().map(|p| p.value).collect::<Vec<_>>(),
            vec![45.5, 400.0, 45.2]
        );
        assert!(cycle_points[1].flags.contains("beyond_control_limits"));
    }

    #[tokio::test]
    async fn test_empty_cycle_republishes_identical_snapshot() {
        let feed = ScriptedFeed::new(vec![Ok(vec![raw(1, 8, 4.0, 45.0)])]);
        let (mut refresh, handle) = refresh_loop(feed);

        let first = refresh.run_cycle().await.snapshot;
        let second = refresh.run_cycle().await;
        assert!(!second.published);
        assert!(Arc::ptr_eq(&first, &second.snapshot));
        assert_eq!(*handle.latest_snapshot(), *first);
    }

    #[tokio::test]
    async fn test_feed_error_degrades_to_noop() {
        let feed = ScriptedFeed::new(vec![
            Err(anyhow::anyhow!("connection reset")),
            Ok(vec![raw(1, 8, 4.0, 45.0)]),
        ]);
        let (mut refresh, handle) = refresh_loop(feed);

        let failed = refresh.run_cycle().await;
        assert!(!failed.published);
        assert_eq!(handle.latest_snapshot().sequence, 0);

        let recovered = refresh.run_cycle().await;
        assert!(recovered.published);
        assert_eq!(handle.latest_snapshot().sequence, 1);
    }

    #[tokio::test]
    async fn test_stalled_feed_does_not_block_cycle() {
        let (mut refresh, handle) = refresh_loop(Arc::new(StalledFeed));
        let report = tokio::time::timeout(Duration::from_secs(1), refresh.run_cycle())
            .await
            .unwrap();
        assert!(!report.published);
        assert_eq!(handle.latest_snapshot().sequence, 0);
    }

    #[tokio::test]
    async fn test_only_rejected_records_keep_snapshot() {
        let feed = ScriptedFeed::new(vec![Ok(vec![RawRecord::from_json_line("{bad")])]);
        let (mut refresh, handle) = refresh_loop(feed);
        let report = refresh.run_cycle().await;
        assert_eq!(report.batch.rejected, 1);
        assert!(!report.published);
        assert_eq!(handle.latest_snapshot().sequence, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let feed = ScriptedFeed::new(vec![Ok(vec![raw(1, 8, 4.0, 45.0)])]);
        let (refresh, handle) = refresh_loop(feed);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(refresh.run(async {
            let _ = stop_rx.await;
        }));
        let mut updates = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(1), updates.changed())
            .await
            .unwrap()
            .unwrap();
        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.latest_snapshot().sequence, 1);
    }
}
