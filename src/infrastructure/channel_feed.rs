// Channel feed - in-process queue filled by the HTTP intake endpoint
use crate::application::observation_feed::ObservationFeed;
use crate::domain::observation::RawRecord;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

pub struct ChannelFeed {
    rx: Mutex<mpsc::Receiver<RawRecord>>,
    max_batch: usize,
}

/// Producer side of a `ChannelFeed`.
#[derive(Clone)]
pub struct FeedSender {
    tx: mpsc::Sender<RawRecord>,
}

pub fn channel_feed(capacity: usize, max_batch: usize) -> (ChannelFeed, FeedSender) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelFeed {
            rx: Mutex::new(rx),
            max_batch,
        },
        FeedSender { tx },
    )
}

impl FeedSender {
    /// Queue records without waiting. Returns how many were queued; a full
    /// queue stops the submission early.
    pub fn submit(&self, records: Vec<RawRecord>) -> Result<usize> {
        let total = records.len();
        let mut queued = 0;
        for record in records {
            match self.tx.try_send(record) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(queued, total, "Intake queue full; rejecting the rest");
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    anyhow::bail!("intake queue is closed");
                }
            }
        }
        Ok(queued)
    }
}

#[async_trait]
impl ObservationFeed for ChannelFeed {
    /// Drain what is already queued, up to the batch limit. Never waits.
    async fn next_batch(&self) -> Result<Vec<RawRecord>> {
        let mut rx = self.rx.lock().await;
        let mut records = Vec::new();
        while records.len() < self.max_batch {
            match rx.try_recv() {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }
        Ok(records)
    }
}
