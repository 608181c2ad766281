// Feed trait for pulling raw production records
use crate::domain::observation::RawRecord;
use async_trait::async_trait;

#[async_trait]
pub trait ObservationFeed: Send + Sync {
    /// Next batch of raw records, possibly empty.
    /// The refresh loop bounds how long it waits on this call.
    async fn next_batch(&self) -> anyhow::Result<Vec<RawRecord>>;
}
