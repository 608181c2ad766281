// Application state for HTTP handlers
use crate::application::publisher::SnapshotHandle;
use crate::application::snapshot_sink::SnapshotSink;
use crate::infrastructure::channel_feed::FeedSender;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub snapshots: SnapshotHandle,
    /// Present only when the channel feed is configured.
    pub intake: Option<FeedSender>,
    /// Present unless persistence is disabled.
    pub history: Option<Arc<dyn SnapshotSink>>,
}
