// Presentation layer - HTTP surface over the published snapshots
pub mod app_state;
pub mod handlers;
