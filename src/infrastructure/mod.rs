// Infrastructure layer - External dependencies and adapters
pub mod channel_feed;
pub mod chunked_json;
pub mod config;
pub mod http_response;
pub mod influx_sink;
pub mod jsonl_feed;
pub mod jsonl_sink;
