pub mod chart_engine;
pub mod engine;
pub mod estimator;
pub mod observation_feed;
pub mod oee_calculator;
pub mod publisher;
pub mod refresh_loop;
pub mod snapshot_sink;
