// Main entry point - Dependency injection and server setup
mod domain;
mod application;
mod infrastructure;
mod presentation;

use std::sync::Arc;
use anyhow::Context;
use axum::{routing::{get, post}, Router};
use tower_http::trace::TraceLayer;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::application::engine::SpcEngine;
use crate::application::observation_feed::ObservationFeed;
use crate::application::publisher::{spawn_persistence, SnapshotPublisher};
use crate::application::refresh_loop::RefreshLoop;
use crate::application::snapshot_sink::SnapshotSink;
use crate::infrastructure::channel_feed::channel_feed;
use crate::infrastructure::config::{load_config, FeedSettings, SinkSettings};
use crate::infrastructure::influx_sink::InfluxSink;
use crate::infrastructure::jsonl_feed::JsonLinesFeed;
use crate::infrastructure::jsonl_sink::JsonLinesSink;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    chart, health_check, history, latest_snapshot, post_records, stream_snapshots,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let settings = load_config()
        .context("Failed to load configuration")?
        .validate()
        .context("Invalid configuration")?;

    // Create feed and sink (infrastructure layer)
    let (feed, intake) = match &settings.feed {
        FeedSettings::Channel { capacity, max_batch } => {
            let (feed, sender) = channel_feed(*capacity, *max_batch);
            (Arc::new(feed) as Arc<dyn ObservationFeed>, Some(sender))
        }
        FeedSettings::JsonLines { path, max_batch } => {
            tracing::info!(path = %path.display(), "Tailing JSON-lines feed");
            (Arc::new(JsonLinesFeed::new(path.clone(), *max_batch)) as Arc<dyn ObservationFeed>, None)
        }
    };

    let sink: Option<Arc<dyn SnapshotSink>> = match &settings.sink {
        SinkSettings::Disabled => None,
        SinkSettings::JsonLines { path } => {
            tracing::info!(path = %path.display(), "Persisting metrics to JSON lines");
            Some(Arc::new(JsonLinesSink::new(path.clone())) as Arc<dyn SnapshotSink>)
        }
        SinkSettings::Influx(influx) => {
            tracing::info!(host = %influx.host, database = %influx.database, "Persisting metrics to InfluxDB");
            Some(Arc::new(InfluxSink::new(influx.clone())) as Arc<dyn SnapshotSink>)
        }
    };

    // Create engine, publisher and refresh loop (application layer)
    let (queue, persistence_worker) = match &sink {
        Some(sink) => {
            let (queue, worker) = spawn_persistence(sink.clone(), settings.persistence);
            (Some(queue), Some(worker))
        }
        None => (None, None),
    };
    let (publisher, snapshots) = SnapshotPublisher::new(queue, chrono::Utc::now());
    let engine = SpcEngine::new(settings.engine.clone());
    let refresh = RefreshLoop::new(feed, engine, publisher, settings.refresh);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh_task = tokio::spawn(refresh.run(shutdown_signal(shutdown_rx.clone())));
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    // Create application state
    let state = Arc::new(AppState {
        snapshots,
        intake,
        history: sink,
    });

    // Build router (presentation layer)
    // Responses are compressed per handler, so no CompressionLayer here
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/snapshot", get(latest_snapshot))
        .route("/snapshot/stream", get(stream_snapshots))
        .route("/charts/:name", get(chart))
        .route("/history", get(history))
        .route("/records", post(post_records))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind))?;
    tracing::info!(addr = %settings.bind, "Starting spc-line-monitor service");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await
        .context("HTTP server failed")?;

    // Dropping the refresh loop closes the persistence queue; the worker drains it and exits
    refresh_task.await.context("Refresh loop panicked")?;
    if let Some(worker) = persistence_worker {
        worker.await.context("Persistence worker panicked")?;
    }
    tracing::info!("Stopped");

    Ok(())
}

async fn shutdown_signal(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
