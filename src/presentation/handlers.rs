// HTTP request handlers
use crate::domain::chart::ChartId;
use crate::domain::observation::RawRecord;
use crate::infrastructure::chunked_json::snapshot_stream;
use crate::infrastructure::http_response::{accepts_brotli, json_response};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Latest published snapshot
pub async fn latest_snapshot(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let snapshot = state.snapshots.latest_snapshot();
    match json_response(&*snapshot, accepts_brotli(&headers)).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// One chart of the latest snapshot, by name (`p_chart`, `cycle_time_i`, ...)
pub async fn chart(
    Path(name): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(id) = ChartId::from_name(&name) else {
        return (StatusCode::NOT_FOUND, format!("unknown chart `{name}`")).into_response();
    };
    let snapshot = state.snapshots.latest_snapshot();
    let Some(series) = snapshot.charts.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match json_response(series, accepts_brotli(&headers)).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// Stream every published snapshot as length-prefixed frames
pub async fn stream_snapshots(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match snapshot_stream(state.snapshots.subscribe(), accepts_brotli(&headers)) {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// Full persisted metrics history
pub async fn history(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(sink) = &state.history else {
        return (StatusCode::NOT_FOUND, "persistence is disabled").into_response();
    };
    match sink.read_all().await {
        Ok(records) => match json_response(&records, accepts_brotli(&headers)).await {
            Ok(response) => response,
            Err(status) => status.into_response(),
        },
        Err(e) => {
            tracing::error!(error = %e, "Failed to read metrics history");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Queue raw records for the next refresh cycle
pub async fn post_records(
    State(state): State<Arc<AppState>>,
    Json(records): Json<Vec<RawRecord>>,
) -> impl IntoResponse {
    let Some(intake) = &state.intake else {
        return (StatusCode::SERVICE_UNAVAILABLE, "record intake is not configured").into_response();
    };
    let submitted = records.len();
    match intake.submit(records) {
        Ok(queued) => {
            tracing::debug!(submitted, queued, "Queued records");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "queued": queued, "submitted": submitted })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Record intake failed");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
