use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct JobStatusView {
    id: i64,
    name: String,
    next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SchedulerStatusView {
    running: bool,
    job_count: usize,
    uptime_seconds: u64,
    jobs: Vec<JobStatusView>,
}

pub(crate) async fn status(State(state): State<AppState>) -> Json<SchedulerStatusView> {
    let status = state.scheduler.status().await;
    Json(SchedulerStatusView {
        running: status.running,
        job_count: status.job_count,
        uptime_seconds: status.uptime_seconds,
        jobs: status
            .jobs
            .into_iter()
            .map(|j| JobStatusView {
                id: j.id,
                name: j.name,
                next_run: j.next_run,
            })
            .collect(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let stats = crate::infrastructure::store::get_feed_stats(&state.pool).await;
    if let Ok(stats) = stats {
        let total_feeds = stats.len() as f64;
        let total_items: i64 = stats.iter().map(|s| s.item_count).sum();
        state.metrics.set_gauge("total_feeds", &[], total_feeds);
        state.metrics.set_gauge("total_items", &[], total_items as f64);
    }
    state.metrics.set_gauge("uptime_seconds", &[], state.metrics.uptime_seconds());

    let scheduler_status = state.scheduler.status().await;
    state
        .metrics
        .set_gauge("scheduler_queue_depth", &[], scheduler_status.job_count as f64);

    if let Ok(bytes) = crate::infrastructure::store::db_size_bytes(&state.pool).await {
        state.metrics.set_gauge("db_size_bytes", &[], bytes as f64);
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}
