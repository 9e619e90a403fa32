use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::infrastructure::store;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListFeedsQuery {
    #[serde(default)]
    enabled_only: bool,
}

pub async fn list_feeds(
    State(state): State<AppState>,
    Query(query): Query<ListFeedsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let feeds = store::get_feeds(&state.pool, query.enabled_only)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!(feeds)))
}

pub async fn get_feed(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let feed = store::get_feed(&state.pool, id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(serde_json::json!(feed)))
}

pub async fn refresh_feed(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    store::get_feed(&state.pool, id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    state.scheduler.refresh(id).await;
    Ok(StatusCode::ACCEPTED)
}
