use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::domain::models::ItemSort;
use crate::infrastructure::store;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListItemsQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    feed_id: Option<i64>,
    search: Option<String>,
    #[serde(default)]
    sort: ItemSort,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    50
}

pub async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ListItemsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let items = store::get_items(
        &state.pool,
        query.page,
        query.limit,
        query.feed_id,
        query.search.as_deref(),
        query.sort,
    )
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let total = store::get_items_count(&state.pool, query.feed_id, query.search.as_deref())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(serde_json::json!({
        "items": items,
        "page": query.page,
        "limit": query.limit,
        "total": total,
    })))
}

pub async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let item = store::get_item(&state.pool, id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(serde_json::json!(item)))
}
