pub mod feeds;
pub mod health;
pub mod items;
pub mod scheduler_status;

use axum::Router;
use axum::routing::get;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::check))
        .route("/feeds", get(feeds::list_feeds))
        .route("/feeds/:id", get(feeds::get_feed))
        .route("/feeds/:id/refresh", axum::routing::post(feeds::refresh_feed))
        .route("/items", get(items::list_items))
        .route("/items/:id", get(items::get_item))
        .route("/scheduler/status", get(scheduler_status::status))
        .route("/metrics", get(scheduler_status::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .with_state(state)
}
