pub mod api;
pub mod config;
pub mod domain;
pub mod infrastructure;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::infrastructure::metrics::Metrics;
use crate::infrastructure::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<Metrics>,
}
