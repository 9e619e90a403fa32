use std::sync::Arc;
use std::time::Duration;

use feeder::config::Settings;
use feeder::infrastructure::database::setup_database;
use feeder::infrastructure::http_client::{HttpClient, RetryPolicy};
use feeder::infrastructure::job_runner::JobRunner;
use feeder::infrastructure::metrics::Metrics;
use feeder::infrastructure::rate_limiter::RateLimiter;
use feeder::infrastructure::scheduler::Scheduler;
use feeder::infrastructure::store;
use feeder::{api, config, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env();

    let pool = setup_database(&settings.database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    for feed in config::load_feeds(&settings) {
        store::add_feed(
            &pool,
            &feed.name,
            &feed.url,
            feed.interval_seconds.unwrap_or(settings.default_interval_secs),
        )
        .await?;
    }

    let rate_limiter = Arc::new(RateLimiter::new(settings.global_concurrency, settings.per_host_rps));
    let http_client = Arc::new(HttpClient::with_retry_policy(
        &settings.user_agent(),
        Duration::from_secs(settings.fetch_timeout_secs),
        RetryPolicy {
            max_attempts: settings.retry_max_attempts,
            base_ms: settings.retry_base_ms,
            max_ms: settings.retry_max_ms,
        },
    ));
    let metrics = Arc::new(Metrics::new());

    let runner = Arc::new(JobRunner::new(
        pool.clone(),
        rate_limiter,
        http_client,
        metrics.clone(),
        settings.default_ttl_hours,
        settings.max_items,
    ));

    let scheduler = Scheduler::new(pool.clone(), runner, settings.global_concurrency);
    scheduler.start().await?;

    let state = AppState {
        pool,
        scheduler: scheduler.clone(),
        metrics,
    };

    let app = api::router(state);
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    Ok(())
}

async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    scheduler.shutdown().await;
}
