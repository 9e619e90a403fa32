use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tracing::{info, warn};
use url::Url;

use crate::domain::models::FetchStatus;
use crate::infrastructure::http_client::{FetchError, HttpClient};
use crate::infrastructure::metrics::Metrics;
use crate::infrastructure::parser;
use crate::infrastructure::rate_limiter::RateLimiter;
use crate::infrastructure::store;

/// Holds a feed's `is_fetching` lock for the lifetime of this guard and
/// releases it on drop — including on panic unwind — by spawning a
/// detached release task, since `Drop` cannot itself be async.
struct FeedLockGuard {
    pool: SqlitePool,
    feed_id: i64,
    released: bool,
}

impl FeedLockGuard {
    async fn acquire(pool: &SqlitePool, feed_id: i64) -> Option<Self> {
        if store::acquire_feed_lock(pool, feed_id).await.ok()? {
            Some(Self {
                pool: pool.clone(),
                feed_id,
                released: false,
            })
        } else {
            None
        }
    }

    async fn release(mut self) {
        self.released = true;
        if let Err(err) = store::release_feed_lock(&self.pool, self.feed_id).await {
            warn!(feed_id = self.feed_id, error = %err, "failed to release feed lock");
        }
    }
}

impl Drop for FeedLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        let feed_id = self.feed_id;
        tokio::spawn(async move {
            if let Err(err) = store::release_feed_lock(&pool, feed_id).await {
                warn!(feed_id, error = %err, "failed to release feed lock during unwind");
            }
        });
    }
}

/// Outcome of one tick, for the scheduler/caller to log or test against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Dropped,
    RateLimited,
    NotModified,
    Success,
    NoItems,
    Error,
}

pub struct JobRunner {
    pool: SqlitePool,
    rate_limiter: Arc<RateLimiter>,
    http_client: Arc<HttpClient>,
    metrics: Arc<Metrics>,
    ttl_hours: i64,
    max_items: i64,
}

impl JobRunner {
    pub fn new(
        pool: SqlitePool,
        rate_limiter: Arc<RateLimiter>,
        http_client: Arc<HttpClient>,
        metrics: Arc<Metrics>,
        ttl_hours: i64,
        max_items: i64,
    ) -> Self {
        Self {
            pool,
            rate_limiter,
            http_client,
            metrics,
            ttl_hours,
            max_items,
        }
    }

    /// Run one tick for `feed_id`: try-lock, rate-acquire, fetch, parse,
    /// store, update health, log, emit metrics, release. Composes A→B→C→D
    /// per the job runner contract; never propagates an error past this
    /// boundary — every terminal path logs a fetch row and releases the lock.
    pub async fn run_once(&self, feed_id: i64) -> RunOutcome {
        let guard = match FeedLockGuard::acquire(&self.pool, feed_id).await {
            Some(guard) => guard,
            None => return RunOutcome::Dropped,
        };

        let outcome = self.execute(feed_id).await;
        guard.release().await;
        outcome
    }

    async fn execute(&self, feed_id: i64) -> RunOutcome {
        let started = Instant::now();

        let feed = match store::get_feed(&self.pool, feed_id).await {
            Ok(Some(feed)) => feed,
            _ => return RunOutcome::Error,
        };

        let host = Url::parse(&feed.url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| "unknown".to_string());

        let permit = self.rate_limiter.acquire(&host).await;
        let permit = match permit {
            Some(permit) => permit,
            None => return RunOutcome::RateLimited,
        };

        let result = self
            .http_client
            .fetch(&feed.url, feed.etag.as_deref(), feed.last_modified.as_deref())
            .await;
        drop(permit);

        self.rate_limiter.record(&host, result.status != 0 && result.status < 500).await;

        if let Some(retry_after) = result.retry_after {
            self.rate_limiter.set_cooldown(&host, retry_after).await;
        }

        let duration_ms = started.elapsed().as_millis() as u64;

        if result.is_not_modified() {
            let _ = store::update_feed_status(&self.pool, feed_id, FetchStatus::NotModified.as_str(), None, None)
                .await;
            let _ = store::update_adaptive_backoff(&self.pool, feed_id, true).await;
            let _ = store::log_fetch(&self.pool, feed_id, 304, 0, 0, None, duration_ms as i64).await;
            self.metrics.record_fetch(feed_id, &host, 304, duration_ms, 0, None);
            return RunOutcome::NotModified;
        }

        if !result.is_success() {
            let reason = classify_error(result.status, result.error.as_deref());
            let _ = store::update_feed_status(&self.pool, feed_id, FetchStatus::Error.as_str(), None, None).await;
            let _ = store::update_adaptive_backoff(&self.pool, feed_id, false).await;
            let _ = store::log_fetch(
                &self.pool,
                feed_id,
                result.status as i64,
                0,
                0,
                result.error.as_deref(),
                duration_ms as i64,
            )
            .await;
            self.metrics
                .record_fetch(feed_id, &host, result.status, duration_ms, 0, Some(reason));
            warn!(feed_id, status = result.status, reason, "fetch failed");
            return RunOutcome::Error;
        }

        let items = parser::parse_feed(feed_id, &result.body);
        let items_found = items.len() as i64;
        let newest_published = items.iter().filter_map(|i| i.published).max();

        let items_new = match store::add_items(&self.pool, &items, self.max_items).await {
            Ok(n) => n as i64,
            Err(err) => {
                warn!(feed_id, error = %err, "store contention while adding items");
                let _ = store::update_feed_status(&self.pool, feed_id, FetchStatus::Error.as_str(), None, None).await;
                let _ = store::update_adaptive_backoff(&self.pool, feed_id, false).await;
                let _ = store::log_fetch(
                    &self.pool,
                    feed_id,
                    result.status as i64,
                    items_found,
                    0,
                    Some("store contention"),
                    duration_ms as i64,
                )
                .await;
                self.metrics.record_fetch(
                    feed_id,
                    &host,
                    result.status,
                    duration_ms,
                    0,
                    Some("store_contention"),
                );
                return RunOutcome::Error;
            }
        };

        let status = if items_found == 0 {
            FetchStatus::NoItems
        } else {
            FetchStatus::Success
        };

        let _ = store::update_feed_status(
            &self.pool,
            feed_id,
            status.as_str(),
            result.etag.as_deref(),
            result.last_modified.as_deref(),
        )
        .await;
        let _ = store::update_adaptive_backoff(&self.pool, feed_id, true).await;

        if let Some(published) = newest_published {
            let _ = store::update_feed_published_time(&self.pool, feed_id, published).await;
        }

        let _ = store::log_fetch(
            &self.pool,
            feed_id,
            result.status as i64,
            items_found,
            items_new,
            None,
            duration_ms as i64,
        )
        .await;
        self.metrics
            .record_fetch(feed_id, &host, result.status, duration_ms, items_new as u64, None);

        info!(feed_id, items_found, items_new, duration_ms, "fetch complete");

        if items_found == 0 {
            RunOutcome::NoItems
        } else {
            RunOutcome::Success
        }
    }

    /// Runs the 1h degradation sweep (§4.D `check_and_degrade_feeds`).
    pub async fn run_degradation_sweep(&self) -> u64 {
        store::check_and_degrade_feeds(&self.pool, self.ttl_hours)
            .await
            .unwrap_or(0)
    }

    /// Runs the 24h maintenance sweep: vacuum/analyze, prune old logs,
    /// demote `is_new`.
    pub async fn run_maintenance_sweep(&self) {
        if let Err(err) = store::vacuum_and_analyze(&self.pool).await {
            warn!(error = %err, "maintenance vacuum/analyze failed");
        }
        match store::prune_fetch_logs(&self.pool, 30).await {
            Ok(n) if n > 0 => info!(rows = n, "pruned old fetch log rows"),
            Err(err) => warn!(error = %err, "failed to prune fetch logs"),
            _ => {}
        }
        match store::mark_old_items_as_read(&self.pool, 1).await {
            Ok(n) if n > 0 => info!(rows = n, "demoted stale items to not-new"),
            Err(err) => warn!(error = %err, "failed to demote stale items"),
            _ => {}
        }
    }
}

fn classify_error(status: u16, error: Option<&str>) -> &'static str {
    FetchError::classify(status, error).tag()
}

#[allow(dead_code)]
fn backoff_sleep_hint(multiplier: f64) -> Duration {
    Duration::from_secs_f64(multiplier)
}
