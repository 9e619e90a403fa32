use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use feeder::infrastructure::http_client::HttpClient;
use feeder::infrastructure::job_runner::JobRunner;
use feeder::infrastructure::metrics::Metrics;
use feeder::infrastructure::rate_limiter::RateLimiter;
use feeder::infrastructure::store;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn runner(pool: SqlitePool, global_concurrency: usize) -> Arc<JobRunner> {
    Arc::new(JobRunner::new(
        pool,
        Arc::new(RateLimiter::new(global_concurrency, 100.0)),
        Arc::new(HttpClient::new("feeder-test/0.1", Duration::from_secs(5))),
        Arc::new(Metrics::new()),
        24,
        1500,
    ))
}

/// Testable property 1: two concurrent `refresh`-style invocations for the
/// same feed result in exactly one execution; the other is dropped, not
/// queued. Both are observable as 1 `FetchLog` row, not 2.
#[tokio::test]
async fn at_most_one_in_flight_per_feed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)).set_body_string(
            "<rss><channel><item><guid>a</guid><title>T</title></item></channel></rss>",
        ))
        .mount(&server)
        .await;

    let pool = setup_test_db().await;
    let feed = store::add_feed(&pool, "Feed", &format!("{}/feed.xml", server.uri()), 600)
        .await
        .unwrap();

    let runner = runner(pool.clone(), 5);
    let a = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run_once(feed.id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let b = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run_once(feed.id).await })
    };

    let (outcome_a, outcome_b) = tokio::join!(a, b);
    let outcomes = [outcome_a.unwrap(), outcome_b.unwrap()];
    let dropped = outcomes
        .iter()
        .filter(|o| **o == feeder::infrastructure::job_runner::RunOutcome::Dropped)
        .count();
    assert_eq!(dropped, 1, "exactly one of the two concurrent runs must be dropped");

    let logs = store::get_fetch_logs(&pool, Some(feed.id), 10).await.unwrap();
    assert_eq!(logs.len(), 1, "only the winning run appends a FetchLog row");
}

struct CountingResponder {
    in_flight: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

impl Respond for CountingResponder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(80));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_body_string("<rss><channel></channel></rss>")
    }
}

/// Testable property 6: with a global concurrency cap of C, at most C
/// HTTP requests (across distinct hosts/feeds) are in-flight simultaneously.
#[tokio::test]
async fn global_concurrency_cap_bounds_simultaneous_fetches() {
    let server = MockServer::start().await;
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .respond_with(CountingResponder {
            in_flight: in_flight.clone(),
            max_seen: max_seen.clone(),
        })
        .mount(&server)
        .await;

    let pool = setup_test_db().await;
    let mut feed_ids = Vec::new();
    for n in 0..4 {
        let feed = store::add_feed(&pool, "Feed", &format!("{}/feed{n}.xml", server.uri()), 600)
            .await
            .unwrap();
        feed_ids.push(feed.id);
    }

    let runner = runner(pool.clone(), 2);
    let mut handles = Vec::new();
    for feed_id in feed_ids {
        let runner = runner.clone();
        handles.push(tokio::spawn(async move { runner.run_once(feed_id).await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(
        max_seen.load(Ordering::SeqCst) <= 2,
        "global semaphore of 2 must cap concurrent in-flight fetches"
    );
}
