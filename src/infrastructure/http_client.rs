use std::time::Duration;

use rand::Rng;
use regex::Regex;
use reqwest::{header, Client, StatusCode};
use std::sync::OnceLock;
use thiserror::Error;

/// Classification of a finished `FetchResult`, mirrored from the status code
/// and transport error string. `fetch` itself never returns this — it always
/// resolves to a `FetchResult` — but the job runner classifies every
/// non-success outcome through it for logging and metrics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited (429)")]
    RateLimited,
    #[error("client error ({0})")]
    ClientError(u16),
    #[error("server error ({0})")]
    ServerError(u16),
    #[error("unexpected status {0}")]
    Unknown(u16),
}

impl FetchError {
    pub fn classify(status: u16, error: Option<&str>) -> Self {
        match status {
            0 => {
                if error.map(|e| e.to_lowercase().contains("timed out")).unwrap_or(false) {
                    FetchError::Timeout
                } else {
                    FetchError::Transport(error.unwrap_or("unknown").to_string())
                }
            }
            429 => FetchError::RateLimited,
            400..=499 => FetchError::ClientError(status),
            500..=599 => FetchError::ServerError(status),
            _ => FetchError::Unknown(status),
        }
    }

    /// Short tag used in metrics labels and log fields.
    pub fn tag(&self) -> &'static str {
        match self {
            FetchError::Timeout => "timeout",
            FetchError::Transport(_) => "transport",
            FetchError::RateLimited => "rate_limited",
            FetchError::ClientError(_) => "http_client_error",
            FetchError::ServerError(_) => "http_server_error",
            FetchError::Unknown(_) => "unknown",
        }
    }
}

/// Retry budget, read from `Settings` at construction time (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_ms: 800,
            max_ms: 10_000,
        }
    }
}

/// Outcome of a single `fetch`. `status == 0` marks a transport failure
/// (no response was ever received).
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub retry_after: Option<Duration>,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn transport_error(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            body: Vec::new(),
            etag: None,
            last_modified: None,
            retry_after: None,
            error: Some(message.into()),
        }
    }
}

pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        Self::with_retry_policy(user_agent, timeout, RetryPolicy::default())
    }

    pub fn with_retry_policy(user_agent: &str, timeout: Duration, retry: RetryPolicy) -> Self {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("failed to build http client");
        Self { client, retry }
    }

    /// Fetch `url`, retrying on transport errors, timeouts, and retryable
    /// statuses with exponential backoff + jitter. Never returns an `Err` —
    /// failures surface as a `FetchResult` with `status == 0` or the last
    /// non-retryable HTTP status, so the caller (job runner) never has to
    /// handle an exception path.
    pub async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> FetchResult {
        let mut last_result = FetchResult::transport_error("no attempt made");

        for attempt in 1..=self.retry.max_attempts {
            let mut request = self.client.get(url);
            if let Some(etag) = etag {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    last_result = FetchResult::transport_error(err.to_string());
                    if attempt < self.retry.max_attempts {
                        sleep_backoff(attempt, self.retry).await;
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            let etag_header = response
                .headers()
                .get(header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let last_modified_header = response
                .headers()
                .get(header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .map(String::from);

            if status == StatusCode::NOT_MODIFIED {
                return FetchResult {
                    status: 304,
                    body: Vec::new(),
                    etag: etag_header,
                    last_modified: last_modified_header,
                    retry_after: None,
                    error: None,
                };
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(response.headers());
                let body = response.bytes().await.unwrap_or_default();
                last_result = FetchResult {
                    status: status.as_u16(),
                    body: body.to_vec(),
                    etag: etag_header,
                    last_modified: last_modified_header,
                    retry_after,
                    error: Some("rate limited".to_string()),
                };
                if attempt < self.retry.max_attempts {
                    sleep_backoff(attempt, self.retry).await;
                    continue;
                }
                break;
            }

            if status.is_server_error() {
                let body = response.bytes().await.unwrap_or_default();
                last_result = FetchResult {
                    status: status.as_u16(),
                    body: body.to_vec(),
                    etag: etag_header,
                    last_modified: last_modified_header,
                    retry_after: None,
                    error: Some(error_snippet(&body)),
                };
                if attempt < self.retry.max_attempts {
                    sleep_backoff(attempt, self.retry).await;
                    continue;
                }
                break;
            }

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(err) => {
                    last_result = FetchResult::transport_error(err.to_string());
                    if attempt < self.retry.max_attempts {
                        sleep_backoff(attempt, self.retry).await;
                        continue;
                    }
                    break;
                }
            };

            if status.is_success() {
                return FetchResult {
                    status: status.as_u16(),
                    body: body.to_vec(),
                    etag: etag_header,
                    last_modified: last_modified_header,
                    retry_after: None,
                    error: None,
                };
            }

            // Non-retryable 4xx: surface immediately, no further attempts.
            return FetchResult {
                status: status.as_u16(),
                body: body.to_vec(),
                etag: etag_header,
                last_modified: last_modified_header,
                retry_after: None,
                error: Some(error_snippet(&body)),
            };
        }

        last_result
    }
}

async fn sleep_backoff(attempt: u32, retry: RetryPolicy) {
    let base = retry
        .base_ms
        .saturating_mul(1u64 << (attempt - 1))
        .min(retry.max_ms);
    let jitter = rand::thread_rng().gen_range(0.1..0.3);
    let delay_ms = base as f64 * (1.0 + jitter);
    tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
}

fn error_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(200).collect()
}

fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let target = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = target.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

/// Heuristic sniff for XML feed tags or a JSON Feed payload.
pub fn is_valid_feed_content(bytes: &[u8]) -> bool {
    let text = String::from_utf8_lossy(bytes);
    let head: String = text.chars().take(2048).collect::<String>().to_lowercase();

    if ["<rss", "<feed", "<channel", "<?xml", "<rdf:"]
        .iter()
        .any(|tag| head.contains(tag))
    {
        return true;
    }

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
        return value.get("version").is_some() && value.get("items").is_some();
    }

    false
}

fn feed_link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)<link[^>]+rel=["']alternate["'][^>]+type=["']application/rss\+xml["'][^>]+href=["']([^"']+)["']|<link[^>]+type=["']application/rss\+xml["'][^>]+rel=["']alternate["'][^>]+href=["']([^"']+)["']|<link[^>]+href=["']([^"']+)["'][^>]+rel=["']alternate["'][^>]+type=["']application/rss\+xml["']"#,
        )
        .unwrap()
    })
}

/// Scan an HTML page for an alternate RSS `<link>` tag, in either
/// attribute order.
pub fn detect_feed_in_html(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let captures = feed_link_regex().captures(&text)?;
    captures
        .iter()
        .skip(1)
        .flatten()
        .next()
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new("feeder-test/0.1", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn fetch_returns_body_and_validators_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<rss></rss>")
                    .insert_header("etag", "\"abc\"")
                    .insert_header("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            )
            .mount(&server)
            .await;

        let result = client()
            .fetch(&format!("{}/feed.xml", server.uri()), None, None)
            .await;
        assert!(result.is_success());
        assert_eq!(result.etag.as_deref(), Some("\"abc\""));
        assert_eq!(result.body, b"<rss></rss>");
    }

    #[tokio::test]
    async fn fetch_honors_conditional_headers_and_reports_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .and(header("If-None-Match", "\"abc\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let result = client()
            .fetch(&format!("{}/feed.xml", server.uri()), Some("\"abc\""), None)
            .await;
        assert!(result.is_not_modified());
    }

    #[tokio::test]
    async fn rate_limited_response_surfaces_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let result = client()
            .fetch(&format!("{}/feed.xml", server.uri()), None, None)
            .await;
        assert_eq!(result.status, 429);
        assert_eq!(result.retry_after, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn non_retryable_client_error_returns_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.xml"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .expect(1)
            .mount(&server)
            .await;

        let result = client()
            .fetch(&format!("{}/missing.xml", server.uri()), None, None)
            .await;
        assert_eq!(result.status, 404);
        assert_eq!(result.error.as_deref(), Some("not found"));
    }

    #[test]
    fn sniffs_xml_and_json_feed_content() {
        assert!(is_valid_feed_content(b"<?xml version=\"1.0\"?><rss></rss>"));
        assert!(is_valid_feed_content(
            br#"{"version": "https://jsonfeed.org/version/1", "items": []}"#
        ));
        assert!(!is_valid_feed_content(b"<html><body>hi</body></html>"));
    }

    #[test]
    fn classifies_status_codes_into_stable_tags() {
        assert_eq!(FetchError::classify(0, Some("operation timed out")).tag(), "timeout");
        assert_eq!(FetchError::classify(0, Some("connection reset")).tag(), "transport");
        assert_eq!(FetchError::classify(429, None).tag(), "rate_limited");
        assert_eq!(FetchError::classify(404, None).tag(), "http_client_error");
        assert_eq!(FetchError::classify(503, None).tag(), "http_server_error");
    }

    #[test]
    fn detects_feed_link_in_either_attribute_order() {
        let a = br#"<link rel="alternate" type="application/rss+xml" href="https://example.com/feed">"#;
        let b = br#"<link type="application/rss+xml" rel="alternate" href="https://example.com/feed">"#;
        assert_eq!(
            detect_feed_in_html(a).as_deref(),
            Some("https://example.com/feed")
        );
        assert_eq!(
            detect_feed_in_html(b).as_deref(),
            Some("https://example.com/feed")
        );
    }
}
