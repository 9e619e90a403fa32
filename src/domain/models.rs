use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Outcome of the most recent fetch attempt for a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Pending,
    Success,
    NotModified,
    NoItems,
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Pending => "pending",
            FetchStatus::Success => "success",
            FetchStatus::NotModified => "not_modified",
            FetchStatus::NoItems => "no_items",
            FetchStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for FetchStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "success" => FetchStatus::Success,
            "not_modified" => FetchStatus::NotModified,
            "no_items" => FetchStatus::NoItems,
            "error" => FetchStatus::Error,
            _ => FetchStatus::Pending,
        })
    }
}

/// A subscribed feed and its polling health.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub interval_seconds: i64,
    pub enabled: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetch_status: String,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub is_fetching: bool,
    pub consecutive_errors: i64,
    pub backoff_multiplier: f64,
    pub last_published_time: Option<DateTime<Utc>>,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

impl Feed {
    pub fn status(&self) -> FetchStatus {
        self.last_fetch_status.parse().unwrap_or(FetchStatus::Pending)
    }

    /// `interval_seconds · backoff_multiplier`, for diagnostics and for
    /// rescheduling the ticker after a terminal transition (§9 open question).
    pub fn effective_interval_seconds(&self) -> f64 {
        self.interval_seconds as f64 * self.backoff_multiplier
    }
}

/// A normalized article belonging to a feed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Item {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub guid: String,
    pub thumbnail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_new: bool,
}

/// An item as produced by the parser, before it has a database identity.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub feed_id: i64,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub guid: String,
    pub thumbnail: Option<String>,
}

/// An append-only record of a single fetch attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FetchLog {
    pub id: i64,
    pub feed_id: i64,
    pub status_code: i64,
    pub items_found: i64,
    pub items_new: i64,
    pub error_message: Option<String>,
    pub fetch_time: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Sort order for `get_items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSort {
    #[default]
    Recent,
    Oldest,
    Title,
    Feed,
}
