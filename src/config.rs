use serde::Deserialize;
use std::env;
use tracing::warn;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub global_concurrency: usize,
    pub per_host_rps: f64,
    pub fetch_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub default_interval_secs: i64,
    pub default_ttl_hours: i64,
    pub max_items: i64,
    pub max_feeds: usize,
    pub feeds_yaml_path: String,
    pub contact_url: String,
    pub contact_email: String,
}

impl Settings {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://feeder.db".to_string()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 3000),
            global_concurrency: env_or("GLOBAL_CONCURRENCY", 5),
            per_host_rps: env_or("PER_HOST_RPS", 0.5),
            fetch_timeout_secs: env_or("FETCH_TIMEOUT_SECONDS", 20),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", 4),
            retry_base_ms: env_or("RETRY_BASE_MS", 800),
            retry_max_ms: env_or("RETRY_MAX_MS", 10_000),
            default_interval_secs: env_or("DEFAULT_FETCH_INTERVAL_SECONDS", 600),
            default_ttl_hours: env_or("DEFAULT_TTL_HOURS", 24),
            max_items: env_or("MAX_ITEMS", 1500),
            max_feeds: env_or("MAX_FEEDS", 150),
            feeds_yaml_path: env::var("FEEDS_YAML_PATH").unwrap_or_else(|_| "feeds.yaml".to_string()),
            contact_url: env::var("CONTACT_URL").unwrap_or_else(|_| "https://feeder.1208.pro".to_string()),
            contact_email: env::var("CONTACT_EMAIL").unwrap_or_else(|_| "pablo@pablomurad.com".to_string()),
        }
    }

    /// `Feeder/<year> (+<url>; contato: <email>)`, per the outbound wire
    /// contract — lets the feed host identify and contact the operator
    /// instead of a bare crate/version string.
    pub fn user_agent(&self) -> String {
        use chrono::Datelike;
        format!(
            "Feeder/{} (+{}; contato: {})",
            chrono::Utc::now().year(),
            self.contact_url,
            self.contact_email
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    pub interval_seconds: Option<i64>,
}

/// Load the feed list from `feeds_yaml_path`, falling back to the
/// `FEEDS_YAML` inline env var if the file is absent. Truncates to
/// `max_feeds`, logging a warning when it does.
pub fn load_feeds(settings: &Settings) -> Vec<FeedConfig> {
    let raw = std::fs::read_to_string(&settings.feeds_yaml_path)
        .ok()
        .or_else(|| env::var("FEEDS_YAML").ok());

    let Some(raw) = raw else {
        warn!(path = %settings.feeds_yaml_path, "no feeds source found; starting with an empty feed list");
        return Vec::new();
    };

    let feeds: Vec<FeedConfig> = match serde_yaml::from_str(&raw) {
        Ok(feeds) => feeds,
        Err(err) => {
            warn!(error = %err, "failed to parse feeds.yaml; starting with an empty feed list");
            return Vec::new();
        }
    };

    if feeds.len() > settings.max_feeds {
        warn!(
            configured = feeds.len(),
            max_feeds = settings.max_feeds,
            "feed list exceeds max_feeds, truncating"
        );
        feeds.into_iter().take(settings.max_feeds).collect()
    } else {
        feeds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_feed_list_from_yaml() {
        let yaml = "- name: Example\n  url: https://example.com/feed\n  interval_seconds: 300\n- name: Other\n  url: https://other.com/feed\n";
        let feeds: Vec<FeedConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].interval_seconds, Some(300));
        assert_eq!(feeds[1].interval_seconds, None);
    }

    #[test]
    fn truncates_to_max_feeds() {
        let settings = Settings {
            database_url: String::new(),
            host: String::new(),
            port: 0,
            global_concurrency: 1,
            per_host_rps: 1.0,
            fetch_timeout_secs: 1,
            retry_max_attempts: 1,
            retry_base_ms: 1,
            retry_max_ms: 1,
            default_interval_secs: 1,
            default_ttl_hours: 1,
            max_items: 1,
            max_feeds: 1,
            feeds_yaml_path: "/nonexistent/path/feeds.yaml".to_string(),
            contact_url: "https://example.com".to_string(),
            contact_email: "test@example.com".to_string(),
        };
        std::env::set_var(
            "FEEDS_YAML",
            "- name: A\n  url: https://a.com/feed\n- name: B\n  url: https://b.com/feed\n",
        );
        let feeds = load_feeds(&settings);
        assert_eq!(feeds.len(), 1);
        std::env::remove_var("FEEDS_YAML");
    }

    #[test]
    fn user_agent_carries_contact_info() {
        let settings = Settings {
            database_url: String::new(),
            host: String::new(),
            port: 0,
            global_concurrency: 1,
            per_host_rps: 1.0,
            fetch_timeout_secs: 1,
            retry_max_attempts: 1,
            retry_base_ms: 1,
            retry_max_ms: 1,
            default_interval_secs: 1,
            default_ttl_hours: 1,
            max_items: 1,
            max_feeds: 1,
            feeds_yaml_path: String::new(),
            contact_url: "https://feeder.1208.pro".to_string(),
            contact_email: "pablo@pablomurad.com".to_string(),
        };
        let ua = settings.user_agent();
        assert!(ua.starts_with("Feeder/"));
        assert!(ua.contains("(+https://feeder.1208.pro; contato: pablo@pablomurad.com)"));
    }
}
