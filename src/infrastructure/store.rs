use crate::domain::models::{Feed, FetchLog, Item, ItemSort, NewItem};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{Error as SqlxError, SqlitePool};

/// Per-feed stats row for `get_feed_stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FeedStats {
    pub feed: Feed,
    pub item_count: i64,
}

/// Upsert a feed by URL. If it already exists and the interval differs,
/// the interval is updated; the row is returned either way.
pub async fn add_feed(
    pool: &SqlitePool,
    name: &str,
    url: &str,
    interval_seconds: i64,
) -> Result<Feed, SqlxError> {
    if let Some(existing) = get_feed_by_url(pool, url).await? {
        if existing.interval_seconds != interval_seconds {
            sqlx::query("UPDATE feed SET interval_seconds = ? WHERE id = ?")
                .bind(interval_seconds)
                .bind(existing.id)
                .execute(pool)
                .await?;
            return get_feed(pool, existing.id).await.map(|f| f.unwrap());
        }
        return Ok(existing);
    }

    sqlx::query_as::<_, Feed>(
        r#"
        INSERT INTO feed (name, url, interval_seconds)
        VALUES (?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(name)
    .bind(url)
    .bind(interval_seconds)
    .fetch_one(pool)
    .await
}

pub async fn get_feed(pool: &SqlitePool, id: i64) -> Result<Option<Feed>, SqlxError> {
    sqlx::query_as::<_, Feed>("SELECT * FROM feed WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_feed_by_url(pool: &SqlitePool, url: &str) -> Result<Option<Feed>, SqlxError> {
    sqlx::query_as::<_, Feed>("SELECT * FROM feed WHERE url = ?")
        .bind(url)
        .fetch_optional(pool)
        .await
}

pub async fn get_feeds(pool: &SqlitePool, enabled_only: bool) -> Result<Vec<Feed>, SqlxError> {
    if enabled_only {
        sqlx::query_as::<_, Feed>("SELECT * FROM feed WHERE enabled = 1 ORDER BY id")
            .fetch_all(pool)
            .await
    } else {
        sqlx::query_as::<_, Feed>("SELECT * FROM feed ORDER BY id")
            .fetch_all(pool)
            .await
    }
}

/// Atomic test-and-set on `is_fetching`. Returns false if already held.
pub async fn acquire_feed_lock(pool: &SqlitePool, id: i64) -> Result<bool, SqlxError> {
    let result = sqlx::query("UPDATE feed SET is_fetching = 1 WHERE id = ? AND is_fetching = 0")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn release_feed_lock(pool: &SqlitePool, id: i64) -> Result<(), SqlxError> {
    sqlx::query("UPDATE feed SET is_fetching = 0 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Update fetch status and bump `last_fetch_time`. An empty validator
/// string means "leave alone" — `None` here plays that role from Rust.
pub async fn update_feed_status(
    pool: &SqlitePool,
    id: i64,
    status: &str,
    etag: Option<&str>,
    last_modified: Option<&str>,
) -> Result<(), SqlxError> {
    sqlx::query(
        r#"
        UPDATE feed
        SET last_fetch_status = ?,
            last_fetch_time = ?,
            etag = COALESCE(?, etag),
            last_modified = COALESCE(?, last_modified)
        WHERE id = ?
        "#,
    )
    .bind(status)
    .bind(Utc::now())
    .bind(etag)
    .bind(last_modified)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// On success: reset error counters. On failure: increment and recompute
/// `backoff_multiplier = min(4.0, 1 + 0.5·consecutive_errors)`.
pub async fn update_adaptive_backoff(
    pool: &SqlitePool,
    id: i64,
    success: bool,
) -> Result<(), SqlxError> {
    if success {
        sqlx::query("UPDATE feed SET consecutive_errors = 0, backoff_multiplier = 1.0 WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
    } else {
        sqlx::query(
            r#"
            UPDATE feed
            SET consecutive_errors = consecutive_errors + 1,
                backoff_multiplier = MIN(4.0, 1.0 + (consecutive_errors + 1) * 0.5)
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Record the newest upstream published time seen, clearing `degraded`.
pub async fn update_feed_published_time(
    pool: &SqlitePool,
    id: i64,
    published: DateTime<Utc>,
) -> Result<(), SqlxError> {
    sqlx::query("UPDATE feed SET last_published_time = ?, degraded = 0 WHERE id = ?")
        .bind(published)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Degrade feeds whose `last_published_time` has fallen behind the TTL.
/// Returns the number of feeds transitioned.
pub async fn check_and_degrade_feeds(pool: &SqlitePool, ttl_hours: i64) -> Result<u64, SqlxError> {
    let cutoff = Utc::now() - ChronoDuration::hours(ttl_hours);
    let result = sqlx::query(
        r#"
        UPDATE feed
        SET degraded = 1
        WHERE degraded = 0
          AND last_published_time IS NOT NULL
          AND last_published_time < ?
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Insert items, deduplicating on `guid`; then enforce the global item cap
/// by evicting the oldest (by `published`, then `created_at`). Runs as a
/// single transaction so a partial failure rolls back the whole batch.
pub async fn add_items(
    pool: &SqlitePool,
    items: &[NewItem],
    max_items: i64,
) -> Result<usize, SqlxError> {
    let mut tx = pool.begin().await?;
    let mut new_count = 0usize;

    for item in items {
        let inserted = sqlx::query(
            r#"
            INSERT INTO item (feed_id, title, link, published, author, summary, guid, thumbnail)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(guid) DO NOTHING
            "#,
        )
        .bind(item.feed_id)
        .bind(&item.title)
        .bind(&item.link)
        .bind(item.published)
        .bind(&item.author)
        .bind(&item.summary)
        .bind(&item.guid)
        .bind(&item.thumbnail)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() > 0 {
            new_count += 1;
        }
    }

    let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM item")
        .fetch_one(&mut *tx)
        .await?;

    if total.0 > max_items {
        let excess = total.0 - max_items;
        sqlx::query(
            r#"
            DELETE FROM item WHERE id IN (
                SELECT id FROM item
                ORDER BY published ASC NULLS FIRST, created_at ASC
                LIMIT ?
            )
            "#,
        )
        .bind(excess)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(new_count)
}

#[allow(clippy::too_many_arguments)]
pub async fn get_items(
    pool: &SqlitePool,
    page: i64,
    limit: i64,
    feed_id: Option<i64>,
    search: Option<&str>,
    sort: ItemSort,
) -> Result<Vec<Item>, SqlxError> {
    let offset = (page.max(1) - 1) * limit;
    let mut query_str = String::from("SELECT item.* FROM item");

    // FTS unavailable or the query isn't valid FTS syntax: fall back to substring match.
    let fts_hits = if let Some(term) = search.filter(|s| !s.trim().is_empty()) {
        sqlx::query_scalar::<_, i64>("SELECT rowid FROM item_fts WHERE item_fts MATCH ?")
            .bind(term)
            .fetch_all(pool)
            .await
            .ok()
    } else {
        None
    };

    let mut conditions = Vec::new();
    if let Some(fid) = feed_id {
        conditions.push(format!("item.feed_id = {fid}"));
    }

    let like_term = search.filter(|s| !s.trim().is_empty() && fts_hits.is_none());

    match (&fts_hits, like_term) {
        (Some(ids), _) => {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let id_list = ids
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            conditions.push(format!("item.id IN ({id_list})"));
        }
        (None, Some(_)) => {
            conditions.push(
                "(item.title LIKE ? OR item.summary LIKE ? OR item.author LIKE ?)".to_string(),
            );
        }
        (None, None) => {}
    }

    if !conditions.is_empty() {
        query_str.push_str(" WHERE ");
        query_str.push_str(&conditions.join(" AND "));
    }

    query_str.push_str(match sort {
        ItemSort::Recent => " ORDER BY item.published DESC, item.created_at DESC",
        ItemSort::Oldest => " ORDER BY item.published ASC, item.created_at ASC",
        ItemSort::Title => " ORDER BY item.title ASC",
        ItemSort::Feed => " ORDER BY item.feed_id ASC, item.published DESC",
    });
    query_str.push_str(" LIMIT ? OFFSET ?");

    let mut query = sqlx::query_as::<_, Item>(&query_str);
    if let Some(term) = like_term {
        let pattern = format!("%{term}%");
        query = query.bind(pattern.clone()).bind(pattern.clone()).bind(pattern);
    }
    query = query.bind(limit).bind(offset);

    query.fetch_all(pool).await
}

pub async fn get_items_count(
    pool: &SqlitePool,
    feed_id: Option<i64>,
    search: Option<&str>,
) -> Result<i64, SqlxError> {
    let mut query_str = String::from("SELECT COUNT(*) FROM item");
    let mut conditions = Vec::new();
    if let Some(fid) = feed_id {
        conditions.push(format!("feed_id = {fid}"));
    }
    let has_search = search.map(|s| !s.trim().is_empty()).unwrap_or(false);
    if has_search {
        conditions
            .push("(title LIKE ? OR summary LIKE ? OR author LIKE ?)".to_string());
    }
    if !conditions.is_empty() {
        query_str.push_str(" WHERE ");
        query_str.push_str(&conditions.join(" AND "));
    }

    let mut query = sqlx::query_scalar::<_, i64>(&query_str);
    if has_search {
        let pattern = format!("%{}%", search.unwrap().trim());
        query = query.bind(pattern.clone()).bind(pattern.clone()).bind(pattern);
    }
    query.fetch_one(pool).await
}

pub async fn get_item(pool: &SqlitePool, id: i64) -> Result<Option<Item>, SqlxError> {
    sqlx::query_as::<_, Item>("SELECT * FROM item WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_feed_stats(pool: &SqlitePool) -> Result<Vec<FeedStats>, SqlxError> {
    let feeds = get_feeds(pool, false).await?;
    let mut stats = Vec::with_capacity(feeds.len());
    for feed in feeds {
        let item_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item WHERE feed_id = ?")
            .bind(feed.id)
            .fetch_one(pool)
            .await?;
        stats.push(FeedStats { feed, item_count });
    }
    Ok(stats)
}

pub async fn log_fetch(
    pool: &SqlitePool,
    feed_id: i64,
    status_code: i64,
    items_found: i64,
    items_new: i64,
    error_message: Option<&str>,
    duration_ms: i64,
) -> Result<(), SqlxError> {
    sqlx::query(
        r#"
        INSERT INTO fetchlog (feed_id, status_code, items_found, items_new, error_message, duration_ms)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(feed_id)
    .bind(status_code)
    .bind(items_found)
    .bind(items_new)
    .bind(error_message)
    .bind(duration_ms)
    .execute(pool)
    .await?;
    Ok(())
}

#[allow(dead_code)]
pub async fn get_fetch_logs(
    pool: &SqlitePool,
    feed_id: Option<i64>,
    limit: i64,
) -> Result<Vec<FetchLog>, SqlxError> {
    if let Some(fid) = feed_id {
        sqlx::query_as::<_, FetchLog>(
            "SELECT * FROM fetchlog WHERE feed_id = ? ORDER BY fetch_time DESC LIMIT ?",
        )
        .bind(fid)
        .bind(limit)
        .fetch_all(pool)
        .await
    } else {
        sqlx::query_as::<_, FetchLog>("SELECT * FROM fetchlog ORDER BY fetch_time DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await
    }
}

/// Flip `is_new` to false for items older than `age_hours`.
pub async fn mark_old_items_as_read(pool: &SqlitePool, age_hours: i64) -> Result<u64, SqlxError> {
    let cutoff = Utc::now() - ChronoDuration::hours(age_hours);
    let result = sqlx::query("UPDATE item SET is_new = 0 WHERE created_at < ? AND is_new = 1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Prune fetch log rows older than the retention window (§3: 30 days).
pub async fn prune_fetch_logs(pool: &SqlitePool, retain_days: i64) -> Result<u64, SqlxError> {
    let cutoff = Utc::now() - ChronoDuration::days(retain_days);
    let result = sqlx::query("DELETE FROM fetchlog WHERE fetch_time < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn vacuum_and_analyze(pool: &SqlitePool) -> Result<(), SqlxError> {
    sqlx::query("VACUUM").execute(pool).await?;
    sqlx::query("ANALYZE").execute(pool).await?;
    Ok(())
}

pub async fn db_size_bytes(pool: &SqlitePool) -> Result<i64, SqlxError> {
    sqlx::query_scalar(
        "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
    )
    .fetch_one(pool)
    .await
}
