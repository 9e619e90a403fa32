use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::domain::models::NewItem;

const MAX_ITEMS_PER_PARSE: usize = 100;

/// Parse raw feed bytes into normalized items, capped at 100 per call and
/// tolerant of individually malformed entries. A bozo parse (or one with
/// zero entries) yields an empty list rather than an error.
pub fn parse_feed(feed_id: i64, raw_bytes: &[u8]) -> Vec<NewItem> {
    let raw = match feed_rs::parser::parse(raw_bytes) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };

    raw.entries
        .into_iter()
        .take(MAX_ITEMS_PER_PARSE)
        .filter_map(|entry| normalize_entry(feed_id, entry))
        .collect()
}

fn normalize_entry(feed_id: i64, entry: feed_rs::model::Entry) -> Option<NewItem> {
    let title = entry
        .title
        .clone()
        .map(|t| t.content)
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "No title".to_string());

    let link = entry.links.first().map(|l| l.href.clone());

    let summary = entry
        .summary
        .clone()
        .map(|s| s.content)
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
        .map(|s| strip_html(&s));

    let author = entry
        .authors
        .first()
        .map(|a| a.name.clone())
        .filter(|n| !n.trim().is_empty());

    let published: Option<DateTime<Utc>> = entry.published.or(entry.updated);

    let thumbnail = extract_thumbnail(&entry);

    let upstream_id = entry.id.trim();
    let guid = if !upstream_id.is_empty() {
        upstream_id.to_string()
    } else {
        compute_guid(feed_id, &title, link.as_deref())
    };

    let (title, summary) = if is_reddit_link(link.as_deref()) {
        (clean_reddit_title(&title), summary.map(|s| clean_reddit_summary(&s)))
    } else {
        (title, summary)
    };

    Some(NewItem {
        feed_id,
        title,
        link,
        published,
        author,
        summary,
        guid,
        thumbnail,
    })
}

/// Stable fallback identity when upstream supplies no `<id>`/`<guid>`.
fn compute_guid(feed_id: i64, title: &str, link: Option<&str>) -> String {
    let mut hasher = DefaultHasher::new();
    feed_id.hash(&mut hasher);
    title.hash(&mut hasher);
    link.unwrap_or("").hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn extract_thumbnail(entry: &feed_rs::model::Entry) -> Option<String> {
    if let Some(media) = entry.media.first() {
        if let Some(thumb) = media.thumbnails.first() {
            return Some(thumb.image.uri.clone());
        }
        if let Some(content) = media.content.first() {
            if let Some(url) = &content.url {
                return Some(url.to_string());
            }
        }
    }

    if let Some(link) = entry
        .links
        .iter()
        .find(|l| l.media_type.as_deref().map(|t| t.starts_with("image/")).unwrap_or(false))
    {
        return Some(link.href.clone());
    }

    let body = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()))?;
    img_src_regex()
        .captures(&body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn is_reddit_link(link: Option<&str>) -> bool {
    link.map(|l| l.contains("reddit.com")).unwrap_or(false)
}

// Unanchored: the `[link] [comments]` marker (or, for summaries, the whole
// "submitted by ... [x] [y]" footer) can lead or trail the text, so it's
// stripped wherever it occurs rather than only at the string's end.
fn reddit_title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s*\[link\]\s*\[comments\]\s*").unwrap())
}

fn reddit_summary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)submitted by.*?\[.*?\]\s*\[.*?\]").unwrap())
}

fn clean_reddit_title(title: &str) -> String {
    reddit_title_regex().replace(title, "").trim().to_string()
}

fn clean_reddit_summary(summary: &str) -> String {
    reddit_summary_regex().replace(summary, "").trim().to_string()
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").unwrap())
}

fn whitespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn img_src_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)<img[^>]+src=["']([^"']+)["']"#).unwrap())
}

/// Strip tags, decode entities, collapse whitespace.
pub fn strip_html(input: &str) -> String {
    let stripped = tag_regex().replace_all(input, " ");
    let decoded = decode_entities(&stripped);
    whitespace_regex().replace_all(&decoded, " ").trim().to_string()
}

fn decode_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let mut entity = String::new();
        let mut consumed = Vec::new();
        while let Some(&next) = chars.peek() {
            if next == ';' || entity.len() > 10 {
                break;
            }
            entity.push(next);
            consumed.push(next);
            chars.next();
        }
        if chars.peek() == Some(&';') {
            chars.next();
            match entity.as_str() {
                "amp" => out.push('&'),
                "lt" => out.push('<'),
                "gt" => out.push('>'),
                "quot" => out.push('"'),
                "apos" | "#39" => out.push('\''),
                "nbsp" => out.push(' '),
                _ if entity.starts_with('#') => {
                    let code = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        entity[1..].parse::<u32>().ok()
                    };
                    if let Some(ch) = code.and_then(char::from_u32) {
                        out.push(ch);
                    }
                }
                _ => {
                    out.push('&');
                    out.push_str(&entity);
                    out.push(';');
                }
            }
        } else {
            out.push('&');
            out.push_str(&entity);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rss(title: &str, link: &str, guid: Option<&str>) -> Vec<u8> {
        let guid_tag = guid
            .map(|g| format!("<guid>{g}</guid>"))
            .unwrap_or_default();
        format!(
            r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
                <title>Test Feed</title>
                <item>
                    <title>{title}</title>
                    <link>{link}</link>
                    {guid_tag}
                    <description>&lt;p&gt;Hello &amp; welcome&lt;/p&gt;</description>
                </item>
            </channel></rss>"#
        )
        .into_bytes()
    }

    #[test]
    fn parses_title_link_and_strips_html_from_summary() {
        let items = parse_feed(1, &sample_rss("Hello", "https://example.com/a", None));
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.title, "Hello");
        assert_eq!(item.link.as_deref(), Some("https://example.com/a"));
        assert_eq!(item.summary.as_deref(), Some("Hello & welcome"));
    }

    #[test]
    fn prefers_upstream_guid_over_hash() {
        let items = parse_feed(1, &sample_rss("Hello", "https://example.com/a", Some("upstream-1")));
        assert_eq!(items[0].guid, "upstream-1");
    }

    #[test]
    fn falls_back_to_stable_hash_guid_when_absent() {
        let bytes = sample_rss("Hello", "https://example.com/a", None);
        let a = parse_feed(1, &bytes);
        let b = parse_feed(1, &bytes);
        assert_eq!(a[0].guid, b[0].guid);
        assert!(!a[0].guid.is_empty());
    }

    #[test]
    fn bozo_feed_yields_empty_list() {
        let items = parse_feed(1, b"not a feed at all");
        assert!(items.is_empty());
    }

    #[test]
    fn caps_entries_at_one_hundred() {
        let mut body = String::from("<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>T</title>");
        for n in 0..150 {
            body.push_str(&format!("<item><title>Item {n}</title><guid>g{n}</guid></item>"));
        }
        body.push_str("</channel></rss>");
        let items = parse_feed(1, body.as_bytes());
        assert_eq!(items.len(), 100);
    }

    #[test]
    fn reddit_entries_are_cleaned() {
        let bytes = sample_rss(
            "Some post title [link] [comments]",
            "https://www.reddit.com/r/rust/comments/abc",
            Some("reddit-1"),
        );
        let items = parse_feed(1, &bytes);
        assert_eq!(items[0].title, "Some post title");
    }

    #[test]
    fn reddit_marker_is_stripped_even_when_leading() {
        let bytes = sample_rss(
            "[link] [comments] Hi",
            "https://www.reddit.com/r/rust/comments/abc",
            Some("reddit-2"),
        );
        let items = parse_feed(1, &bytes);
        assert_eq!(items[0].title, "Hi");
    }

    #[test]
    fn strip_html_collapses_whitespace_and_decodes_entities() {
        let out = strip_html("<p>Hello   &amp;  <b>world</b></p>\n\n");
        assert_eq!(out, "Hello & world");
    }
}
