//! Source feed contracts + the JSON item-list feed adapter.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clipcast_core::{ActivityRecord, Member};
use clipcast_storage::{header_map, FetchError, HttpFetcher};
use reqwest::header::HeaderMap;
use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "clipcast-adapters";

/// Headers sent with every feed request unless overridden by configuration.
pub const DEFAULT_FEED_HEADERS: &[(&str, &str)] = &[
    ("accept", "application/json, text/plain, */*"),
    ("accept-language", "en-US,en;q=0.9"),
    ("referer", "https://www.tiktok.com/"),
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("feed fetch failed for member {member}: {source}")]
    Fetch {
        member: String,
        #[source]
        source: FetchError,
    },
    #[error("feed body for member {member} is not valid JSON: {source}")]
    Decode {
        member: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("item {post_id} has out-of-range createTime {create_time}")]
    Timestamp { post_id: String, create_time: i64 },
}

/// An item the feed listed but that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    /// Position in the feed as served.
    pub index: usize,
    pub post_id: Option<String>,
    pub reason: String,
}

/// Records decoded from one feed, oldest first, plus the items that were dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedBatch {
    pub records: Vec<ActivityRecord>,
    pub skipped: Vec<SkippedItem>,
}

/// Produces the activity records a member's source currently lists, oldest first.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_records(&self, member: &Member) -> Result<FeedBatch, AdapterError>;
}

/// Envelope only; items are decoded one by one so a malformed item does not sink the feed.
#[derive(Debug, Clone, Default, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    items: Option<Vec<serde_json::Value>>,
}

/// Items that decoded cleanly, in feed order and paired with their feed position, and the ones
/// that did not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFeed {
    pub items: Vec<(usize, FeedItem)>,
    pub skipped: Vec<SkippedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub video: FeedVideo,
    #[serde(default)]
    pub desc: Option<String>,
    pub author: FeedAuthor,
    #[serde(rename = "createTime", deserialize_with = "unix_seconds")]
    pub create_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedVideo {
    pub id: String,
    #[serde(rename = "downloadAddr")]
    pub download_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedAuthor {
    pub id: String,
}

fn unix_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("createTime {s:?} is not an integer"))),
    }
}

fn raw_post_id(value: &serde_json::Value) -> Option<String> {
    match value.pointer("/video/id")? {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Decodes a feed body. A body without an `items` list is an empty feed; an item that does not
/// match the expected shape is skipped and reported, the rest are kept.
pub fn parse_feed(body: &[u8]) -> Result<DecodedFeed, serde_json::Error> {
    let feed: FeedResponse = serde_json::from_slice(body)?;
    let mut decoded = DecodedFeed::default();
    for (index, value) in feed.items.unwrap_or_default().into_iter().enumerate() {
        let post_id = raw_post_id(&value);
        match serde_json::from_value::<FeedItem>(value) {
            Ok(item) => decoded.items.push((index, item)),
            Err(err) => decoded.skipped.push(SkippedItem {
                index,
                post_id,
                reason: err.to_string(),
            }),
        }
    }
    Ok(decoded)
}

pub fn item_to_record(item: FeedItem) -> Result<ActivityRecord, AdapterError> {
    let posted_at: DateTime<Utc> =
        DateTime::from_timestamp(item.create_time, 0).ok_or_else(|| AdapterError::Timestamp {
            post_id: item.video.id.clone(),
            create_time: item.create_time,
        })?;
    Ok(ActivityRecord {
        post_id: item.video.id,
        video_url: item.video.download_addr,
        description: item.desc,
        author_id: item.author.id,
        posted_at,
    })
}

/// Maps feed items to records and flips newest-first feed order into oldest-first. Items whose
/// timestamp is out of range join the decode skips instead of failing the batch.
pub fn transform_items(feed: DecodedFeed) -> FeedBatch {
    let DecodedFeed { items, mut skipped } = feed;
    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items {
        let post_id = item.video.id.clone();
        match item_to_record(item) {
            Ok(record) => records.push(record),
            Err(err) => skipped.push(SkippedItem {
                index,
                post_id: Some(post_id),
                reason: err.to_string(),
            }),
        }
    }
    records.reverse();
    FeedBatch { records, skipped }
}

pub fn load_feed_fixture(path: impl AsRef<Path>) -> anyhow::Result<DecodedFeed> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_feed(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn feed_headers(overrides: Option<&[(String, String)]>) -> Result<HeaderMap, FetchError> {
    match overrides {
        Some(headers) => header_map(headers),
        None => header_map(
            &DEFAULT_FEED_HEADERS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>(),
        ),
    }
}

/// Fetches `GET {member.url}` and decodes the item list.
#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    http: Arc<HttpFetcher>,
    headers: HeaderMap,
}

impl JsonFeedAdapter {
    pub fn new(http: Arc<HttpFetcher>, headers: HeaderMap) -> Self {
        Self { http, headers }
    }
}

#[async_trait]
impl FeedSource for JsonFeedAdapter {
    async fn fetch_records(&self, member: &Member) -> Result<FeedBatch, AdapterError> {
        let response = self
            .http
            .fetch_bytes(&member.user_id, &member.url, &self.headers)
            .await
            .map_err(|source| AdapterError::Fetch {
                member: member.user_id.clone(),
                source,
            })?;
        let decoded = parse_feed(&response.body).map_err(|source| AdapterError::Decode {
            member: member.user_id.clone(),
            source,
        })?;
        let batch = transform_items(decoded);
        for item in &batch.skipped {
            warn!(
                member = %member.user_id,
                index = item.index,
                post_id = item.post_id.as_deref().unwrap_or("?"),
                reason = %item.reason,
                "skipping malformed feed item"
            );
        }
        debug!(
            member = %member.user_id,
            records = batch.records.len(),
            skipped = batch.skipped.len(),
            "feed decoded"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/feeds")
            .join(name)
    }

    #[test]
    fn transform_maps_source_fields_and_reverses_order() {
        let feed = load_feed_fixture(fixture("sample_feed.json")).unwrap();
        let batch = transform_items(feed);

        assert!(batch.skipped.is_empty());
        let ids: Vec<_> = batch.records.iter().map(|r| r.post_id.as_str()).collect();
        assert_eq!(
            ids,
            [
                "7301000000000000001",
                "7301000000000000002",
                "7301000000000000003"
            ]
        );

        let newest = &batch.records[2];
        assert_eq!(newest.video_url, "https://media.example.test/v/3.mp4");
        assert_eq!(newest.author_id, "6800000000000000001");
        assert_eq!(
            newest.description.as_deref(),
            Some("Sunset session #vibes #beach")
        );
        assert_eq!(newest.posted_at.timestamp(), 1_700_000_300);
    }

    #[test]
    fn string_create_time_and_missing_desc_are_accepted() {
        let records = transform_items(load_feed_fixture(fixture("sample_feed.json")).unwrap())
            .records;
        assert_eq!(records[0].description, None);
        assert_eq!(records[1].description.as_deref(), Some(""));
        assert_eq!(records[1].posted_at.timestamp(), 1_700_000_200);
    }

    #[test]
    fn missing_items_is_an_empty_feed() {
        assert!(load_feed_fixture(fixture("empty_feed.json"))
            .unwrap()
            .items
            .is_empty());
        assert_eq!(
            parse_feed(br#"{"items": null}"#).unwrap(),
            DecodedFeed::default()
        );
    }

    #[test]
    fn body_that_is_not_json_fails_the_whole_feed() {
        assert!(parse_feed(b"<html>rate limited</html>").is_err());
    }

    #[test]
    fn malformed_items_are_skipped_and_the_rest_kept() {
        let feed = load_feed_fixture(fixture("mixed_feed.json")).unwrap();
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.skipped.len(), 2);
        assert_eq!(feed.skipped[0].index, 0);
        assert_eq!(feed.skipped[0].post_id.as_deref(), Some("7302000000000000004"));
        assert!(feed.skipped[0].reason.contains("downloadAddr"));
        assert_eq!(feed.skipped[1].index, 2);
        assert!(feed.skipped[1].reason.contains("soon"));

        let batch = transform_items(feed);
        let ids: Vec<_> = batch.records.iter().map(|r| r.post_id.as_str()).collect();
        assert_eq!(ids, ["7302000000000000001", "7302000000000000003"]);
    }

    #[test]
    fn out_of_range_timestamp_is_skipped_not_fatal() {
        let item = |id: &str, create_time: i64| FeedItem {
            video: FeedVideo {
                id: id.into(),
                download_addr: "u".into(),
            },
            desc: None,
            author: FeedAuthor { id: "a".into() },
            create_time,
        };
        assert!(matches!(
            item_to_record(item("9", i64::MAX)),
            Err(AdapterError::Timestamp { .. })
        ));

        let batch = transform_items(DecodedFeed {
            items: vec![(0, item("9", i64::MAX)), (1, item("8", 1_700_000_000))],
            skipped: Vec::new(),
        });
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].post_id, "8");
        assert_eq!(batch.skipped[0].index, 0);
        assert_eq!(batch.skipped[0].post_id.as_deref(), Some("9"));
    }

    #[test]
    fn default_headers_build() {
        let headers = feed_headers(None).unwrap();
        assert_eq!(headers.len(), DEFAULT_FEED_HEADERS.len());
        let custom = feed_headers(Some(&[("x-token".to_string(), "abc".to_string())])).unwrap();
        assert_eq!(custom.get("x-token").unwrap(), "abc");
    }
}
