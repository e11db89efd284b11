//! Core domain model for clipcast: members, ingested activities and status composition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "clipcast-core";

/// Separator inserted after every `#` so the target platform does not expand hashtags.
pub const HASHTAG_BREAK: char = '.';

/// A content source polled for new posts. Maintained outside clipcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub url: String,
    pub name: String,
}

/// Activity-shaped record produced by ingestion, before it is merged into storage.
///
/// Carries only the columns ingestion owns; `is_published` is never part of an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub post_id: String,
    pub video_url: String,
    pub description: Option<String>,
    pub author_id: String,
    pub posted_at: DateTime<Utc>,
}

/// Persisted activity row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub post_id: String,
    pub video_url: String,
    pub description: Option<String>,
    pub author_id: String,
    pub posted_at: DateTime<Utc>,
    pub is_published: bool,
}

impl Activity {
    pub fn from_record(record: ActivityRecord, is_published: bool) -> Self {
        Self {
            post_id: record.post_id,
            video_url: record.video_url,
            description: record.description,
            author_id: record.author_id,
            posted_at: record.posted_at,
            is_published,
        }
    }
}

/// Oldest unpublished activity joined with its author, as selected by the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingActivity {
    pub post_id: String,
    pub video_url: String,
    pub description: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub member_name: String,
}

impl PendingActivity {
    pub fn status_text(&self) -> String {
        compose_status(&self.member_name, self.description.as_deref())
    }
}

/// Builds `Post from {name}` with `: {description}` appended when the description is
/// non-empty, then breaks every hashtag.
pub fn compose_status(member_name: &str, description: Option<&str>) -> String {
    let mut status = format!("Post from {member_name}");
    if let Some(description) = description.filter(|d| !d.is_empty()) {
        status.push_str(": ");
        status.push_str(description);
    }
    escape_hashtags(&status)
}

pub fn escape_hashtags(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.matches('#').count());
    for ch in text.chars() {
        out.push(ch);
        if ch == '#' {
            out.push(HASHTAG_BREAK);
        }
    }
    out
}
