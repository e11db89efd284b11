//! Ingestion merge: pull every member's feed and upsert its items.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clipcast_adapters::FeedSource;
use clipcast_core::Member;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::store::ActivityStore;

#[derive(Debug, Clone, Serialize)]
pub struct MemberFailure {
    pub user_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub members: usize,
    pub fetched_items: usize,
    /// Feed items dropped because they could not be decoded.
    pub skipped_items: usize,
    pub upserted: usize,
    pub failed_upserts: usize,
    pub failed_members: Vec<MemberFailure>,
}

#[derive(Debug, Default)]
struct MemberOutcome {
    fetched: usize,
    skipped: usize,
    upserted: usize,
    failed_upserts: usize,
    failure: Option<MemberFailure>,
}

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn ActivityStore>,
    feeds: Arc<dyn FeedSource>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn ActivityStore>, feeds: Arc<dyn FeedSource>) -> Self {
        Self { store, feeds }
    }

    /// Ingests every member concurrently. A member whose feed or upserts fail is logged and
    /// recorded in the summary; only failing to load the member list is an error.
    pub async fn ingest_all(&self) -> Result<IngestSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let members = self
            .store
            .list_members()
            .await
            .context("loading members")?;

        let span = info_span!("ingest", %run_id, members = members.len());
        let outcomes = join_all(members.iter().map(|m| self.ingest_member(m)))
            .instrument(span)
            .await;

        let mut summary = IngestSummary {
            run_id,
            started_at,
            finished_at: started_at,
            members: members.len(),
            fetched_items: 0,
            skipped_items: 0,
            upserted: 0,
            failed_upserts: 0,
            failed_members: Vec::new(),
        };
        for outcome in outcomes {
            summary.fetched_items += outcome.fetched;
            summary.skipped_items += outcome.skipped;
            summary.upserted += outcome.upserted;
            summary.failed_upserts += outcome.failed_upserts;
            summary.failed_members.extend(outcome.failure);
        }
        summary.finished_at = Utc::now();

        info!(
            %run_id,
            members = summary.members,
            fetched = summary.fetched_items,
            skipped = summary.skipped_items,
            upserted = summary.upserted,
            failed_members = summary.failed_members.len(),
            failed_upserts = summary.failed_upserts,
            "ingest complete"
        );
        Ok(summary)
    }

    async fn ingest_member(&self, member: &Member) -> MemberOutcome {
        let batch = match self.feeds.fetch_records(member).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(member = %member.user_id, error = %err, "feed fetch failed, skipping member");
                return MemberOutcome {
                    failure: Some(MemberFailure {
                        user_id: member.user_id.clone(),
                        error: err.to_string(),
                    }),
                    ..Default::default()
                };
            }
        };

        let records = batch.records;

        // Records arrive oldest first; upserts start in that order.
        let results = join_all(records.iter().map(|r| self.store.upsert_activity(r))).await;

        let mut outcome = MemberOutcome {
            fetched: records.len(),
            skipped: batch.skipped.len(),
            ..Default::default()
        };
        for (record, result) in records.iter().zip(results) {
            match result {
                Ok(_) => outcome.upserted += 1,
                Err(err) => {
                    warn!(member = %member.user_id, post_id = %record.post_id, error = %err, "upsert failed");
                    outcome.failed_upserts += 1;
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryActivityStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use clipcast_adapters::{AdapterError, FeedBatch};
    use clipcast_storage::FetchError;
    use clipcast_core::ActivityRecord;
    use std::collections::HashMap;

    struct StaticFeeds {
        feeds: HashMap<String, Vec<ActivityRecord>>,
    }

    #[async_trait]
    impl FeedSource for StaticFeeds {
        async fn fetch_records(
            &self,
            member: &Member,
        ) -> Result<FeedBatch, AdapterError> {
            let records = self
                .feeds
                .get(&member.user_id)
                .cloned()
                .ok_or_else(|| AdapterError::Fetch {
                    member: member.user_id.clone(),
                    source: FetchError::HttpStatus {
                        status: 503,
                        url: member.url.clone(),
                    },
                })?;
            Ok(FeedBatch {
                records,
                skipped: Vec::new(),
            })
        }
    }

    fn member(id: &str) -> Member {
        Member {
            user_id: id.to_string(),
            url: format!("https://feeds.example.test/{id}"),
            name: format!("Member {id}"),
        }
    }

    fn record(post_id: &str, author: &str, ts: i64, desc: &str) -> ActivityRecord {
        ActivityRecord {
            post_id: post_id.to_string(),
            video_url: format!("https://media.example.test/{post_id}.mp4"),
            description: Some(desc.to_string()),
            author_id: author.to_string(),
            posted_at: Utc.timestamp_opt(ts, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn failing_member_does_not_block_others() {
        let store = Arc::new(MemoryActivityStore::with_members(vec![
            member("a"),
            member("broken"),
            member("c"),
        ]));
        let feeds = StaticFeeds {
            feeds: HashMap::from([
                ("a".to_string(), vec![record("a1", "a", 1, "x"), record("a2", "a", 2, "y")]),
                ("c".to_string(), vec![record("c1", "c", 3, "z")]),
            ]),
        };
        let ingestor = Ingestor::new(store.clone(), Arc::new(feeds));

        let summary = ingestor.ingest_all().await.unwrap();

        assert_eq!(summary.members, 3);
        assert_eq!(summary.upserted, 3);
        assert_eq!(summary.failed_members.len(), 1);
        assert_eq!(summary.failed_members[0].user_id, "broken");
        assert!(store.activity("a1").is_some());
        assert!(store.activity("c1").is_some());
    }

    #[tokio::test]
    async fn repeated_ingest_merges_instead_of_duplicating() {
        let store = Arc::new(MemoryActivityStore::with_members(vec![member("a")]));
        let first = Ingestor::new(
            store.clone(),
            Arc::new(StaticFeeds {
                feeds: HashMap::from([("a".to_string(), vec![record("a1", "a", 1, "old")])]),
            }),
        );
        first.ingest_all().await.unwrap();

        let second = Ingestor::new(
            store.clone(),
            Arc::new(StaticFeeds {
                feeds: HashMap::from([("a".to_string(), vec![record("a1", "a", 1, "new")])]),
            }),
        );
        let summary = second.ingest_all().await.unwrap();

        assert_eq!(summary.upserted, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.activity("a1").unwrap().description.as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn no_members_is_an_empty_run() {
        let store = Arc::new(MemoryActivityStore::default());
        let ingestor = Ingestor::new(
            store,
            Arc::new(StaticFeeds {
                feeds: HashMap::new(),
            }),
        );
        let summary = ingestor.ingest_all().await.unwrap();
        assert_eq!(summary.members, 0);
        assert_eq!(summary.fetched_items, 0);
        assert!(summary.failed_members.is_empty());
    }

    struct PartlyMalformedFeed;

    #[async_trait]
    impl FeedSource for PartlyMalformedFeed {
        async fn fetch_records(&self, member: &Member) -> Result<FeedBatch, AdapterError> {
            Ok(FeedBatch {
                records: vec![record("ok1", &member.user_id, 1, "kept")],
                skipped: vec![clipcast_adapters::SkippedItem {
                    index: 0,
                    post_id: Some("bad1".to_string()),
                    reason: "missing field `downloadAddr`".to_string(),
                }],
            })
        }
    }

    #[tokio::test]
    async fn skipped_items_are_counted_and_valid_ones_stored() {
        let store = Arc::new(MemoryActivityStore::with_members(vec![member("a")]));
        let ingestor = Ingestor::new(store.clone(), Arc::new(PartlyMalformedFeed));

        let summary = ingestor.ingest_all().await.unwrap();

        assert_eq!(summary.skipped_items, 1);
        assert_eq!(summary.upserted, 1);
        assert!(summary.failed_members.is_empty());
        assert!(store.activity("ok1").is_some());
        assert!(store.activity("bad1").is_none());
    }
}
