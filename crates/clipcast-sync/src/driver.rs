//! Wires config into components and drives ingestion + publishing.

use std::sync::Arc;

use anyhow::{Context, Result};
use clipcast_adapters::{feed_headers, JsonFeedAdapter};
use clipcast_publisher::{TwitterClient, DEFAULT_TIMEOUT};
use clipcast_storage::{HttpClientConfig, HttpFetcher, HttpMediaFetcher, MediaClientConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::ingest::{IngestSummary, Ingestor};
use crate::publish::{CycleOutcome, Publisher, PublisherConfig};
use crate::store::PgActivityStore;

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<PgActivityStore>,
    http: Arc<HttpFetcher>,
}

impl SyncPipeline {
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = PgActivityStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.feed_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store: Arc::new(store),
            http: Arc::new(http),
        })
    }

    pub async fn migrate(&self) -> Result<()> {
        self.store.migrate().await.context("running migrations")
    }

    pub fn ingestor(&self) -> Result<Ingestor> {
        let headers = feed_headers(self.config.feed_headers.as_deref())
            .context("building feed headers")?;
        let feeds = JsonFeedAdapter::new(self.http.clone(), headers);
        Ok(Ingestor::new(self.store.clone(), Arc::new(feeds)))
    }

    pub fn publisher(&self) -> Result<Publisher> {
        let twitter = TwitterClient::new(self.config.twitter_credentials()?, DEFAULT_TIMEOUT)
            .context("building twitter client")?;
        let media = HttpMediaFetcher::from_config(MediaClientConfig {
            read_timeout: self.config.media_read_timeout,
            user_agent: Some(self.config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Publisher::new(
            self.store.clone(),
            Arc::new(media),
            Arc::new(twitter),
            PublisherConfig {
                scratch_dir: self.config.scratch_dir.clone(),
                publish_interval: self.config.publish_interval,
                settle_delay: self.config.media_settle_delay,
                retry_backoff: self.config.retry_backoff,
            },
        ))
    }

    pub async fn build_scheduler(&self, ingestor: Ingestor) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        sched
            .add(ingest_job(ingestor, &self.config.ingest_cron)?)
            .await
            .context("adding ingest job")?;
        Ok(sched)
    }

    /// Ingests once right away, schedules further ingests, and runs the publisher loop until
    /// `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let ingestor = self.ingestor()?;
        let publisher = Arc::new(self.publisher()?);

        let mut sched = self.build_scheduler(ingestor.clone()).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.config.ingest_cron, "ingest scheduler started");

        let startup_ingest = tokio::spawn(async move {
            if let Err(err) = ingestor.ingest_all().await {
                error!(error = ?err, "startup ingest failed");
            }
        });

        let publisher_task = {
            let publisher = publisher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { publisher.run(shutdown).await })
        };

        shutdown.cancelled().await;
        info!("shutdown requested");

        startup_ingest.abort();
        if let Err(err) = publisher_task.await {
            error!(error = ?err, "publisher task ended abnormally");
        }
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}

/// Cron job running one full ingest per tick. Failures are logged; the schedule keeps going.
pub fn ingest_job(ingestor: Ingestor, cron: &str) -> Result<Job> {
    Job::new_async(cron, move |_uuid, _l| {
        let ingestor = ingestor.clone();
        Box::pin(async move {
            if let Err(err) = ingestor.ingest_all().await {
                error!(error = ?err, "scheduled ingest failed");
            }
        })
    })
    .with_context(|| format!("creating ingest job for cron {cron}"))
}

pub async fn run_from_env() -> Result<()> {
    let pipeline = SyncPipeline::connect(SyncConfig::from_env()?).await?;
    pipeline.migrate().await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal.cancel(),
            Err(err) => error!(error = %err, "listening for ctrl-c failed"),
        }
    });

    pipeline.run(shutdown).await
}

pub async fn ingest_once_from_env() -> Result<IngestSummary> {
    let pipeline = SyncPipeline::connect(SyncConfig::from_env()?).await?;
    pipeline.ingestor()?.ingest_all().await
}

pub async fn publish_once_from_env() -> Result<CycleOutcome> {
    let pipeline = SyncPipeline::connect(SyncConfig::from_env()?).await?;
    Ok(pipeline.publisher()?.run_cycle().await?)
}

pub async fn migrate_from_env() -> Result<()> {
    let pipeline = SyncPipeline::connect(SyncConfig::from_env()?).await?;
    pipeline.migrate().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryActivityStore;
    use async_trait::async_trait;
    use clipcast_adapters::{AdapterError, FeedBatch, FeedSource};
    use clipcast_core::Member;

    struct NoFeeds;

    #[async_trait]
    impl FeedSource for NoFeeds {
        async fn fetch_records(&self, _member: &Member) -> Result<FeedBatch, AdapterError> {
            Ok(FeedBatch::default())
        }
    }

    fn ingestor() -> Ingestor {
        Ingestor::new(Arc::new(MemoryActivityStore::default()), Arc::new(NoFeeds))
    }

    #[test]
    fn ingest_job_accepts_default_cron() {
        assert!(ingest_job(ingestor(), crate::config::DEFAULT_INGEST_CRON).is_ok());
    }

    #[test]
    fn ingest_job_rejects_malformed_cron() {
        let err = ingest_job(ingestor(), "every five minutes").err().unwrap();
        assert!(err.to_string().contains("every five minutes"));
    }
}
