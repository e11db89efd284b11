//! Publisher loop: drain one pending activity per cycle, oldest first.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clipcast_publisher::{PublishTarget, MEDIA_SETTLE_DELAY};
use clipcast_storage::{BackoffPolicy, MediaFetcher, SCRATCH_MEDIA_FILE};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::DEFAULT_PUBLISH_INTERVAL;
use crate::store::ActivityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Selecting,
    Downloading,
    Uploading,
    Posting,
    Marking,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Selecting => "selecting",
            CycleState::Downloading => "downloading",
            CycleState::Uploading => "uploading",
            CycleState::Posting => "posting",
            CycleState::Marking => "marking",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("publish cycle failed while {state}: {source}")]
pub struct CycleError {
    pub state: CycleState,
    #[source]
    pub source: anyhow::Error,
}

impl CycleError {
    fn new(state: CycleState, err: impl Into<anyhow::Error>) -> Self {
        Self {
            state,
            source: err.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending.
    Idle,
    Published { post_id: String, status_id: String },
    /// A previously posted activity was marked without posting again.
    Reconciled { post_id: String },
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub scratch_dir: PathBuf,
    /// Pause after a completed cycle, measured from its end.
    pub publish_interval: Duration,
    pub settle_delay: Duration,
    /// Backoff on the error path. `None` retries immediately.
    pub retry_backoff: Option<BackoffPolicy>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("tmp"),
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            settle_delay: MEDIA_SETTLE_DELAY,
            retry_backoff: None,
        }
    }
}

impl PublisherConfig {
    pub fn scratch_path(&self) -> PathBuf {
        self.scratch_dir.join(SCRATCH_MEDIA_FILE)
    }
}

pub struct Publisher {
    store: Arc<dyn ActivityStore>,
    media: Arc<dyn MediaFetcher>,
    target: Arc<dyn PublishTarget>,
    config: PublisherConfig,
    /// Posted on the platform but not yet marked in the store.
    unmarked: Mutex<Option<String>>,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn ActivityStore>,
        media: Arc<dyn MediaFetcher>,
        target: Arc<dyn PublishTarget>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            media,
            target,
            config,
            unmarked: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// One pass through select, download, upload, post and mark.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let mut unmarked = self.unmarked.lock().await;
        if let Some(post_id) = unmarked.clone() {
            self.store
                .mark_published(&post_id)
                .await
                .map_err(|e| CycleError::new(CycleState::Marking, e))?;
            *unmarked = None;
            info!(post_id = %post_id, "marked previously posted activity");
            return Ok(CycleOutcome::Reconciled { post_id });
        }

        let Some(activity) = self
            .store
            .next_pending()
            .await
            .map_err(|e| CycleError::new(CycleState::Selecting, e))?
        else {
            debug!("no pending activity");
            return Ok(CycleOutcome::Idle);
        };
        info!(post_id = %activity.post_id, member = %activity.member_name, "publishing activity");

        let scratch = self.config.scratch_path();
        self.media
            .download(&activity.video_url, &scratch)
            .await
            .map_err(|e| CycleError::new(CycleState::Downloading, e))?;

        let handle = self
            .target
            .upload_media(&scratch)
            .await
            .map_err(|e| CycleError::new(CycleState::Uploading, e))?;
        tokio::time::sleep(self.config.settle_delay).await;

        let status = activity.status_text();
        let posted = self
            .target
            .post_status(&status, std::slice::from_ref(&handle))
            .await
            .map_err(|e| CycleError::new(CycleState::Posting, e))?;

        if let Err(err) = self.store.mark_published(&activity.post_id).await {
            *unmarked = Some(activity.post_id.clone());
            return Err(CycleError::new(CycleState::Marking, err));
        }

        info!(post_id = %activity.post_id, status_id = %posted.id, media = %handle, "activity published");
        Ok(CycleOutcome::Published {
            post_id: activity.post_id,
            status_id: posted.id,
        })
    }

    /// Wait before the next cycle. `consecutive_failures` counts the failed cycles in a row,
    /// including this one.
    pub fn delay_after(
        &self,
        result: &Result<CycleOutcome, CycleError>,
        consecutive_failures: usize,
    ) -> Duration {
        match result {
            Ok(_) => self.config.publish_interval,
            Err(_) => self
                .config
                .retry_backoff
                .map(|policy| policy.delay_for_attempt(consecutive_failures.saturating_sub(1)))
                .unwrap_or(Duration::ZERO),
        }
    }

    /// Runs cycles back to back until `shutdown` fires. A cycle in progress is always
    /// finished; cancellation is only observed between cycles.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.publish_interval.as_secs(),
            "publisher loop starting"
        );
        let mut consecutive_failures = 0usize;
        let mut cycle = 0u64;

        while !shutdown.is_cancelled() {
            cycle += 1;
            let result = self
                .run_cycle()
                .instrument(info_span!("publish_cycle", cycle))
                .await;

            match &result {
                Ok(_) => consecutive_failures = 0,
                Err(err) => {
                    consecutive_failures += 1;
                    error!(error = ?err, state = %err.state, consecutive_failures, "publish cycle failed");
                }
            }

            let delay = self.delay_after(&result, consecutive_failures);
            if delay.is_zero() {
                // Let other tasks run between immediate retries.
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.unmarked.lock().await.is_some() {
            warn!("publisher stopped with a posted activity still unmarked");
        }
        info!("publisher loop stopped");
    }
}
