//! Ingestion, publishing and scheduling for the clipcast republisher.

pub mod config;
pub mod driver;
pub mod ingest;
pub mod publish;
pub mod store;

pub use config::SyncConfig;
pub use driver::{
    ingest_once_from_env, migrate_from_env, publish_once_from_env, run_from_env, SyncPipeline,
};
pub use ingest::{IngestSummary, Ingestor, MemberFailure};
pub use publish::{CycleError, CycleOutcome, CycleState, Publisher, PublisherConfig};
pub use store::{ActivityStore, PgActivityStore, StoreError};

pub const CRATE_NAME: &str = "clipcast-sync";
