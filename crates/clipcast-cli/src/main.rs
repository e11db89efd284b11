use anyhow::Result;
use clap::{Parser, Subcommand};
use clipcast_sync::CycleOutcome;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,clipcast=debug,sqlx=warn";

#[derive(Debug, Parser)]
#[command(name = "clipcast")]
#[command(about = "Republish member video feeds to a social account")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate, then ingest on a schedule and publish until Ctrl-C.
    Run,
    /// Ingest every member's feed once.
    Ingest,
    /// Run a single publish cycle.
    PublishOnce,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);
    info!(?command, version = env!("CARGO_PKG_VERSION"), "clipcast starting");

    match command {
        Commands::Run => clipcast_sync::run_from_env().await?,
        Commands::Ingest => {
            let summary = clipcast_sync::ingest_once_from_env().await?;
            println!(
                "ingest complete: run_id={} members={} fetched={} skipped={} upserted={} failed_members={}",
                summary.run_id,
                summary.members,
                summary.fetched_items,
                summary.skipped_items,
                summary.upserted,
                summary.failed_members.len()
            );
        }
        Commands::PublishOnce => match clipcast_sync::publish_once_from_env().await? {
            CycleOutcome::Idle => println!("nothing pending"),
            CycleOutcome::Published { post_id, status_id } => {
                println!("published {post_id} as status {status_id}")
            }
            CycleOutcome::Reconciled { post_id } => println!("marked {post_id} as published"),
        },
        Commands::Migrate => {
            clipcast_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
