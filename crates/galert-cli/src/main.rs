use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use galert_sync::{build_scheduler, AppConfig, Pipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "galert")]
#[command(about = "Observation import and alert sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replace the observation set with the content of an archive.
    Import {
        archive: PathBuf,
    },
    /// Refresh every alert's unseen observations.
    Sync {
        /// Hand eligible alerts to the notification dispatcher afterwards.
        #[arg(long)]
        notify: bool,
    },
    Migrate,
    /// Recompute stored stable ids and report any drift.
    Verify,
    /// Run import (when configured) and sync on the configured cron.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command.unwrap_or(Commands::Sync { notify: false }) {
        Commands::Import { archive } => {
            let pipeline = Pipeline::connect(config).await?;
            let summary = pipeline.import(&archive).await?;
            println!(
                "import complete: run_id={} loaded={} skipped={} batches={} new_species={} new_datasets={} elapsed={:.1}s rows_per_sec={:.0} sha256={}",
                summary.run_id,
                summary.loaded,
                summary.skipped,
                summary.batches,
                summary.new_species,
                summary.new_datasets,
                summary.elapsed_secs,
                summary.rows_per_sec,
                summary.content_sha256
            );
            for (reason, count) in &summary.skip_reasons {
                println!("  skipped {reason}: {count}");
            }
        }
        Commands::Sync { notify } => {
            let pipeline = Pipeline::connect(config).await?;
            let report = pipeline.sync(notify).await?;
            let sync = &report.sync;
            println!(
                "sync complete: run_id={} alerts={} synced={} failed={} cleaned={} matched={} inserted={} expired={}",
                sync.run_id,
                sync.alerts_total,
                sync.alerts_synced,
                sync.failed_alerts.len(),
                sync.cleaned,
                sync.matched,
                sync.inserted,
                sync.expired
            );
            for failure in &sync.failed_alerts {
                println!(
                    "  failed alert {} ({}): {}",
                    failure.alert_id, failure.alert_name, failure.error
                );
            }
            if let Some(notifications) = &report.notifications {
                println!(
                    "notifications: dispatcher={} eligible={} sent={} not_due={} failed={}",
                    notifications.dispatcher,
                    notifications.eligible,
                    notifications.sent,
                    notifications.not_due,
                    notifications.failed
                );
            }
        }
        Commands::Migrate => {
            galert_sync::migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Verify => {
            let pipeline = Pipeline::connect(config).await?;
            let audit = pipeline.verify().await?;
            println!(
                "verify complete: checked={} mismatched={}",
                audit.checked, audit.mismatched
            );
            for mismatch in &audit.mismatches {
                println!(
                    "  observation {} ({}|{}): stored={} expected={}",
                    mismatch.observation_id,
                    mismatch.source_dataset_key,
                    mismatch.occurrence_id,
                    mismatch.stored,
                    mismatch.expected
                );
            }
            if !audit.is_clean() {
                bail!(
                    "{} stored stable ids disagree with their recomputed value",
                    audit.mismatched
                );
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Pipeline::connect(config).await?);
            let cron = pipeline.config().scheduler_cron.clone();
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; waiting for ctrl-c");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
