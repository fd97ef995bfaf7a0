use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::pipeline::Pipeline;

/// Registers the nightly cycle on `scheduler_cron`. Overlapping triggers are
/// refused by the run locks, not queued.
pub async fn build_scheduler(pipeline: Arc<Pipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().scheduler_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            info!("scheduled run triggered");
            if let Err(err) = pipeline.nightly().await {
                error!(error = %format!("{err:#}"), "scheduled run failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
