use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use galert_ingest::{verify_stable_ids, BulkLoader, IdentityAudit, ImportSummary, LoaderConfig};
use galert_storage::{ObservationStore, PgStore, ReportWriter};
use serde::Serialize;
use tracing::info;

use crate::config::AppConfig;
use crate::engine::{SyncEngine, SyncOptions, SyncRunSummary};
use crate::notify::{
    Dispatcher, LogDispatcher, NotificationSummary, NotificationTrigger, NotifyOptions,
};
use crate::webhook::{RetryPolicy, WebhookDispatcher};

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    #[serde(flatten)]
    pub sync: SyncRunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationSummary>,
}

/// One configured set of collaborators for import, sync and notification
/// runs. Every run writes its summary under the reports directory.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn ObservationStore>,
    config: AppConfig,
    reports: ReportWriter,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ObservationStore>, config: AppConfig) -> Result<Self> {
        let dispatcher = dispatcher_from_config(&config)?;
        Ok(Self {
            store,
            reports: ReportWriter::new(config.reports_dir.clone()),
            config,
            dispatcher,
        })
    }

    pub async fn connect(config: AppConfig) -> Result<Self> {
        let store = connect_store(&config).await?;
        Self::new(Arc::new(store), config)
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn import(&self, archive: &Path) -> Result<ImportSummary> {
        let loader = BulkLoader::new(
            self.store.clone(),
            LoaderConfig {
                batch_size: self.config.batch_size,
                ..LoaderConfig::default()
            },
        );
        let summary = loader
            .import(archive)
            .await
            .with_context(|| format!("importing {}", archive.display()))?;
        let path = self.reports.write(summary.run_id, "import", &summary).await?;
        info!(report = %path.display(), "import report written");
        Ok(summary)
    }

    pub async fn sync(&self, notify: bool) -> Result<SyncReport> {
        let engine = SyncEngine::new(
            self.store.clone(),
            SyncOptions {
                concurrency: self.config.sync_concurrency,
            },
        );
        let sync = engine.run().await.context("running alert sync")?;

        let notifications = if notify {
            let trigger = NotificationTrigger::new(
                self.store.clone(),
                self.dispatcher.clone(),
                NotifyOptions {
                    sample_size: self.config.notification_sample_size,
                    dispatch_timeout: Duration::from_secs(self.config.dispatch_timeout_secs),
                },
            );
            Some(trigger.notify(&sync, Utc::now()).await)
        } else {
            None
        };

        let report = SyncReport {
            sync,
            notifications,
        };
        let path = self.reports.write(report.sync.run_id, "sync", &report).await?;
        info!(report = %path.display(), "sync report written");
        Ok(report)
    }

    /// Scheduled cycle: import the configured archive when there is one,
    /// then sync and notify.
    pub async fn nightly(&self) -> Result<()> {
        if let Some(archive) = &self.config.schedule_archive {
            self.import(archive).await?;
        }
        self.sync(true).await?;
        Ok(())
    }

    pub async fn verify(&self) -> Result<IdentityAudit> {
        verify_stable_ids(self.store.as_ref(), galert_ingest::DEFAULT_VERIFY_PAGE)
            .await
            .context("verifying stable ids")
    }
}

pub async fn connect_store(config: &AppConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to database")
}

/// Applies pending schema migrations.
pub async fn migrate(config: &AppConfig) -> Result<()> {
    let store = connect_store(config).await?;
    store.migrate().await.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

fn dispatcher_from_config(config: &AppConfig) -> Result<Arc<dyn Dispatcher>> {
    match &config.dispatch_webhook_url {
        Some(url) => {
            let retry = RetryPolicy::default();
            let budget = Duration::from_secs(config.dispatch_timeout_secs);
            Ok(Arc::new(WebhookDispatcher::new(
                url.clone(),
                retry.request_timeout(budget),
                retry,
            )?))
        }
        None => Ok(Arc::new(LogDispatcher)),
    }
}
