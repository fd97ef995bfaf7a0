use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use galert_core::{AlertId, AlertOwner, EmailFrequency};
use galert_storage::{ObservationStore, UnseenSample};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::{AlertSyncOutcome, SyncRunSummary};

/// Everything a delivery transport needs to render one alert's notice.
#[derive(Debug, Clone, Serialize)]
pub struct AlertNotification {
    pub run_id: Uuid,
    pub alert_id: AlertId,
    pub alert_name: String,
    pub owner: AlertOwner,
    pub email_frequency: EmailFrequency,
    pub new_unseen: u64,
    pub unseen_count: i64,
    pub sample: Vec<UnseenSample>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("dispatch endpoint answered http {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

/// Hands notifications to the external delivery collaborator.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, notification: &AlertNotification) -> Result<(), DispatchError>;
}

/// Records notifications in the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn dispatch(&self, notification: &AlertNotification) -> Result<(), DispatchError> {
        info!(
            alert_id = notification.alert_id,
            user = %notification.owner.username,
            new_unseen = notification.new_unseen,
            sample = notification.sample.len(),
            "notification ready"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    NotDue,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub alert_id: AlertId,
    pub new_unseen: u64,
    #[serde(flatten)]
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotificationSummary {
    pub dispatcher: String,
    pub eligible: usize,
    pub sent: usize,
    pub not_due: usize,
    pub failed: usize,
    pub deliveries: Vec<Delivery>,
}

#[derive(Debug, Clone)]
pub struct NotifyOptions {
    pub sample_size: usize,
    pub dispatch_timeout: Duration,
}

impl Default for NotifyOptions {
    fn default() -> Self {
        Self {
            sample_size: 10,
            dispatch_timeout: Duration::from_secs(20),
        }
    }
}

/// Decides which synced alerts are due for a notice and forwards them to the
/// dispatcher. Dispatch failures are recorded, never propagated.
#[derive(Clone)]
pub struct NotificationTrigger {
    store: Arc<dyn ObservationStore>,
    dispatcher: Arc<dyn Dispatcher>,
    options: NotifyOptions,
}

impl NotificationTrigger {
    pub fn new(
        store: Arc<dyn ObservationStore>,
        dispatcher: Arc<dyn Dispatcher>,
        options: NotifyOptions,
    ) -> Self {
        Self {
            store,
            dispatcher,
            options,
        }
    }

    pub async fn notify(&self, run: &SyncRunSummary, now: DateTime<Utc>) -> NotificationSummary {
        let span = info_span!("notify", run_id = %run.run_id, dispatcher = self.dispatcher.name());
        self.notify_inner(run, now).instrument(span).await
    }

    async fn notify_inner(&self, run: &SyncRunSummary, now: DateTime<Utc>) -> NotificationSummary {
        let mut summary = NotificationSummary {
            dispatcher: self.dispatcher.name().to_string(),
            ..NotificationSummary::default()
        };

        for outcome in run.alerts.iter().filter(|o| o.inserted > 0) {
            let (status, new_unseen) = if outcome.alert.should_send_email(now) {
                summary.eligible += 1;
                self.deliver(run, outcome, now).await
            } else {
                (DeliveryStatus::NotDue, outcome.inserted)
            };
            match &status {
                DeliveryStatus::Sent => summary.sent += 1,
                DeliveryStatus::NotDue => summary.not_due += 1,
                DeliveryStatus::Failed { error } => {
                    warn!(alert_id = outcome.alert_id, %error, "notification not delivered");
                    summary.failed += 1;
                }
            }
            summary.deliveries.push(Delivery {
                alert_id: outcome.alert_id,
                new_unseen,
                status,
            });
        }

        info!(
            eligible = summary.eligible,
            sent = summary.sent,
            not_due = summary.not_due,
            failed = summary.failed,
            "notifications processed"
        );
        summary
    }

    /// Everything that became unseen since the last notice goes out, not only
    /// this run's rows: runs where the alert was not due still count.
    async fn deliver(
        &self,
        run: &SyncRunSummary,
        outcome: &AlertSyncOutcome,
        now: DateTime<Utc>,
    ) -> (DeliveryStatus, u64) {
        let digest = match self
            .store
            .unseen_since(
                outcome.alert_id,
                outcome.alert.last_email_sent_at,
                self.options.sample_size as i64,
            )
            .await
        {
            Ok(digest) => digest,
            Err(err) => {
                let status = DeliveryStatus::Failed {
                    error: format!("loading unseen digest: {err}"),
                };
                return (status, outcome.inserted);
            }
        };
        let new_unseen = digest.count;

        let notification = AlertNotification {
            run_id: run.run_id,
            alert_id: outcome.alert_id,
            alert_name: outcome.alert_name.clone(),
            owner: outcome.alert.owner.clone(),
            email_frequency: outcome.alert.email_frequency,
            new_unseen,
            unseen_count: outcome.unseen_count,
            sample: digest.sample,
        };

        let dispatched = tokio::time::timeout(
            self.options.dispatch_timeout,
            self.dispatcher.dispatch(&notification),
        )
        .await;
        let status = match dispatched {
            Ok(Ok(())) => match self.store.mark_notified(outcome.alert_id, now).await {
                Ok(()) => DeliveryStatus::Sent,
                Err(err) => DeliveryStatus::Failed {
                    error: format!("dispatched but last-sent not recorded: {err}"),
                },
            },
            Ok(Err(err)) => DeliveryStatus::Failed {
                error: err.to_string(),
            },
            Err(_) => DeliveryStatus::Failed {
                error: format!(
                    "dispatch timed out after {:?}",
                    self.options.dispatch_timeout
                ),
            },
        };
        (status, new_unseen)
    }
}
