use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use galert_core::{Alert, AlertId};
use galert_storage::{ExpiryCounts, LockScope, MatchPredicate, ObservationStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::matcher::{FilterError, FilterMatcher};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("another sync is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
enum AlertError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Alerts processed at the same time.
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertSyncOutcome {
    pub alert_id: AlertId,
    pub alert_name: String,
    pub matched: u64,
    /// Newly unseen after this pass (inserted and not expired right away).
    pub inserted: u64,
    /// Previously unseen rows auto-marked as seen.
    pub expired: u64,
    pub unseen_count: i64,
    #[serde(skip)]
    pub alert: Alert,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertFailure {
    pub alert_id: AlertId,
    pub alert_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Timestamp written on every tracking row created by this run.
    pub first_seen: DateTime<Utc>,
    pub cleaned: u64,
    pub alerts_total: usize,
    pub alerts_synced: usize,
    pub matched: u64,
    pub inserted: u64,
    pub expired: u64,
    pub failed_alerts: Vec<AlertFailure>,
    pub alerts: Vec<AlertSyncOutcome>,
}

/// Refreshes every alert's unseen set against the current observation set.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn ObservationStore>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ObservationStore>, options: SyncOptions) -> Self {
        Self { store, options }
    }

    pub async fn run(&self) -> Result<SyncRunSummary, SyncError> {
        self.run_at(Utc::now()).await
    }

    /// Runs with `now` as the clock for first-seen stamps and expiry cutoffs.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id);
        self.run_inner(run_id, now).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let first_seen = storage_precision(now);

        let _lease = self
            .store
            .try_lock(LockScope::Sync)
            .await?
            .ok_or(SyncError::AlreadyRunning)?;

        let cleaned = self.store.cleanup_stale_tracking().await?;
        info!(cleaned, "stale tracking rows removed");

        let matcher = Arc::new(FilterMatcher::new(&self.store.load_reference_data().await?));
        let alerts = self.store.list_alerts().await?;
        let alerts_total = alerts.len();

        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut pending: HashMap<AlertId, String> = HashMap::with_capacity(alerts_total);
        for alert in alerts {
            let store = self.store.clone();
            let matcher = matcher.clone();
            let permits = permits.clone();
            let alert_id = alert.id;
            pending.insert(alert_id, alert.name.clone());
            let span = info_span!("alert", alert_id);
            tasks.spawn(
                async move {
                    let _permit = permits.acquire_owned().await;
                    let result = sync_alert(store.as_ref(), &matcher, alert, now, first_seen).await;
                    (alert_id, result)
                }
                .instrument(span),
            );
        }

        let mut outcomes = Vec::with_capacity(alerts_total);
        let mut failed_alerts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (alert_id, result) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    warn!(error = %join_err, "alert task did not complete");
                    continue;
                }
            };
            let alert_name = pending.remove(&alert_id).unwrap_or_default();
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(
                        alert_id,
                        error = %err,
                        "alert sync failed; continuing with other alerts"
                    );
                    failed_alerts.push(AlertFailure {
                        alert_id,
                        alert_name,
                        error: err.to_string(),
                    });
                }
            }
        }
        // Tasks that panicked never reported back.
        for (alert_id, alert_name) in pending {
            failed_alerts.push(AlertFailure {
                alert_id,
                alert_name,
                error: "alert task did not complete".to_string(),
            });
        }
        outcomes.sort_by_key(|o| o.alert_id);
        failed_alerts.sort_by_key(|f| f.alert_id);

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            first_seen,
            cleaned,
            alerts_total,
            alerts_synced: outcomes.len(),
            matched: outcomes.iter().map(|o| o.matched).sum(),
            inserted: outcomes.iter().map(|o| o.inserted).sum(),
            expired: outcomes.iter().map(|o| o.expired).sum(),
            failed_alerts,
            alerts: outcomes,
        };
        info!(
            alerts = summary.alerts_total,
            synced = summary.alerts_synced,
            failed = summary.failed_alerts.len(),
            inserted = summary.inserted,
            expired = summary.expired,
            "sync finished"
        );
        Ok(summary)
    }
}

/// Match, insert, expire and recount for one alert inside one session.
async fn sync_alert(
    store: &dyn ObservationStore,
    matcher: &FilterMatcher,
    alert: Alert,
    now: DateTime<Utc>,
    first_seen: DateTime<Utc>,
) -> Result<AlertSyncOutcome, AlertError> {
    let predicate: MatchPredicate = matcher.compile(&alert)?;

    let mut session = store.begin_alert_sync(alert.id).await?;
    let matches = session.insert_new_matches(&predicate, first_seen).await?;
    let expiry = match alert.expiry_cutoff(now) {
        Some(cutoff) => session.expire_older_than(cutoff, first_seen).await?,
        None => ExpiryCounts::default(),
    };
    let unseen_count = session.recount().await?;
    session.commit().await?;

    // Rows inserted and expired in the same pass were never surfaced.
    let outcome = AlertSyncOutcome {
        alert_id: alert.id,
        alert_name: alert.name.clone(),
        matched: matches.matched,
        inserted: matches.inserted.saturating_sub(expiry.fresh),
        expired: expiry.total.saturating_sub(expiry.fresh),
        unseen_count,
        alert,
    };
    info!(
        matched = outcome.matched,
        inserted = outcome.inserted,
        expired = outcome.expired,
        unseen = outcome.unseen_count,
        "alert synced"
    );
    Ok(outcome)
}

/// Postgres keeps microseconds; stamps must compare equal after a round trip.
fn storage_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(at.nanosecond() / 1_000 * 1_000)
        .unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use galert_core::{NewDataset, NewObservation, NewSpecies};
    use galert_storage::{MemoryStore, NewAlert};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn load(store: &MemoryStore, rows: &[(&str, i64, NaiveDate)]) {
        let mut session = store.begin_replace().await.unwrap();
        let species: Vec<NewSpecies> = rows
            .iter()
            .map(|(_, key, _)| NewSpecies::from_raw(*key, "", ""))
            .collect();
        let species = session.create_species(&species).await.unwrap();
        let dataset = session
            .create_datasets(&[NewDataset::from_raw("ds-key-1", "Test Dataset")])
            .await
            .unwrap()
            .remove(0);
        let batch: Vec<NewObservation> = rows
            .iter()
            .zip(&species)
            .map(|((occ, _, date), sp)| NewObservation {
                gbif_id: format!("g-{occ}"),
                occurrence_id: occ.to_string(),
                species_id: sp.id,
                source_dataset_id: dataset.id(),
                source_dataset_key: dataset.key().to_string(),
                location: None,
                date: *date,
                individual_count: None,
                locality: String::new(),
                municipality: String::new(),
                basis_of_record: String::new(),
                recorded_by: String::new(),
                coordinate_uncertainty_in_meters: None,
                references: String::new(),
            })
            .collect();
        session.insert_observations(&batch).await.unwrap();
        session.commit().await.unwrap();
    }

    fn engine(store: &MemoryStore) -> SyncEngine {
        SyncEngine::new(Arc::new(store.clone()), SyncOptions { concurrency: 2 })
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn inserts_then_second_run_is_noop() {
        let store = MemoryStore::new();
        load(&store, &[("occ-1", 1, day(2024, 5, 1)), ("occ-2", 2, day(2024, 5, 2))]).await;
        let user = store.insert_user("testuser", None).await;
        let alert = store.insert_alert(NewAlert::new(user, "Test Alert")).await.unwrap();

        let first = engine(&store).run_at(now()).await.unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.matched, 2);
        assert_eq!(store.alert(alert.id).await.unwrap().unseen_count, 2);

        let later = now() + chrono::Duration::hours(1);
        let second = engine(&store).run_at(later).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.expired, 0);
        assert_eq!(second.cleaned, 0);
        assert_eq!(store.alert(alert.id).await.unwrap().unseen_count, 2);
        let rows = store.tracking_rows(alert.id).await;
        assert!(rows.iter().all(|r| r.first_seen_in_alert == first.first_seen));
    }

    #[tokio::test]
    async fn old_observations_never_count_as_new() {
        let store = MemoryStore::new();
        load(&store, &[("occ-1", 1, day(2020, 1, 1)), ("occ-2", 1, day(2024, 5, 30))]).await;
        let user = store.insert_user("testuser", None).await;
        let alert = store.insert_alert(NewAlert::new(user, "Test Alert")).await.unwrap();

        let first = engine(&store).run_at(now()).await.unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(first.expired, 0);
        assert_eq!(store.tracking_rows(alert.id).await.len(), 1);

        let second = engine(&store).run_at(now()).await.unwrap();
        assert_eq!((second.inserted, second.expired), (0, 0));
    }

    #[tokio::test]
    async fn malformed_filter_fails_only_that_alert() {
        let store = MemoryStore::new();
        load(&store, &[("occ-1", 1, day(2024, 5, 1))]).await;
        let user = store.insert_user("testuser", None).await;
        let good = store.insert_alert(NewAlert::new(user, "Good")).await.unwrap();
        let mut broken = NewAlert::new(user, "Broken");
        broken.species_filter.insert(424_242);
        let broken = store.insert_alert(broken).await.unwrap();

        let summary = engine(&store).run_at(now()).await.unwrap();
        assert_eq!(summary.alerts_total, 2);
        assert_eq!(summary.alerts_synced, 1);
        assert_eq!(summary.failed_alerts.len(), 1);
        assert_eq!(summary.failed_alerts[0].alert_id, broken.id);
        assert_eq!(store.alert(good.id).await.unwrap().unseen_count, 1);
        assert!(store.tracking_rows(broken.id).await.is_empty());
    }

    #[tokio::test]
    async fn disabled_expiry_keeps_old_rows() {
        let store = MemoryStore::new();
        load(&store, &[("occ-1", 1, day(2001, 1, 1))]).await;
        let user = store.insert_user("testuser", None).await;
        let mut new = NewAlert::new(user, "Keep everything");
        new.auto_mark_seen_after_days = None;
        let alert = store.insert_alert(new).await.unwrap();

        let summary = engine(&store).run_at(now()).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.alert(alert.id).await.unwrap().unseen_count, 1);
    }

    #[tokio::test]
    async fn concurrent_sync_is_refused() {
        let store = MemoryStore::new();
        let _held = store.try_lock(LockScope::Sync).await.unwrap().unwrap();
        assert!(matches!(
            engine(&store).run_at(now()).await,
            Err(SyncError::AlreadyRunning)
        ));
    }

    #[test]
    fn first_seen_is_truncated_to_microseconds() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).single().unwrap();
        assert_eq!(storage_precision(at).nanosecond(), 123_456_000);
    }
}
