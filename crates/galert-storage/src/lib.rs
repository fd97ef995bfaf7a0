//! Storage boundary for the ingestion and alert-sync core, with a Postgres
//! (PostGIS) implementation and an in-memory one.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use galert_core::{
    Alert, AlertId, CoreError, Dataset, DatasetChange, DatasetId, NewDataset, NewObservation,
    NewSpecies, Species, SpeciesId, StableId,
};
use serde::Serialize;
use thiserror::Error;

mod memory;
mod postgres;
mod reports;

pub use memory::{MemoryStore, NewAlert};
pub use postgres::PgStore;
pub use reports::ReportWriter;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error(transparent)]
    Domain(#[from] CoreError),
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

/// Work that must never run twice at once against one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    Import,
    Sync,
}

impl LockScope {
    pub(crate) fn advisory_key(self) -> i64 {
        match self {
            Self::Import => 0x6761_6c72_7400_0001,
            Self::Sync => 0x6761_6c72_7400_0002,
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import => f.write_str("import"),
            Self::Sync => f.write_str("sync"),
        }
    }
}

/// Held for the duration of a run; the lock is released on drop.
pub struct RunLease {
    scope: LockScope,
    _hold: Box<dyn Any + Send>,
}

impl RunLease {
    pub(crate) fn new(scope: LockScope, hold: impl Any + Send) -> Self {
        Self {
            scope,
            _hold: Box::new(hold),
        }
    }
}

impl fmt::Debug for RunLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLease").field("scope", &self.scope).finish()
    }
}

/// Full preload of the dimension tables.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSnapshot {
    pub species: Vec<Species>,
    pub datasets: Vec<Dataset>,
}

/// Set-membership filter evaluated by the storage engine. `None` means the
/// dimension is unrestricted; dimensions are ANDed, members ORed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchPredicate {
    pub species: Option<Vec<SpeciesId>>,
    pub datasets: Option<Vec<DatasetId>>,
}

impl MatchPredicate {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn matches(&self, species_id: SpeciesId, dataset_id: DatasetId) -> bool {
        let species_ok = self
            .species
            .as_ref()
            .map_or(true, |ids| ids.contains(&species_id));
        let dataset_ok = self
            .datasets
            .as_ref()
            .map_or(true, |ids| ids.contains(&dataset_id));
        species_ok && dataset_ok
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchCounts {
    /// Distinct stable ids currently matching the predicate.
    pub matched: u64,
    /// Of those, ids that were not tracked yet and got a new row.
    pub inserted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryCounts {
    /// Rows deleted in this pass.
    pub total: u64,
    /// Of those, rows inserted earlier in the same pass.
    pub fresh: u64,
}

/// A newly unseen item, enough for a dispatcher to render a line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnseenSample {
    pub stable_id: StableId,
    pub observation_date: NaiveDate,
    pub gbif_id: Option<String>,
    pub scientific_name: Option<String>,
}

/// Rows that became unseen since the alert's last notice.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnseenDigest {
    pub count: u64,
    /// Newest observations first, at most the requested limit.
    pub sample: Vec<UnseenSample>,
}

/// Stored identity fields of one observation, for integrity checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRow {
    pub id: i64,
    pub source_dataset_key: String,
    pub occurrence_id: String,
    pub stable_id: StableId,
}

/// A full replacement of the observation set. The truncation and every batch
/// become visible together on [`ReplaceSession::commit`]; dropping the session
/// without committing leaves the previous observation set in place.
#[async_trait]
pub trait ReplaceSession: Send {
    /// Inserts species that do not exist yet and returns the rows for every
    /// requested taxon key.
    async fn create_species(&mut self, new: &[NewSpecies]) -> Result<Vec<Species>, StoreError>;

    async fn create_datasets(&mut self, new: &[NewDataset]) -> Result<Vec<Dataset>, StoreError>;

    async fn insert_observations(&mut self, batch: &[NewObservation]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Per-alert unit of work. Either every step applied through the session
/// becomes visible on commit, or none does.
#[async_trait]
pub trait AlertSyncSession: Send {
    /// Tracks every matching stable id not tracked yet, stamped `first_seen`.
    async fn insert_new_matches(
        &mut self,
        predicate: &MatchPredicate,
        first_seen: DateTime<Utc>,
    ) -> Result<MatchCounts, StoreError>;

    /// Deletes tracking rows dated before `cutoff`; rows stamped
    /// `first_seen` are counted as fresh.
    async fn expire_older_than(
        &mut self,
        cutoff: NaiveDate,
        first_seen: DateTime<Utc>,
    ) -> Result<ExpiryCounts, StoreError>;

    /// Stores and returns the alert's current tracking-row count.
    async fn recount(&mut self) -> Result<i64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Non-blocking; `None` when another run holds the scope.
    async fn try_lock(&self, scope: LockScope) -> Result<Option<RunLease>, StoreError>;

    async fn load_reference_data(&self) -> Result<ReferenceSnapshot, StoreError>;

    async fn begin_replace(&self) -> Result<Box<dyn ReplaceSession>, StoreError>;

    async fn observation_count(&self) -> Result<i64, StoreError>;

    /// Pages through stored identities in surrogate-key order.
    async fn scan_identities(&self, after_id: i64, limit: i64)
        -> Result<Vec<IdentityRow>, StoreError>;

    /// Deletes tracking rows, across all alerts, whose stable id is absent
    /// from the observation set.
    async fn cleanup_stale_tracking(&self) -> Result<u64, StoreError>;

    async fn list_alerts(&self) -> Result<Vec<Alert>, StoreError>;

    async fn match_stable_ids(
        &self,
        predicate: &MatchPredicate,
    ) -> Result<Vec<StableId>, StoreError>;

    async fn tracked_stable_ids(&self, alert_id: AlertId) -> Result<Vec<StableId>, StoreError>;

    async fn begin_alert_sync(&self, alert_id: AlertId)
        -> Result<Box<dyn AlertSyncSession>, StoreError>;

    /// Tracking rows first seen after `since`, or every row when `since` is
    /// `None` (no notice sent yet).
    async fn unseen_since(
        &self,
        alert_id: AlertId,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<UnseenDigest, StoreError>;

    async fn mark_notified(&self, alert_id: AlertId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Applies a change through the dataset write guard.
    async fn update_dataset(
        &self,
        id: DatasetId,
        change: DatasetChange,
    ) -> Result<Dataset, StoreError>;
}
