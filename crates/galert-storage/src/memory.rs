use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use galert_core::{
    Alert, AlertId, AlertOwner, AlertTrackingRow, Dataset, DatasetChange, DatasetId,
    EmailFrequency, NewDataset, NewObservation, NewSpecies, Observation, Species, SpeciesId,
    StableId, UserId,
};
use tokio::sync::Mutex;

use crate::{
    AlertSyncSession, ExpiryCounts, IdentityRow, LockScope, MatchCounts, MatchPredicate,
    ObservationStore, ReferenceSnapshot, ReplaceSession, RunLease, StoreError, UnseenDigest,
    UnseenSample,
};

/// Alert definition as created by the (external) account layer.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub user_id: UserId,
    pub name: String,
    pub species_filter: BTreeSet<SpeciesId>,
    pub dataset_filter: BTreeSet<DatasetId>,
    pub email_frequency: EmailFrequency,
    pub auto_mark_seen_after_days: Option<u32>,
    pub last_email_sent_at: Option<DateTime<Utc>>,
}

impl NewAlert {
    pub fn new(user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            species_filter: BTreeSet::new(),
            dataset_filter: BTreeSet::new(),
            email_frequency: EmailFrequency::default(),
            auto_mark_seen_after_days: Some(galert_core::DEFAULT_AUTO_MARK_SEEN_AFTER_DAYS),
            last_email_sent_at: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Dimensions {
    species: BTreeMap<SpeciesId, Species>,
    datasets: BTreeMap<DatasetId, Dataset>,
    next_species_id: SpeciesId,
    next_dataset_id: DatasetId,
}

#[derive(Debug, Default)]
struct MemoryState {
    dims: Dimensions,
    observations: Vec<Observation>,
    users: BTreeMap<UserId, (String, Option<String>)>,
    alerts: BTreeMap<AlertId, Alert>,
    tracking: BTreeMap<AlertId, BTreeMap<StableId, AlertTrackingRow>>,
    next_user_id: UserId,
    next_alert_id: AlertId,
}

impl MemoryState {
    fn observation_ids(&self) -> BTreeSet<StableId> {
        self.observations.iter().map(|o| o.stable_id).collect()
    }
}

/// In-process [`ObservationStore`] with the same transactional shape as the
/// Postgres one: replace and per-alert sessions stage their writes and
/// publish them on commit only.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    import_lock: Arc<Mutex<()>>,
    sync_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, username: &str, email: Option<&str>) -> UserId {
        let mut state = self.state.lock().await;
        state.next_user_id += 1;
        let id = state.next_user_id;
        state
            .users
            .insert(id, (username.to_string(), email.map(ToString::to_string)));
        id
    }

    pub async fn insert_alert(&self, new: NewAlert) -> Result<Alert, StoreError> {
        let mut state = self.state.lock().await;
        let (username, email) = state
            .users
            .get(&new.user_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "user",
                id: new.user_id,
            })?;
        state.next_alert_id += 1;
        let alert = Alert {
            id: state.next_alert_id,
            owner: AlertOwner {
                user_id: new.user_id,
                username,
                email,
            },
            name: new.name,
            species_filter: new.species_filter,
            dataset_filter: new.dataset_filter,
            email_frequency: new.email_frequency,
            auto_mark_seen_after_days: new.auto_mark_seen_after_days,
            unseen_count: 0,
            last_email_sent_at: new.last_email_sent_at,
        };
        state.alerts.insert(alert.id, alert.clone());
        Ok(alert)
    }

    pub async fn delete_alert(&self, id: AlertId) -> bool {
        let mut state = self.state.lock().await;
        state.tracking.remove(&id);
        state.alerts.remove(&id).is_some()
    }

    pub async fn alert(&self, id: AlertId) -> Option<Alert> {
        self.state.lock().await.alerts.get(&id).cloned()
    }

    pub async fn observations(&self) -> Vec<Observation> {
        self.state.lock().await.observations.clone()
    }

    pub async fn tracking_rows(&self, alert_id: AlertId) -> Vec<AlertTrackingRow> {
        self.state
            .lock()
            .await
            .tracking
            .get(&alert_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn species_by_key(&self, gbif_taxon_key: i64) -> Option<Species> {
        self.state
            .lock()
            .await
            .dims
            .species
            .values()
            .find(|s| s.gbif_taxon_key == gbif_taxon_key)
            .cloned()
    }

    pub async fn dataset_by_key(&self, key: &str) -> Option<Dataset> {
        self.state
            .lock()
            .await
            .dims
            .datasets
            .values()
            .find(|d| d.key() == key)
            .cloned()
    }

    /// Overwrites a stored identifier, simulating a storage-side drift.
    pub async fn corrupt_stable_id(&self, observation_id: i64, value: StableId) -> bool {
        let mut state = self.state.lock().await;
        match state.observations.iter_mut().find(|o| o.id == observation_id) {
            Some(obs) => {
                obs.stable_id = value;
                true
            }
            None => false,
        }
    }
}

fn add_species(dims: &mut Dimensions, new: &[NewSpecies]) -> Vec<Species> {
    let mut out = Vec::with_capacity(new.len());
    for candidate in new {
        let existing = dims
            .species
            .values()
            .find(|s| s.gbif_taxon_key == candidate.gbif_taxon_key)
            .cloned();
        let species = match existing {
            Some(species) => species,
            None => {
                dims.next_species_id += 1;
                let species = Species {
                    id: dims.next_species_id,
                    gbif_taxon_key: candidate.gbif_taxon_key,
                    scientific_name: candidate.scientific_name.clone(),
                    vernacular_name: candidate.vernacular_name.clone(),
                };
                dims.species.insert(species.id, species.clone());
                species
            }
        };
        out.push(species);
    }
    out
}

fn add_datasets(dims: &mut Dimensions, new: &[NewDataset]) -> Vec<Dataset> {
    let mut out = Vec::with_capacity(new.len());
    for candidate in new {
        let existing = dims
            .datasets
            .values()
            .find(|d| d.key() == candidate.gbif_dataset_key)
            .cloned();
        let dataset = match existing {
            Some(dataset) => dataset,
            None => {
                dims.next_dataset_id += 1;
                let dataset = Dataset::new(
                    dims.next_dataset_id,
                    candidate.gbif_dataset_key.clone(),
                    candidate.name.clone(),
                );
                dims.datasets.insert(dataset.id(), dataset.clone());
                dataset
            }
        };
        out.push(dataset);
    }
    out
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn try_lock(&self, scope: LockScope) -> Result<Option<RunLease>, StoreError> {
        let lock = match scope {
            LockScope::Import => self.import_lock.clone(),
            LockScope::Sync => self.sync_lock.clone(),
        };
        Ok(lock
            .try_lock_owned()
            .ok()
            .map(|guard| RunLease::new(scope, guard)))
    }

    async fn load_reference_data(&self) -> Result<ReferenceSnapshot, StoreError> {
        let state = self.state.lock().await;
        Ok(ReferenceSnapshot {
            species: state.dims.species.values().cloned().collect(),
            datasets: state.dims.datasets.values().cloned().collect(),
        })
    }

    async fn begin_replace(&self) -> Result<Box<dyn ReplaceSession>, StoreError> {
        let dims = self.state.lock().await.dims.clone();
        Ok(Box::new(MemoryReplaceSession {
            state: self.state.clone(),
            dims,
            observations: Vec::new(),
        }))
    }

    async fn observation_count(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.observations.len() as i64)
    }

    async fn scan_identities(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<IdentityRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .observations
            .iter()
            .filter(|o| o.id > after_id)
            .take(limit.max(0) as usize)
            .map(|o| IdentityRow {
                id: o.id,
                source_dataset_key: o.fields.source_dataset_key.clone(),
                occurrence_id: o.fields.occurrence_id.clone(),
                stable_id: o.stable_id,
            })
            .collect())
    }

    async fn cleanup_stale_tracking(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let current = state.observation_ids();
        let mut removed = 0u64;
        for rows in state.tracking.values_mut() {
            let before = rows.len();
            rows.retain(|stable_id, _| current.contains(stable_id));
            removed += (before - rows.len()) as u64;
        }
        Ok(removed)
    }

    async fn list_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        Ok(self.state.lock().await.alerts.values().cloned().collect())
    }

    async fn match_stable_ids(
        &self,
        predicate: &MatchPredicate,
    ) -> Result<Vec<StableId>, StoreError> {
        let state = self.state.lock().await;
        let ids: BTreeSet<StableId> = state
            .observations
            .iter()
            .filter(|o| predicate.matches(o.fields.species_id, o.fields.source_dataset_id))
            .map(|o| o.stable_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn tracked_stable_ids(&self, alert_id: AlertId) -> Result<Vec<StableId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tracking
            .get(&alert_id)
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn begin_alert_sync(
        &self,
        alert_id: AlertId,
    ) -> Result<Box<dyn AlertSyncSession>, StoreError> {
        let state = self.state.lock().await;
        if !state.alerts.contains_key(&alert_id) {
            return Err(StoreError::NotFound {
                entity: "alert",
                id: alert_id,
            });
        }
        let rows = state.tracking.get(&alert_id).cloned().unwrap_or_default();
        Ok(Box::new(MemoryAlertSyncSession {
            state: self.state.clone(),
            alert_id,
            rows,
            unseen_count: None,
        }))
    }

    async fn unseen_since(
        &self,
        alert_id: AlertId,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<UnseenDigest, StoreError> {
        let state = self.state.lock().await;
        let Some(rows) = state.tracking.get(&alert_id) else {
            return Ok(UnseenDigest::default());
        };
        let by_stable_id: HashMap<StableId, &Observation> = state
            .observations
            .iter()
            .map(|o| (o.stable_id, o))
            .collect();

        let mut pending: Vec<&AlertTrackingRow> = rows
            .values()
            .filter(|row| since.map_or(true, |at| row.first_seen_in_alert > at))
            .collect();
        let count = pending.len() as u64;
        pending.sort_by(|a, b| {
            b.observation_date
                .cmp(&a.observation_date)
                .then(a.stable_id.cmp(&b.stable_id))
        });

        let sample = pending
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|row| {
                let obs = by_stable_id.get(&row.stable_id);
                UnseenSample {
                    stable_id: row.stable_id,
                    observation_date: row.observation_date,
                    gbif_id: obs.map(|o| o.fields.gbif_id.clone()),
                    scientific_name: obs.and_then(|o| {
                        state
                            .dims
                            .species
                            .get(&o.fields.species_id)
                            .map(|s| s.scientific_name.clone())
                    }),
                }
            })
            .collect();
        Ok(UnseenDigest { count, sample })
    }

    async fn mark_notified(&self, alert_id: AlertId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let alert = state.alerts.get_mut(&alert_id).ok_or(StoreError::NotFound {
            entity: "alert",
            id: alert_id,
        })?;
        alert.last_email_sent_at = Some(at);
        Ok(())
    }

    async fn update_dataset(
        &self,
        id: DatasetId,
        change: DatasetChange,
    ) -> Result<Dataset, StoreError> {
        let mut state = self.state.lock().await;
        let dataset = state
            .dims
            .datasets
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                entity: "dataset",
                id,
            })?;
        let mut updated = dataset.clone();
        updated.apply(change)?;
        *dataset = updated.clone();
        Ok(updated)
    }
}

struct MemoryReplaceSession {
    state: Arc<Mutex<MemoryState>>,
    dims: Dimensions,
    observations: Vec<Observation>,
}

#[async_trait]
impl ReplaceSession for MemoryReplaceSession {
    async fn create_species(&mut self, new: &[NewSpecies]) -> Result<Vec<Species>, StoreError> {
        Ok(add_species(&mut self.dims, new))
    }

    async fn create_datasets(&mut self, new: &[NewDataset]) -> Result<Vec<Dataset>, StoreError> {
        Ok(add_datasets(&mut self.dims, new))
    }

    async fn insert_observations(&mut self, batch: &[NewObservation]) -> Result<u64, StoreError> {
        for fields in batch {
            let id = self.observations.len() as i64 + 1;
            self.observations.push(Observation {
                id,
                stable_id: fields.stable_id(),
                fields: fields.clone(),
            });
        }
        Ok(batch.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = this.state.lock().await;
        state.dims = this.dims;
        state.observations = this.observations;
        Ok(())
    }
}

struct MemoryAlertSyncSession {
    state: Arc<Mutex<MemoryState>>,
    alert_id: AlertId,
    rows: BTreeMap<StableId, AlertTrackingRow>,
    unseen_count: Option<i64>,
}

#[async_trait]
impl AlertSyncSession for MemoryAlertSyncSession {
    async fn insert_new_matches(
        &mut self,
        predicate: &MatchPredicate,
        first_seen: DateTime<Utc>,
    ) -> Result<MatchCounts, StoreError> {
        let state = self.state.lock().await;
        let mut matched = BTreeSet::new();
        let mut inserted = 0u64;
        for obs in &state.observations {
            if !predicate.matches(obs.fields.species_id, obs.fields.source_dataset_id) {
                continue;
            }
            matched.insert(obs.stable_id);
            match self.rows.get_mut(&obs.stable_id) {
                Some(row) if row.first_seen_in_alert == first_seen => {
                    // Duplicate stable id within this pass: keep the latest date.
                    row.observation_date = row.observation_date.max(obs.fields.date);
                }
                Some(_) => {}
                None => {
                    self.rows.insert(
                        obs.stable_id,
                        AlertTrackingRow {
                            alert_id: self.alert_id,
                            stable_id: obs.stable_id,
                            observation_date: obs.fields.date,
                            first_seen_in_alert: first_seen,
                        },
                    );
                    inserted += 1;
                }
            }
        }
        Ok(MatchCounts {
            matched: matched.len() as u64,
            inserted,
        })
    }

    async fn expire_older_than(
        &mut self,
        cutoff: NaiveDate,
        first_seen: DateTime<Utc>,
    ) -> Result<ExpiryCounts, StoreError> {
        let mut counts = ExpiryCounts::default();
        self.rows.retain(|_, row| {
            if row.observation_date < cutoff {
                counts.total += 1;
                if row.first_seen_in_alert == first_seen {
                    counts.fresh += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(counts)
    }

    async fn recount(&mut self) -> Result<i64, StoreError> {
        let count = self.rows.len() as i64;
        self.unseen_count = Some(count);
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut state = this.state.lock().await;
        let Some(alert) = state.alerts.get_mut(&this.alert_id) else {
            return Err(StoreError::NotFound {
                entity: "alert",
                id: this.alert_id,
            });
        };
        if let Some(count) = this.unseen_count {
            alert.unseen_count = count;
        }
        state.tracking.insert(this.alert_id, this.rows);
        Ok(())
    }
}
