use std::collections::HashMap;

use galert_core::{DatasetId, NewDataset, NewSpecies, SpeciesId};
use galert_storage::{ReferenceSnapshot, ReplaceSession, StoreError};

use crate::row::ParsedRow;

/// In-memory view of the species and dataset tables for one import. Keys not
/// seen before are queued and created in bulk before the batch that needs
/// them is written.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    species: HashMap<i64, SpeciesId>,
    datasets: HashMap<String, DatasetId>,
    pending_species: HashMap<i64, NewSpecies>,
    pending_datasets: HashMap<String, NewDataset>,
    created_species: u64,
    created_datasets: u64,
}

impl ReferenceCache {
    pub fn from_snapshot(snapshot: &ReferenceSnapshot) -> Self {
        Self {
            species: snapshot
                .species
                .iter()
                .map(|s| (s.gbif_taxon_key, s.id))
                .collect(),
            datasets: snapshot
                .datasets
                .iter()
                .map(|d| (d.key().to_string(), d.id()))
                .collect(),
            ..Self::default()
        }
    }

    /// Queues the row's species and dataset when they are unknown. The first
    /// row naming a key decides the stored names.
    pub fn observe(&mut self, row: &ParsedRow) {
        if !self.species.contains_key(&row.species_key) {
            self.pending_species
                .entry(row.species_key)
                .or_insert_with(|| {
                    NewSpecies::from_raw(row.species_key, &row.species_name, &row.vernacular_name)
                });
        }
        if !self.datasets.contains_key(&row.dataset_key) {
            self.pending_datasets
                .entry(row.dataset_key.clone())
                .or_insert_with(|| NewDataset::from_raw(&row.dataset_key, &row.dataset_name));
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_species.is_empty() || !self.pending_datasets.is_empty()
    }

    pub async fn flush(&mut self, session: &mut dyn ReplaceSession) -> Result<(), StoreError> {
        if !self.pending_species.is_empty() {
            let mut new: Vec<NewSpecies> = self.pending_species.drain().map(|(_, s)| s).collect();
            new.sort_by_key(|s| s.gbif_taxon_key);
            let rows = session.create_species(&new).await?;
            for species in rows {
                if self.species.insert(species.gbif_taxon_key, species.id).is_none() {
                    self.created_species += 1;
                }
            }
        }
        if !self.pending_datasets.is_empty() {
            let mut new: Vec<NewDataset> =
                self.pending_datasets.drain().map(|(_, d)| d).collect();
            new.sort_by(|a, b| a.gbif_dataset_key.cmp(&b.gbif_dataset_key));
            let rows = session.create_datasets(&new).await?;
            for dataset in rows {
                if self
                    .datasets
                    .insert(dataset.key().to_string(), dataset.id())
                    .is_none()
                {
                    self.created_datasets += 1;
                }
            }
        }
        Ok(())
    }

    pub fn resolve(&self, row: &ParsedRow) -> Option<(SpeciesId, DatasetId)> {
        Some((
            *self.species.get(&row.species_key)?,
            *self.datasets.get(&row.dataset_key)?,
        ))
    }

    pub fn created_species(&self) -> u64 {
        self.created_species
    }

    pub fn created_datasets(&self) -> u64 {
        self.created_datasets
    }
}
