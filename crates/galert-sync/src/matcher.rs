use std::collections::{BTreeSet, HashSet};

use galert_core::{Alert, DatasetId, SpeciesId};
use galert_storage::{MatchPredicate, ReferenceSnapshot};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("species filter references unknown species {0:?}")]
    UnknownSpecies(Vec<SpeciesId>),
    #[error("dataset filter references unknown datasets {0:?}")]
    UnknownDatasets(Vec<DatasetId>),
}

/// Turns an alert's filter sets into a storage-side predicate. An empty set
/// leaves its dimension unrestricted.
#[derive(Debug, Clone, Default)]
pub struct FilterMatcher {
    species: HashSet<SpeciesId>,
    datasets: HashSet<DatasetId>,
}

impl FilterMatcher {
    pub fn new(snapshot: &ReferenceSnapshot) -> Self {
        Self {
            species: snapshot.species.iter().map(|s| s.id).collect(),
            datasets: snapshot.datasets.iter().map(|d| d.id()).collect(),
        }
    }

    pub fn compile(&self, alert: &Alert) -> Result<MatchPredicate, FilterError> {
        let unknown = unknown_members(&alert.species_filter, &self.species);
        if !unknown.is_empty() {
            return Err(FilterError::UnknownSpecies(unknown));
        }
        let unknown = unknown_members(&alert.dataset_filter, &self.datasets);
        if !unknown.is_empty() {
            return Err(FilterError::UnknownDatasets(unknown));
        }
        Ok(MatchPredicate {
            species: dimension(&alert.species_filter),
            datasets: dimension(&alert.dataset_filter),
        })
    }
}

fn dimension(filter: &BTreeSet<i64>) -> Option<Vec<i64>> {
    (!filter.is_empty()).then(|| filter.iter().copied().collect())
}

fn unknown_members(filter: &BTreeSet<i64>, known: &HashSet<i64>) -> Vec<i64> {
    filter.iter().copied().filter(|id| !known.contains(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use galert_core::{AlertOwner, Dataset, EmailFrequency, Species};

    fn snapshot() -> ReferenceSnapshot {
        let species = |id| Species {
            id,
            gbif_taxon_key: 1000 + id,
            scientific_name: format!("Species {id}"),
            vernacular_name: None,
        };
        ReferenceSnapshot {
            species: vec![species(1), species(2), species(3)],
            datasets: vec![Dataset::new(10, "X", "X"), Dataset::new(11, "Z", "Z")],
        }
    }

    fn alert(species: &[i64], datasets: &[i64]) -> Alert {
        Alert {
            id: 1,
            owner: AlertOwner {
                user_id: 1,
                username: "testuser".into(),
                email: None,
            },
            name: "Test Alert".into(),
            species_filter: species.iter().copied().collect(),
            dataset_filter: datasets.iter().copied().collect(),
            email_frequency: EmailFrequency::Daily,
            auto_mark_seen_after_days: Some(365),
            unseen_count: 0,
            last_email_sent_at: None,
        }
    }

    #[test]
    fn empty_filters_are_unrestricted() {
        let predicate = FilterMatcher::new(&snapshot()).compile(&alert(&[], &[])).unwrap();
        assert_eq!(predicate, MatchPredicate::unrestricted());
    }

    #[test]
    fn species_filter_without_dataset_filter() {
        // species A=1, B=2, C=3; datasets X=10, Z=11
        let predicate = FilterMatcher::new(&snapshot())
            .compile(&alert(&[1, 2], &[]))
            .unwrap();
        assert!(predicate.matches(1, 11));
        assert!(!predicate.matches(3, 10));
        assert_eq!(predicate.datasets, None);
    }

    #[test]
    fn both_dimensions_are_anded() {
        let predicate = FilterMatcher::new(&snapshot())
            .compile(&alert(&[1], &[10]))
            .unwrap();
        assert!(predicate.matches(1, 10));
        assert!(!predicate.matches(1, 11));
        assert!(!predicate.matches(2, 10));
    }

    #[test]
    fn unknown_filter_members_are_rejected() {
        let matcher = FilterMatcher::new(&snapshot());
        assert_eq!(
            matcher.compile(&alert(&[1, 99], &[])),
            Err(FilterError::UnknownSpecies(vec![99]))
        );
        assert_eq!(
            matcher.compile(&alert(&[], &[12])),
            Err(FilterError::UnknownDatasets(vec![12]))
        );
    }
}
