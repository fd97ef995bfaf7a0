use galert_core::StableId;
use galert_storage::{IdentityRow, ObservationStore, StoreError};
use serde::Serialize;
use tracing::{info, warn};

pub const DEFAULT_VERIFY_PAGE: i64 = 50_000;

/// Mismatches kept in the audit; the count keeps going past this.
const MAX_REPORTED: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityMismatch {
    pub observation_id: i64,
    pub source_dataset_key: String,
    pub occurrence_id: String,
    pub stored: StableId,
    pub expected: StableId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentityAudit {
    pub checked: u64,
    pub mismatched: u64,
    pub mismatches: Vec<IdentityMismatch>,
}

impl IdentityAudit {
    pub fn is_clean(&self) -> bool {
        self.mismatched == 0
    }

    fn check(&mut self, row: IdentityRow) {
        self.checked += 1;
        let expected = StableId::compute(&row.source_dataset_key, &row.occurrence_id);
        if expected == row.stable_id {
            return;
        }
        self.mismatched += 1;
        warn!(
            observation_id = row.id,
            stored = %row.stable_id,
            expected = %expected,
            "stored stable id disagrees with recomputed value"
        );
        if self.mismatches.len() < MAX_REPORTED {
            self.mismatches.push(IdentityMismatch {
                observation_id: row.id,
                source_dataset_key: row.source_dataset_key,
                occurrence_id: row.occurrence_id,
                stored: row.stable_id,
                expected,
            });
        }
    }
}

/// Recomputes every stored stable id in application code and compares it
/// with the value persisted by the storage engine.
pub async fn verify_stable_ids(
    store: &dyn ObservationStore,
    page_size: i64,
) -> Result<IdentityAudit, StoreError> {
    let page_size = page_size.max(1);
    let mut audit = IdentityAudit::default();
    let mut after_id = 0;
    loop {
        let page = store.scan_identities(after_id, page_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        after_id = last.id;
        let short = (page.len() as i64) < page_size;
        for row in page {
            audit.check(row);
        }
        if short {
            break;
        }
    }
    info!(
        checked = audit.checked,
        mismatched = audit.mismatched,
        "stable id verification finished"
    );
    Ok(audit)
}
