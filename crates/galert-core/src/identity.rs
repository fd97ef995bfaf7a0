use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reimport-invariant observation identifier.
///
/// The value is the MD5 digest of `"{dataset_key}|{occurrence_id}"` (UTF-8,
/// no trimming) read as a UUID. Postgres derives the same bytes with
/// `md5(source_dataset_key || '|' || occurrence_id)::uuid`, so the two paths
/// must never diverge: do not change the layout here without a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(Uuid);

impl StableId {
    pub const SEPARATOR: u8 = b'|';

    pub fn compute(dataset_key: &str, occurrence_id: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(dataset_key.as_bytes());
        hasher.update([Self::SEPARATOR]);
        hasher.update(occurrence_id.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        Self(Uuid::from_bytes(bytes))
    }

    /// Wraps a value read back from storage. Never use this to assign an
    /// identifier to a new observation.
    pub fn from_stored(value: Uuid) -> Self {
        Self(value)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Lowercase 32-char hex, identical to Postgres' `md5()` output.
    pub fn hex(&self) -> String {
        self.0.simple().to_string()
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
