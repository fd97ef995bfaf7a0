//! Archive ingestion: streams an occurrence dump, resolves species and
//! datasets through a preloaded cache, and replaces the observation set in
//! fixed-size batches.

pub mod archive;
pub mod cache;
pub mod loader;
pub mod row;
pub mod verify;

pub use archive::{ArchiveError, ColumnIndex, StreamStats, OCCURRENCE_MEMBER};
pub use cache::ReferenceCache;
pub use loader::{
    BulkLoader, ImportError, ImportFailure, ImportSummary, LoaderConfig, DEFAULT_BATCH_SIZE,
};
pub use row::{parse_row, ParsedRow, SkipReason, SkippedRow};
pub use verify::{verify_stable_ids, IdentityAudit, IdentityMismatch, DEFAULT_VERIFY_PAGE};
