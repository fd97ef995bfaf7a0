use std::collections::BTreeMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use galert_core::NewObservation;
use galert_storage::{LockScope, ObservationStore, ReplaceSession, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::archive::{stream_archive, ArchiveError, StreamStats};
use crate::cache::ReferenceCache;
use crate::row::{columns, parse_row, ParsedRow, SkipReason, SkippedRow};

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Parsed chunks buffered between the reader thread and the writer.
    pub channel_depth: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            channel_depth: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportFailure {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("archive reader task failed: {0}")]
    Reader(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("another import is already running")]
    AlreadyRunning,
    /// The replace session was rolled back; the previous observation set is
    /// still the visible one.
    #[error("import aborted after {loaded} loaded and {skipped} skipped rows")]
    Aborted {
        loaded: u64,
        skipped: u64,
        #[source]
        cause: ImportFailure,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub archive: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub data_rows: u64,
    pub loaded: u64,
    pub skipped: u64,
    pub skip_reasons: BTreeMap<SkipReason, u64>,
    pub batches: u64,
    /// Rows in the biggest insert; never above the configured batch size.
    pub largest_batch: u64,
    pub new_species: u64,
    pub new_datasets: u64,
    pub elapsed_secs: f64,
    pub rows_per_sec: f64,
    pub content_sha256: String,
    pub bytes_read: u64,
}

type Chunk = Vec<Result<ParsedRow, SkippedRow>>;

#[derive(Debug, Default)]
struct Progress {
    loaded: u64,
    skipped: u64,
    batches: u64,
    largest_batch: u64,
    skip_reasons: BTreeMap<SkipReason, u64>,
}

impl Progress {
    fn skip(&mut self, row: &SkippedRow) {
        debug!(gbif_id = %row.gbif_id, reason = %row.reason, "skipping row");
        self.skipped += 1;
        *self.skip_reasons.entry(row.reason).or_default() += 1;
    }

    fn abort(&self, cause: impl Into<ImportFailure>) -> ImportError {
        ImportError::Aborted {
            loaded: self.loaded,
            skipped: self.skipped,
            cause: cause.into(),
        }
    }
}

/// Replaces the whole observation set with the content of one archive.
#[derive(Clone)]
pub struct BulkLoader {
    store: Arc<dyn ObservationStore>,
    config: LoaderConfig,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn ObservationStore>, config: LoaderConfig) -> Self {
        Self { store, config }
    }

    pub async fn import(&self, path: &Path) -> Result<ImportSummary, ImportError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import", %run_id, archive = %path.display());
        self.import_inner(run_id, path).instrument(span).await
    }

    async fn import_inner(&self, run_id: Uuid, path: &Path) -> Result<ImportSummary, ImportError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let mut progress = Progress::default();

        let _lease = self
            .store
            .try_lock(LockScope::Import)
            .await
            .map_err(|err| progress.abort(err))?
            .ok_or(ImportError::AlreadyRunning)?;

        let snapshot = self
            .store
            .load_reference_data()
            .await
            .map_err(|err| progress.abort(err))?;
        let mut cache = ReferenceCache::from_snapshot(&snapshot);
        info!(
            species = snapshot.species.len(),
            datasets = snapshot.datasets.len(),
            "reference data preloaded"
        );

        let mut session = self
            .store
            .begin_replace()
            .await
            .map_err(|err| progress.abort(err))?;

        let (tx, mut rx) = mpsc::channel::<Chunk>(self.config.channel_depth.max(1));
        let reader_path = path.to_path_buf();
        let reader = tokio::task::spawn_blocking(move || read_chunks(&reader_path, batch_size, tx));

        let mut pending: Vec<ParsedRow> = Vec::with_capacity(batch_size);
        while let Some(chunk) = rx.recv().await {
            for outcome in chunk {
                match outcome {
                    Ok(row) => {
                        cache.observe(&row);
                        pending.push(row);
                    }
                    Err(skipped) => progress.skip(&skipped),
                }
            }
            while pending.len() >= batch_size {
                let rest = pending.split_off(batch_size);
                let batch = mem::replace(&mut pending, rest);
                write_batch(session.as_mut(), &mut cache, batch, &mut progress)
                    .await
                    .map_err(|err| progress.abort(err))?;
            }
        }

        let stats: StreamStats = match reader.await {
            Ok(Ok(stats)) => stats,
            Ok(Err(err)) => return Err(progress.abort(err)),
            Err(err) => return Err(progress.abort(err)),
        };

        if !pending.is_empty() {
            write_batch(session.as_mut(), &mut cache, pending, &mut progress)
                .await
                .map_err(|err| progress.abort(err))?;
        }

        session.commit().await.map_err(|err| progress.abort(err))?;

        let elapsed = clock.elapsed().as_secs_f64();
        let summary = ImportSummary {
            run_id,
            archive: path.to_path_buf(),
            started_at,
            finished_at: Utc::now(),
            data_rows: stats.data_rows,
            loaded: progress.loaded,
            skipped: progress.skipped,
            skip_reasons: progress.skip_reasons,
            batches: progress.batches,
            largest_batch: progress.largest_batch,
            new_species: cache.created_species(),
            new_datasets: cache.created_datasets(),
            elapsed_secs: elapsed,
            rows_per_sec: if elapsed > 0.0 {
                progress.loaded as f64 / elapsed
            } else {
                0.0
            },
            content_sha256: stats.content_sha256,
            bytes_read: stats.bytes_read,
        };
        info!(
            loaded = summary.loaded,
            skipped = summary.skipped,
            batches = summary.batches,
            elapsed_secs = summary.elapsed_secs,
            rows_per_sec = summary.rows_per_sec,
            "import committed"
        );
        Ok(summary)
    }
}

/// Runs on a blocking thread: parses rows and hands them to the writer in
/// chunks of `batch_size`.
fn read_chunks(
    path: &Path,
    batch_size: usize,
    tx: mpsc::Sender<Chunk>,
) -> Result<StreamStats, ArchiveError> {
    let mut chunk: Chunk = Vec::with_capacity(batch_size);
    let stats = stream_archive(
        path,
        |header| {
            let missing: Vec<&str> = columns::REQUIRED
                .into_iter()
                .filter(|c| !header.contains(c))
                .collect();
            if !missing.is_empty() {
                warn!(
                    ?missing,
                    "archive header lacks required columns; affected rows will be skipped"
                );
            }
            Ok(())
        },
        |header, line| {
            chunk.push(parse_row(header, line));
            if chunk.len() >= batch_size {
                tx.blocking_send(mem::take(&mut chunk))
                    .map_err(|_| ArchiveError::ReceiverClosed)?;
            }
            Ok(())
        },
    )?;
    if !chunk.is_empty() {
        tx.blocking_send(chunk)
            .map_err(|_| ArchiveError::ReceiverClosed)?;
    }
    Ok(stats)
}

async fn write_batch(
    session: &mut dyn ReplaceSession,
    cache: &mut ReferenceCache,
    rows: Vec<ParsedRow>,
    progress: &mut Progress,
) -> Result<(), StoreError> {
    if cache.has_pending() {
        cache.flush(session).await?;
    }
    let mut batch: Vec<NewObservation> = Vec::with_capacity(rows.len());
    for row in rows {
        match cache.resolve(&row) {
            Some((species_id, dataset_id)) => {
                batch.push(row.into_observation(species_id, dataset_id))
            }
            None => progress.skip(&SkippedRow {
                reason: SkipReason::UnresolvedReference,
                gbif_id: row.gbif_id,
            }),
        }
    }
    let inserted = session.insert_observations(&batch).await?;
    progress.loaded += inserted;
    progress.batches += 1;
    progress.largest_batch = progress.largest_batch.max(inserted);
    debug!(
        batch = progress.batches,
        rows = inserted,
        loaded = progress.loaded,
        "batch written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use galert_core::StableId;
    use galert_storage::MemoryStore;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str =
        "gbifID\toccurrenceID\tdatasetKey\tdatasetName\tspeciesKey\tspecies\teventDate\tdecimalLatitude\tdecimalLongitude";

    fn archive(rows: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        file
    }

    fn loader(store: &MemoryStore, batch_size: usize) -> BulkLoader {
        BulkLoader::new(
            Arc::new(store.clone()),
            LoaderConfig {
                batch_size,
                channel_depth: 2,
            },
        )
    }

    #[tokio::test]
    async fn skips_row_missing_species_key() {
        let file = archive(&[
            "1\tocc-1\tds-key-1\tTest Dataset\t12345\tVespa velutina\t2024-01-15\t51.0\t4.0",
            "2\tocc-2\tds-key-1\tTest Dataset\t12345\tVespa velutina\t2024-01-16\t51.1\t4.1",
            "3\tocc-3\tds-key-1\tTest Dataset\t\t\t2024-01-17\t51.2\t4.2",
            "4\tocc-4\tds-key-1\tTest Dataset\t67890\tApis mellifera\t2024-01-18\t\t",
        ]);
        let store = MemoryStore::new();

        let summary = loader(&store, 2).import(file.path()).await.unwrap();

        assert_eq!(summary.data_rows, 4);
        assert_eq!(summary.loaded, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.skip_reasons.get(&SkipReason::MissingSpeciesKey), Some(&1));
        assert_eq!(summary.new_species, 2);
        assert_eq!(summary.new_datasets, 1);
        assert_eq!(summary.batches, 2);
        assert_eq!(store.observations().await.len(), 3);
        let no_location = store
            .observations()
            .await
            .into_iter()
            .find(|o| o.fields.occurrence_id == "occ-4")
            .unwrap();
        assert_eq!(no_location.fields.location, None);
    }

    #[tokio::test]
    async fn skipped_rows_never_push_a_batch_past_the_limit() {
        let file = archive(&[
            "1\tocc-1\tds-key-1\tTest Dataset\t12345\t\t2024-01-15\t\t",
            "2\tocc-2\tds-key-1\tTest Dataset\t\t\t2024-01-16\t\t",
            "3\tocc-3\tds-key-1\tTest Dataset\t12345\t\t2024-01-17\t\t",
            "4\tocc-4\tds-key-1\tTest Dataset\t12345\t\t2024-01-18\t\t",
            "5\tocc-5\tds-key-1\tTest Dataset\t12345\t\t2024-01-19\t\t",
        ]);
        let store = MemoryStore::new();

        let summary = loader(&store, 2).import(file.path()).await.unwrap();

        assert_eq!(summary.loaded, 4);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.largest_batch, 2);
        assert_eq!(store.observations().await.len(), 4);
    }

    #[tokio::test]
    async fn reimport_keeps_stable_ids_when_provider_id_changes() {
        let store = MemoryStore::new();
        let first = archive(&["100\tO1\tD1\t\t1\t\t2024-03-01\t\t"]);
        loader(&store, 10).import(first.path()).await.unwrap();
        let before = store.observations().await;

        let second = archive(&["999\tO1\tD1\t\t1\t\t2024-03-01\t\t"]);
        loader(&store, 10).import(second.path()).await.unwrap();
        let after = store.observations().await;

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].fields.gbif_id, "999");
        assert_eq!(before[0].stable_id, after[0].stable_id);
        assert_eq!(
            after[0].stable_id.hex(),
            "819f1b38e9fe3670ef7839cdf1cb4a54"
        );
        assert_eq!(after[0].stable_id, StableId::compute("D1", "O1"));
    }

    #[tokio::test]
    async fn importing_same_archive_twice_is_identical() {
        let file = archive(&[
            "1\tocc-1\tds-a\tA\t1\tSp one\t2024-01-15\t51.0\t4.0",
            "2\tocc-2\tds-b\tB\t2\tSp two\t2024-02-15\t50.0\t3.0",
        ]);
        let store = MemoryStore::new();
        let first = loader(&store, 1).import(file.path()).await.unwrap();
        let before = store.observations().await;
        let second = loader(&store, 1).import(file.path()).await.unwrap();

        assert_eq!(store.observations().await, before);
        assert_eq!(first.content_sha256, second.content_sha256);
        assert_eq!(second.new_species, 0);
        assert_eq!(second.new_datasets, 0);
    }

    #[tokio::test]
    async fn unreadable_archive_keeps_previous_set() {
        let store = MemoryStore::new();
        let good = archive(&["1\tocc-1\tds-a\tA\t1\t\t2024-01-15\t\t"]);
        loader(&store, 10).import(good.path()).await.unwrap();

        let err = loader(&store, 10)
            .import(Path::new("/nonexistent/occurrences.zip"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Aborted {
                cause: ImportFailure::Archive(ArchiveError::Open { .. }),
                ..
            }
        ));
        assert_eq!(store.observations().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_import_is_refused() {
        let store = MemoryStore::new();
        let _held = store.try_lock(LockScope::Import).await.unwrap().unwrap();
        let file = archive(&[]);
        let err = loader(&store, 10).import(file.path()).await.unwrap_err();
        assert!(matches!(err, ImportError::AlreadyRunning));
    }
}
