use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use galert_core::{
    Alert, AlertId, AlertOwner, Dataset, DatasetChange, DatasetId, EmailFrequency, NewDataset,
    NewObservation, NewSpecies, Species, StableId, WEB_MERCATOR_SRID,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{
    AlertSyncSession, ExpiryCounts, IdentityRow, LockScope, MatchCounts, MatchPredicate,
    ObservationStore, ReferenceSnapshot, ReplaceSession, RunLease, StoreError, UnseenDigest,
    UnseenSample,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Postgres + PostGIS implementation of [`ObservationStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn push_predicate(qb: &mut QueryBuilder<'_, Postgres>, predicate: &MatchPredicate) {
    if let Some(species) = &predicate.species {
        qb.push(" AND o.species_id = ANY(").push_bind(species.clone()).push(")");
    }
    if let Some(datasets) = &predicate.datasets {
        qb.push(" AND o.source_dataset_id = ANY(")
            .push_bind(datasets.clone())
            .push(")");
    }
}

fn species_from_row(row: &PgRow) -> Result<Species, sqlx::Error> {
    let vernacular_name: String = row.try_get("vernacular_name")?;
    Ok(Species {
        id: row.try_get("id")?,
        gbif_taxon_key: row.try_get("gbif_taxon_key")?,
        scientific_name: row.try_get("scientific_name")?,
        vernacular_name: (!vernacular_name.is_empty()).then_some(vernacular_name),
    })
}

fn dataset_from_row(row: &PgRow) -> Result<Dataset, sqlx::Error> {
    let id: i64 = row.try_get("id")?;
    let key: String = row.try_get("gbif_dataset_key")?;
    let name: String = row.try_get("name")?;
    Ok(Dataset::new(id, key, name))
}

fn alert_from_row(row: &PgRow) -> Result<Alert, StoreError> {
    let frequency: String = row.try_get("email_frequency")?;
    let threshold: Option<i32> = row.try_get("auto_mark_seen_after_days")?;
    let species_ids: Vec<i64> = row.try_get("species_ids")?;
    let dataset_ids: Vec<i64> = row.try_get("dataset_ids")?;
    Ok(Alert {
        id: row.try_get("id")?,
        owner: AlertOwner {
            user_id: row.try_get("user_id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
        },
        name: row.try_get("name")?,
        species_filter: species_ids.into_iter().collect::<BTreeSet<_>>(),
        dataset_filter: dataset_ids.into_iter().collect::<BTreeSet<_>>(),
        email_frequency: frequency.parse::<EmailFrequency>()?,
        auto_mark_seen_after_days: threshold.and_then(|days| u32::try_from(days).ok()),
        unseen_count: row.try_get("unseen_count")?,
        last_email_sent_at: row.try_get("last_email_sent_at")?,
    })
}

#[async_trait]
impl ObservationStore for PgStore {
    async fn try_lock(&self, scope: LockScope) -> Result<Option<RunLease>, StoreError> {
        // Session-level advisory lock on a connection taken out of the pool:
        // closing that connection is what releases the lock.
        let mut conn = self.pool.acquire().await?.detach();
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(scope.advisory_key())
            .fetch_one(&mut conn)
            .await?;
        if acquired {
            Ok(Some(RunLease::new(scope, conn)))
        } else {
            Ok(None)
        }
    }

    async fn load_reference_data(&self) -> Result<ReferenceSnapshot, StoreError> {
        let species = sqlx::query(
            "SELECT id, gbif_taxon_key, scientific_name, vernacular_name FROM species ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(species_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let datasets = sqlx::query("SELECT id, gbif_dataset_key, name FROM dataset ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(dataset_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ReferenceSnapshot { species, datasets })
    }

    async fn begin_replace(&self) -> Result<Box<dyn ReplaceSession>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("TRUNCATE TABLE observation RESTART IDENTITY")
            .execute(&mut *tx)
            .await?;
        debug!("observation table truncated inside replace transaction");
        Ok(Box::new(PgReplaceSession { tx }))
    }

    async fn observation_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM observation")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn scan_identities(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<IdentityRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_dataset_key, occurrence_id, stable_id
              FROM observation
             WHERE id > $1
             ORDER BY id
             LIMIT $2
            "#,
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let stable_id: Uuid = row.try_get("stable_id")?;
            out.push(IdentityRow {
                id: row.try_get("id")?,
                source_dataset_key: row.try_get("source_dataset_key")?,
                occurrence_id: row.try_get("occurrence_id")?,
                stable_id: StableId::from_stored(stable_id),
            });
        }
        Ok(out)
    }

    async fn cleanup_stale_tracking(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM alert_observation ao
             WHERE NOT EXISTS (
                   SELECT 1 FROM observation o WHERE o.stable_id = ao.stable_id
             )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.user_id, u.username, u.email, a.name, a.email_frequency,
                   a.auto_mark_seen_after_days, a.unseen_count, a.last_email_sent_at,
                   COALESCE((SELECT array_agg(s.species_id ORDER BY s.species_id)
                               FROM alert_species s WHERE s.alert_id = a.id), '{}') AS species_ids,
                   COALESCE((SELECT array_agg(d.dataset_id ORDER BY d.dataset_id)
                               FROM alert_dataset d WHERE d.alert_id = a.id), '{}') AS dataset_ids
              FROM alert a
              JOIN app_user u ON u.id = a.user_id
             ORDER BY a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn match_stable_ids(
        &self,
        predicate: &MatchPredicate,
    ) -> Result<Vec<StableId>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT DISTINCT o.stable_id FROM observation o WHERE TRUE",
        );
        push_predicate(&mut qb, predicate);
        qb.push(" ORDER BY o.stable_id");

        let ids: Vec<Uuid> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(ids.into_iter().map(StableId::from_stored).collect())
    }

    async fn tracked_stable_ids(&self, alert_id: AlertId) -> Result<Vec<StableId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT stable_id FROM alert_observation WHERE alert_id = $1 ORDER BY stable_id",
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(StableId::from_stored).collect())
    }

    async fn begin_alert_sync(
        &self,
        alert_id: AlertId,
    ) -> Result<Box<dyn AlertSyncSession>, StoreError> {
        let mut tx = self.pool.begin().await?;
        // Row lock serializes concurrent syncs of the same alert.
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM alert WHERE id = $1 FOR UPDATE")
            .bind(alert_id)
            .fetch_optional(&mut *tx)
            .await?;
        if found.is_none() {
            return Err(StoreError::NotFound {
                entity: "alert",
                id: alert_id,
            });
        }
        Ok(Box::new(PgAlertSyncSession { tx, alert_id }))
    }

    async fn unseen_since(
        &self,
        alert_id: AlertId,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<UnseenDigest, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM alert_observation
             WHERE alert_id = $1
               AND ($2::timestamptz IS NULL OR first_seen_in_alert > $2)
            "#,
        )
        .bind(alert_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT ao.stable_id, ao.observation_date, d.gbif_id, d.scientific_name
              FROM alert_observation ao
              LEFT JOIN LATERAL (
                   SELECT o.gbif_id, s.scientific_name
                     FROM observation o
                     JOIN species s ON s.id = o.species_id
                    WHERE o.stable_id = ao.stable_id
                    LIMIT 1
              ) d ON TRUE
             WHERE ao.alert_id = $1
               AND ($2::timestamptz IS NULL OR ao.first_seen_in_alert > $2)
             ORDER BY ao.observation_date DESC, ao.stable_id
             LIMIT $3
            "#,
        )
        .bind(alert_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut sample = Vec::with_capacity(rows.len());
        for row in rows {
            let stable_id: Uuid = row.try_get("stable_id")?;
            sample.push(UnseenSample {
                stable_id: StableId::from_stored(stable_id),
                observation_date: row.try_get("observation_date")?,
                gbif_id: row.try_get("gbif_id")?,
                scientific_name: row.try_get("scientific_name")?,
            });
        }
        Ok(UnseenDigest {
            count: count.max(0) as u64,
            sample,
        })
    }

    async fn mark_notified(&self, alert_id: AlertId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE alert SET last_email_sent_at = $2 WHERE id = $1")
            .bind(alert_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "alert",
                id: alert_id,
            });
        }
        Ok(())
    }

    async fn update_dataset(
        &self,
        id: DatasetId,
        change: DatasetChange,
    ) -> Result<Dataset, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, gbif_dataset_key, name FROM dataset WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "dataset",
            id,
        })?;
        let mut dataset = dataset_from_row(&row)?;
        dataset.apply(change)?;

        sqlx::query("UPDATE dataset SET name = $2 WHERE id = $1")
            .bind(id)
            .bind(&dataset.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(dataset)
    }
}

struct PgReplaceSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ReplaceSession for PgReplaceSession {
    async fn create_species(&mut self, new: &[NewSpecies]) -> Result<Vec<Species>, StoreError> {
        if new.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<i64> = new.iter().map(|s| s.gbif_taxon_key).collect();
        let names: Vec<String> = new.iter().map(|s| s.scientific_name.clone()).collect();
        let vernacular: Vec<String> = new
            .iter()
            .map(|s| s.vernacular_name.clone().unwrap_or_default())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO species (gbif_taxon_key, scientific_name, vernacular_name)
            SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::text[])
            ON CONFLICT (gbif_taxon_key) DO NOTHING
            "#,
        )
        .bind(&keys)
        .bind(&names)
        .bind(&vernacular)
        .execute(&mut *self.tx)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, gbif_taxon_key, scientific_name, vernacular_name
              FROM species
             WHERE gbif_taxon_key = ANY($1)
            "#,
        )
        .bind(&keys)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.iter().map(species_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn create_datasets(&mut self, new: &[NewDataset]) -> Result<Vec<Dataset>, StoreError> {
        if new.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = new.iter().map(|d| d.gbif_dataset_key.clone()).collect();
        let names: Vec<String> = new.iter().map(|d| d.name.clone()).collect();

        sqlx::query(
            r#"
            INSERT INTO dataset (gbif_dataset_key, name)
            SELECT * FROM UNNEST($1::text[], $2::text[])
            ON CONFLICT (gbif_dataset_key) DO NOTHING
            "#,
        )
        .bind(&keys)
        .bind(&names)
        .execute(&mut *self.tx)
        .await?;

        let rows = sqlx::query(
            "SELECT id, gbif_dataset_key, name FROM dataset WHERE gbif_dataset_key = ANY($1)",
        )
        .bind(&keys)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.iter().map(dataset_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn insert_observations(&mut self, batch: &[NewObservation]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        // One array per column keeps a 10k-row batch to a single statement
        // with 15 binds.
        let n = batch.len();
        let mut gbif_ids = Vec::with_capacity(n);
        let mut occurrence_ids = Vec::with_capacity(n);
        let mut species_ids = Vec::with_capacity(n);
        let mut dataset_ids = Vec::with_capacity(n);
        let mut dataset_keys = Vec::with_capacity(n);
        let mut xs: Vec<Option<f64>> = Vec::with_capacity(n);
        let mut ys: Vec<Option<f64>> = Vec::with_capacity(n);
        let mut dates: Vec<NaiveDate> = Vec::with_capacity(n);
        let mut counts: Vec<Option<i32>> = Vec::with_capacity(n);
        let mut localities = Vec::with_capacity(n);
        let mut municipalities = Vec::with_capacity(n);
        let mut bases = Vec::with_capacity(n);
        let mut recorders = Vec::with_capacity(n);
        let mut uncertainties: Vec<Option<f64>> = Vec::with_capacity(n);
        let mut references = Vec::with_capacity(n);

        for obs in batch {
            gbif_ids.push(obs.gbif_id.clone());
            occurrence_ids.push(obs.occurrence_id.clone());
            species_ids.push(obs.species_id);
            dataset_ids.push(obs.source_dataset_id);
            dataset_keys.push(obs.source_dataset_key.clone());
            xs.push(obs.location.map(|p| p.x));
            ys.push(obs.location.map(|p| p.y));
            dates.push(obs.date);
            counts.push(obs.individual_count);
            localities.push(obs.locality.clone());
            municipalities.push(obs.municipality.clone());
            bases.push(obs.basis_of_record.clone());
            recorders.push(obs.recorded_by.clone());
            uncertainties.push(obs.coordinate_uncertainty_in_meters);
            references.push(obs.references.clone());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO observation (
                gbif_id, occurrence_id, species_id, source_dataset_id, source_dataset_key,
                location, date, individual_count, locality, municipality, basis_of_record,
                recorded_by, coordinate_uncertainty_in_meters, "references"
            )
            SELECT t.gbif_id, t.occurrence_id, t.species_id, t.source_dataset_id,
                   t.source_dataset_key,
                   CASE WHEN t.x IS NULL OR t.y IS NULL THEN NULL
                        ELSE ST_SetSRID(ST_MakePoint(t.x, t.y), $16) END,
                   t.date, t.individual_count, t.locality, t.municipality, t.basis_of_record,
                   t.recorded_by, t.coordinate_uncertainty_in_meters, t.refs
              FROM UNNEST(
                   $1::text[], $2::text[], $3::bigint[], $4::bigint[], $5::text[],
                   $6::float8[], $7::float8[], $8::date[], $9::int4[], $10::text[],
                   $11::text[], $12::text[], $13::text[], $14::float8[], $15::text[]
              ) AS t(gbif_id, occurrence_id, species_id, source_dataset_id, source_dataset_key,
                     x, y, date, individual_count, locality, municipality, basis_of_record,
                     recorded_by, coordinate_uncertainty_in_meters, refs)
            "#,
        )
        .bind(&gbif_ids)
        .bind(&occurrence_ids)
        .bind(&species_ids)
        .bind(&dataset_ids)
        .bind(&dataset_keys)
        .bind(&xs)
        .bind(&ys)
        .bind(&dates)
        .bind(&counts)
        .bind(&localities)
        .bind(&municipalities)
        .bind(&bases)
        .bind(&recorders)
        .bind(&uncertainties)
        .bind(&references)
        .bind(WEB_MERCATOR_SRID)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

struct PgAlertSyncSession {
    tx: Transaction<'static, Postgres>,
    alert_id: AlertId,
}

#[async_trait]
impl AlertSyncSession for PgAlertSyncSession {
    async fn insert_new_matches(
        &mut self,
        predicate: &MatchPredicate,
        first_seen: DateTime<Utc>,
    ) -> Result<MatchCounts, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "WITH matched AS ( \
                 SELECT DISTINCT ON (o.stable_id) o.stable_id, o.date \
                   FROM observation o WHERE TRUE",
        );
        push_predicate(&mut qb, predicate);
        qb.push(
            " ORDER BY o.stable_id, o.date DESC \
             ), inserted AS ( \
                 INSERT INTO alert_observation \
                        (alert_id, stable_id, observation_date, first_seen_in_alert) \
                 SELECT ",
        );
        qb.push_bind(self.alert_id)
            .push(", m.stable_id, m.date, ")
            .push_bind(first_seen)
            .push(
                " FROM matched m \
                 ON CONFLICT (alert_id, stable_id) DO NOTHING \
                 RETURNING 1 \
             ) \
             SELECT (SELECT COUNT(*) FROM matched) AS matched, \
                    (SELECT COUNT(*) FROM inserted) AS inserted",
            );

        let row = qb.build().fetch_one(&mut *self.tx).await?;
        let matched: i64 = row.try_get("matched")?;
        let inserted: i64 = row.try_get("inserted")?;
        Ok(MatchCounts {
            matched: matched.max(0) as u64,
            inserted: inserted.max(0) as u64,
        })
    }

    async fn expire_older_than(
        &mut self,
        cutoff: NaiveDate,
        first_seen: DateTime<Utc>,
    ) -> Result<ExpiryCounts, StoreError> {
        let row = sqlx::query(
            r#"
            WITH expired AS (
                DELETE FROM alert_observation
                 WHERE alert_id = $1 AND observation_date < $2
             RETURNING first_seen_in_alert
            )
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE first_seen_in_alert = $3) AS fresh
              FROM expired
            "#,
        )
        .bind(self.alert_id)
        .bind(cutoff)
        .bind(first_seen)
        .fetch_one(&mut *self.tx)
        .await?;

        let total: i64 = row.try_get("total")?;
        let fresh: i64 = row.try_get("fresh")?;
        Ok(ExpiryCounts {
            total: total.max(0) as u64,
            fresh: fresh.max(0) as u64,
        })
    }

    async fn recount(&mut self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            UPDATE alert
               SET unseen_count = (SELECT COUNT(*) FROM alert_observation WHERE alert_id = $1)
             WHERE id = $1
         RETURNING unseen_count
            "#,
        )
        .bind(self.alert_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
