//! `PostgreSQL` implementation of the station storage traits.
//!
//! # Tables
//!
//! | Table | Key | Description |
//! |-------|-----|-------------|
//! | `station` | `(kind, key)` | Aggregate per cell or WiFi station, including blocklist state |
//! | `station_observation` | `(kind, key, fingerprint)` | Retained observations behind each aggregate |
//! | `cell_area` | `key` | Aggregate per cell location area |
//!
//! Per-station writes run inside one transaction that first takes a
//! transaction-scoped advisory lock on `kind:key` and then
//! `SELECT ... FOR UPDATE` on the station row. The advisory lock also
//! serializes writers of a station that has no row yet, so the counters
//! and the position are always written together.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;
use waypost_types::{
    AreaRecord, CellAreaKey, CellKey, CellStation, RetainedObservation, StationKey, StationRecord,
};

use crate::error::DbError;
use crate::store::{AreaRow, StationRow, StationStore, StationTx};

const STATION_COLUMNS: &str = "key, area_key, lat, lon, range, total_measures, new_measures, \
                               block_count, block_last, created, modified";

const AREA_COLUMNS: &str = "key, lat, lon, range, num_cells, avg_cell_range, created, modified";

/// Station storage backed by a `PostgreSQL` pool.
#[derive(Clone)]
pub struct PgStationStore {
    pool: PgPool,
}

impl PgStationStore {
    /// Wrap an existing pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl StationStore for PgStationStore {
    type Tx = PgStationTx;

    async fn begin(&self) -> Result<PgStationTx, DbError> {
        let tx = self.pool.begin().await?;
        Ok(PgStationTx { tx })
    }

    async fn load_stations<K: StationKey>(
        &self,
        keys: &[K],
    ) -> Result<Vec<StationRecord<K>>, DbError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let rows = sqlx::query_as::<_, StationRow>(&format!(
            "SELECT {STATION_COLUMNS} FROM station WHERE kind = $1 AND key = ANY($2) ORDER BY key"
        ))
        .bind(K::KIND.as_str())
        .bind(&raw)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StationRow::into_record).collect()
    }

    async fn load_areas(&self, keys: &[CellAreaKey]) -> Result<Vec<AreaRecord>, DbError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let rows = sqlx::query_as::<_, AreaRow>(&format!(
            "SELECT {AREA_COLUMNS} FROM cell_area WHERE key = ANY($1) ORDER BY key"
        ))
        .bind(&raw)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AreaRow::into_record).collect()
    }
}

/// An open `PostgreSQL` transaction.
pub struct PgStationTx {
    tx: Transaction<'static, Postgres>,
}

impl StationTx for PgStationTx {
    async fn lock_station<K: StationKey>(
        &mut self,
        key: &K,
    ) -> Result<Option<StationRecord<K>>, DbError> {
        let kind = K::KIND.as_str();
        let key = key.to_string();

        // Row locks cannot cover a station that has no row yet.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1 || ':' || $2, 0))")
            .bind(kind)
            .bind(&key)
            .execute(&mut *self.tx)
            .await?;

        let row = sqlx::query_as::<_, StationRow>(&format!(
            "SELECT {STATION_COLUMNS} FROM station WHERE kind = $1 AND key = $2 FOR UPDATE"
        ))
        .bind(kind)
        .bind(&key)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(StationRow::into_record).transpose()
    }

    async fn save_station<K: StationKey>(&mut self, record: &StationRecord<K>) -> Result<(), DbError> {
        let row = StationRow::from_record(record);
        sqlx::query(
            r"INSERT INTO station (kind, key, area_key, lat, lon, range, total_measures, new_measures, block_count, block_last, created, modified)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
              ON CONFLICT (kind, key) DO UPDATE SET
                lat = EXCLUDED.lat,
                lon = EXCLUDED.lon,
                range = EXCLUDED.range,
                total_measures = EXCLUDED.total_measures,
                new_measures = EXCLUDED.new_measures,
                block_count = EXCLUDED.block_count,
                block_last = EXCLUDED.block_last,
                modified = EXCLUDED.modified",
        )
        .bind(K::KIND.as_str())
        .bind(&row.key)
        .bind(&row.area_key)
        .bind(row.lat)
        .bind(row.lon)
        .bind(row.range)
        .bind(row.total_measures)
        .bind(row.new_measures)
        .bind(row.block_count)
        .bind(row.block_last)
        .bind(row.created)
        .bind(row.modified)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn retain_observations<K: StationKey>(
        &mut self,
        key: &K,
        observations: &[RetainedObservation],
        limit: usize,
    ) -> Result<usize, DbError> {
        if observations.is_empty() {
            return Ok(0);
        }

        let len = observations.len();
        let mut fingerprints: Vec<Uuid> = Vec::with_capacity(len);
        let mut lats = Vec::with_capacity(len);
        let mut lons = Vec::with_capacity(len);
        let mut accuracies: Vec<Option<f64>> = Vec::with_capacity(len);
        let mut received = Vec::with_capacity(len);
        for obs in observations {
            fingerprints.push(obs.fingerprint);
            lats.push(obs.lat);
            lons.push(obs.lon);
            accuracies.push(obs.accuracy);
            received.push(obs.received);
        }

        let kind = K::KIND.as_str();
        let key = key.to_string();
        let inserted = sqlx::query(
            r"INSERT INTO station_observation (kind, key, fingerprint, lat, lon, accuracy, received)
              SELECT $1::TEXT, $2::TEXT, * FROM UNNEST($3::UUID[], $4::FLOAT8[], $5::FLOAT8[], $6::FLOAT8[], $7::TIMESTAMPTZ[])
              ON CONFLICT (kind, key, fingerprint) DO NOTHING",
        )
        .bind(kind)
        .bind(&key)
        .bind(&fingerprints)
        .bind(&lats)
        .bind(&lons)
        .bind(&accuracies)
        .bind(&received)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        let pruned = sqlx::query(
            r"DELETE FROM station_observation
              WHERE kind = $1 AND key = $2 AND id NOT IN (
                SELECT id FROM station_observation
                WHERE kind = $1 AND key = $2
                ORDER BY received DESC, id DESC
                LIMIT $3)",
        )
        .bind(kind)
        .bind(&key)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if pruned > 0 {
            tracing::debug!(%key, pruned, "Pruned retained observations");
        }

        Ok(usize::try_from(inserted).unwrap_or(usize::MAX))
    }

    async fn retained_observations<K: StationKey>(
        &mut self,
        key: &K,
    ) -> Result<Vec<RetainedObservation>, DbError> {
        let rows = sqlx::query_as::<_, RetainedRow>(
            r"SELECT fingerprint, lat, lon, accuracy, received
              FROM station_observation
              WHERE kind = $1 AND key = $2
              ORDER BY received, id",
        )
        .bind(K::KIND.as_str())
        .bind(key.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(RetainedRow::into_observation).collect())
    }

    async fn clear_observations<K: StationKey>(&mut self, key: &K) -> Result<(), DbError> {
        sqlx::query("DELETE FROM station_observation WHERE kind = $1 AND key = $2")
            .bind(K::KIND.as_str())
            .bind(key.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn area_cells(&mut self, area: &CellAreaKey) -> Result<Vec<CellStation>, DbError> {
        let rows = sqlx::query_as::<_, StationRow>(&format!(
            "SELECT {STATION_COLUMNS} FROM station
             WHERE kind = $1 AND area_key = $2 AND lat IS NOT NULL AND lon IS NOT NULL
             ORDER BY key"
        ))
        .bind(CellKey::KIND.as_str())
        .bind(area.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(StationRow::into_record).collect()
    }

    async fn lock_area(&mut self, key: &CellAreaKey) -> Result<Option<AreaRecord>, DbError> {
        let row = sqlx::query_as::<_, AreaRow>(&format!(
            "SELECT {AREA_COLUMNS} FROM cell_area WHERE key = $1 FOR UPDATE"
        ))
        .bind(key.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(AreaRow::into_record).transpose()
    }

    async fn save_area(&mut self, area: &AreaRecord) -> Result<(), DbError> {
        let row = AreaRow::from_record(area);
        sqlx::query(
            r"INSERT INTO cell_area (key, lat, lon, range, num_cells, avg_cell_range, created, modified)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
              ON CONFLICT (key) DO UPDATE SET
                lat = EXCLUDED.lat,
                lon = EXCLUDED.lon,
                range = EXCLUDED.range,
                num_cells = EXCLUDED.num_cells,
                avg_cell_range = EXCLUDED.avg_cell_range,
                modified = EXCLUDED.modified",
        )
        .bind(&row.key)
        .bind(row.lat)
        .bind(row.lon)
        .bind(row.range)
        .bind(row.num_cells)
        .bind(row.avg_cell_range)
        .bind(row.created)
        .bind(row.modified)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_area(&mut self, key: &CellAreaKey) -> Result<(), DbError> {
        sqlx::query("DELETE FROM cell_area WHERE key = $1")
            .bind(key.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), DbError> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// A row from the `station_observation` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct RetainedRow {
    fingerprint: Uuid,
    lat: f64,
    lon: f64,
    accuracy: Option<f64>,
    received: chrono::DateTime<chrono::Utc>,
}

impl RetainedRow {
    const fn into_observation(self) -> RetainedObservation {
        RetainedObservation {
            fingerprint: self.fingerprint,
            lat: self.lat,
            lon: self.lon,
            accuracy: self.accuracy,
            received: self.received,
        }
    }
}
