//! Storage traits for station and area aggregates.
//!
//! The resolution engine only reads through [`StationStore`]; the station
//! and area pipelines mutate through a [`StationTx`], one transaction per
//! station or area so each aggregate's read-modify-write is atomic with
//! respect to concurrent workers touching the same identity.
//!
//! Two implementations exist: [`PgStationStore`](crate::PgStationStore) for
//! production and [`MemoryStore`](crate::MemoryStore) for tests and local
//! runs.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use waypost_types::{
    AreaRecord, CellAreaKey, CellStation, RetainedObservation, StationKey, StationLocation,
    StationRecord,
};

use crate::error::DbError;

/// Read access to stations plus the ability to open write transactions.
pub trait StationStore: Send + Sync {
    /// The transaction type handed to the pipelines.
    type Tx: StationTx;

    /// Open a new transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, DbError>> + Send;

    /// Load the stations matching `keys`.
    ///
    /// Missing keys are skipped. Rows without a location are returned as
    /// well; callers decide whether they are usable.
    fn load_stations<K: StationKey>(
        &self,
        keys: &[K],
    ) -> impl Future<Output = Result<Vec<StationRecord<K>>, DbError>> + Send;

    /// Load the areas matching `keys`. Missing keys are skipped.
    fn load_areas(
        &self,
        keys: &[CellAreaKey],
    ) -> impl Future<Output = Result<Vec<AreaRecord>, DbError>> + Send;
}

/// A single storage transaction.
///
/// Dropping a transaction without calling [`commit`](StationTx::commit)
/// rolls it back.
pub trait StationTx: Send {
    /// Load a station and lock it until the transaction ends.
    ///
    /// The lock holds for a key with no stored station too: a second
    /// transaction locking the same new key waits, then sees whatever the
    /// first one saved.
    fn lock_station<K: StationKey>(
        &mut self,
        key: &K,
    ) -> impl Future<Output = Result<Option<StationRecord<K>>, DbError>> + Send;

    /// Insert or overwrite a station row.
    fn save_station<K: StationKey>(
        &mut self,
        record: &StationRecord<K>,
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Retain observations for a station.
    ///
    /// Observations whose fingerprint is already retained are ignored.
    /// Afterwards only the `limit` most recently received observations are
    /// kept. Returns how many observations were newly retained.
    fn retain_observations<K: StationKey>(
        &mut self,
        key: &K,
        observations: &[RetainedObservation],
        limit: usize,
    ) -> impl Future<Output = Result<usize, DbError>> + Send;

    /// All retained observations for a station, oldest first.
    fn retained_observations<K: StationKey>(
        &mut self,
        key: &K,
    ) -> impl Future<Output = Result<Vec<RetainedObservation>, DbError>> + Send;

    /// Forget every retained observation for a station.
    fn clear_observations<K: StationKey>(
        &mut self,
        key: &K,
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Positioned cells belonging to `area`.
    fn area_cells(
        &mut self,
        area: &CellAreaKey,
    ) -> impl Future<Output = Result<Vec<CellStation>, DbError>> + Send;

    /// Load an area and lock its row until the transaction ends.
    fn lock_area(
        &mut self,
        key: &CellAreaKey,
    ) -> impl Future<Output = Result<Option<AreaRecord>, DbError>> + Send;

    /// Insert or overwrite an area row.
    fn save_area(&mut self, area: &AreaRecord) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Remove an area row, if present.
    fn delete_area(
        &mut self,
        key: &CellAreaKey,
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Make every write in this transaction durable.
    fn commit(self) -> impl Future<Output = Result<(), DbError>> + Send;
}

// =========================================================================
// Row types shared by the implementations
// =========================================================================

/// A row from the `station` table.
///
/// Counters are stored as `BIGINT` so they never overflow the column
/// before they overflow the in-memory `u32`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StationRow {
    /// Canonical key string.
    pub key: String,
    /// Parent area key, for cells.
    pub area_key: Option<String>,
    /// Latitude, when positioned.
    pub lat: Option<f64>,
    /// Longitude, when positioned.
    pub lon: Option<f64>,
    /// Range in meters, when positioned.
    pub range: Option<f64>,
    /// Lifetime observation count.
    pub total_measures: i64,
    /// Observations folded in by the last update.
    pub new_measures: i64,
    /// Number of recorded moves.
    pub block_count: i64,
    /// Date of the most recent move.
    pub block_last: Option<NaiveDate>,
    /// Row creation time.
    pub created: DateTime<Utc>,
    /// Last write time.
    pub modified: DateTime<Utc>,
}

impl StationRow {
    /// Flatten a typed record into a row.
    pub fn from_record<K: StationKey>(record: &StationRecord<K>) -> Self {
        Self {
            key: record.key.to_string(),
            area_key: record.key.area().map(|a| a.to_string()),
            lat: record.location.map(|l| l.lat),
            lon: record.location.map(|l| l.lon),
            range: record.location.map(|l| l.range),
            total_measures: i64::from(record.total_measures),
            new_measures: i64::from(record.new_measures),
            block_count: i64::from(record.block_count),
            block_last: record.block_last,
            created: record.created,
            modified: record.modified,
        }
    }

    /// Parse the row back into a typed record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Key`] if the stored key is malformed.
    pub fn into_record<K: StationKey>(self) -> Result<StationRecord<K>, DbError> {
        let location = match (self.lat, self.lon, self.range) {
            (Some(lat), Some(lon), Some(range)) => Some(StationLocation { lat, lon, range }),
            _ => None,
        };
        Ok(StationRecord {
            key: self.key.parse()?,
            location,
            total_measures: counter(self.total_measures),
            new_measures: counter(self.new_measures),
            block_count: counter(self.block_count),
            block_last: self.block_last,
            created: self.created,
            modified: self.modified,
        })
    }
}

/// A row from the `cell_area` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AreaRow {
    /// Canonical area key.
    pub key: String,
    /// Center latitude.
    pub lat: f64,
    /// Center longitude.
    pub lon: f64,
    /// Radius in meters.
    pub range: f64,
    /// Positioned cells in the area.
    pub num_cells: i64,
    /// Mean cell range.
    pub avg_cell_range: f64,
    /// Row creation time.
    pub created: DateTime<Utc>,
    /// Last write time.
    pub modified: DateTime<Utc>,
}

impl AreaRow {
    /// Flatten a typed area into a row.
    pub fn from_record(area: &AreaRecord) -> Self {
        Self {
            key: area.key.to_string(),
            lat: area.lat,
            lon: area.lon,
            range: area.range,
            num_cells: i64::from(area.num_cells),
            avg_cell_range: area.avg_cell_range,
            created: area.created,
            modified: area.modified,
        }
    }

    /// Parse the row back into a typed area.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Key`] if the stored key is malformed.
    pub fn into_record(self) -> Result<AreaRecord, DbError> {
        Ok(AreaRecord {
            key: self.key.parse()?,
            lat: self.lat,
            lon: self.lon,
            range: self.range,
            num_cells: counter(self.num_cells),
            avg_cell_range: self.avg_cell_range,
            created: self.created,
            modified: self.modified,
        })
    }
}

/// Clamp a stored counter into `u32`.
fn counter(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use waypost_types::{CellKey, MacAddr, Radio};

    use super::*;

    #[test]
    fn station_row_roundtrip_keeps_block_state() {
        let now = Utc::now();
        let mut record = StationRecord::new(MacAddr::from_u64(0xab12_3456_7890), now);
        record.block_count = 3;
        record.block_last = Some(now.date_naive());

        let row = StationRow::from_record(&record);
        assert_eq!(row.key, "ab1234567890");
        assert!(row.area_key.is_none());
        assert!(row.lat.is_none());

        let back: StationRecord<MacAddr> = row.into_record().unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn cell_rows_carry_area_key() {
        let key = CellKey {
            radio: Radio::Umts,
            mcc: 262,
            mnc: 2,
            lac: 801,
            cid: 1_234_567,
        };
        let row = StationRow::from_record(&StationRecord::new(key, Utc::now()));
        assert_eq!(row.area_key.as_deref(), Some("umts:262:2:801"));
    }

    #[test]
    fn partial_location_is_treated_as_none() {
        let mut row = StationRow::from_record(&StationRecord::new(MacAddr::from_u64(1), Utc::now()));
        row.lat = Some(1.0);
        row.lon = Some(2.0);
        let record: StationRecord<MacAddr> = row.into_record().unwrap();
        assert!(record.location.is_none());
    }

    #[test]
    fn counters_clamp_to_u32() {
        assert_eq!(counter(-5), 0);
        assert_eq!(counter(i64::MAX), u32::MAX);
        assert_eq!(counter(42), 42);
    }
}
