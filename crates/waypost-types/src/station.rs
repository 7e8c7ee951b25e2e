//! Station and area aggregate records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{CellAreaKey, CellKey, MacAddr, StationKey};

/// Aggregate location of a station.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StationLocation {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Accuracy radius in meters. Never below the kind's minimum accuracy.
    pub range: f64,
}

/// The durable aggregate for one physical radio source.
///
/// A station without a [`location`](Self::location) has been removed from
/// active storage (usually because it was seen moving). The row itself is
/// kept so its blocklist state survives until the station is accepted
/// again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: StationKey"))]
pub struct StationRecord<K> {
    /// Identity of the station.
    pub key: K,
    /// Current aggregate location, if the station is active.
    pub location: Option<StationLocation>,
    /// All observations ever folded into this station.
    pub total_measures: u32,
    /// Observations folded in by the most recent update.
    pub new_measures: u32,
    /// How many times the station has been seen moving.
    pub block_count: u32,
    /// Date of the most recent move.
    pub block_last: Option<NaiveDate>,
    /// When the row was created.
    pub created: DateTime<Utc>,
    /// When the row was last written.
    pub modified: DateTime<Utc>,
}

/// A cell tower record.
pub type CellStation = StationRecord<CellKey>;

/// A WiFi access point record.
pub type WifiStation = StationRecord<MacAddr>;

impl<K: StationKey> StationRecord<K> {
    /// A fresh record with no location, counters or blocklist history.
    pub const fn new(key: K, now: DateTime<Utc>) -> Self {
        Self {
            key,
            location: None,
            total_measures: 0,
            new_measures: 0,
            block_count: 0,
            block_last: None,
            created: now,
            modified: now,
        }
    }

    /// Whether the station currently contributes to position resolution.
    pub const fn is_active(&self) -> bool {
        self.location.is_some()
    }

    /// Remove the station from active storage, keeping its blocklist state.
    pub const fn deactivate(&mut self, now: DateTime<Utc>) {
        self.location = None;
        self.total_measures = 0;
        self.new_measures = 0;
        self.modified = now;
    }
}

/// The aggregate for all cells sharing a location area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaRecord {
    /// Identity of the area.
    pub key: CellAreaKey,
    /// Center latitude in degrees.
    pub lat: f64,
    /// Center longitude in degrees.
    pub lon: f64,
    /// Radius in meters covering every cell in the area.
    pub range: f64,
    /// Number of positioned cells in the area.
    pub num_cells: u32,
    /// Mean range of the area's cells, in meters.
    pub avg_cell_range: f64,
    /// When the row was created.
    pub created: DateTime<Utc>,
    /// When the row was last written.
    pub modified: DateTime<Utc>,
}
