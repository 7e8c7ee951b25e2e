//! Position resolution request and response types.

use serde::{Deserialize, Serialize};

use crate::enums::{Fallback, Provenance};
use crate::keys::{CellAreaKey, CellKey, MacAddr};

/// A cell tower seen by the querying device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellLookup {
    /// Identity of the cell.
    pub key: CellKey,
    /// Received signal strength in dBm.
    #[serde(default)]
    pub signal: Option<i16>,
}

/// A WiFi access point seen by the querying device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiLookup {
    /// BSSID of the access point.
    pub mac: MacAddr,
    /// Received signal strength in dBm.
    #[serde(default)]
    pub signal: Option<i16>,
}

/// Everything a device reported about its radio surroundings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateQuery {
    /// Observed cell towers.
    #[serde(default)]
    pub cells: Vec<CellLookup>,
    /// Location areas to consult when no individual cell resolves.
    ///
    /// [`LocateQuery::new`] fills this from `cells`. Lookups go through
    /// [`LocateQuery::area_keys`], which also covers queries built any
    /// other way.
    #[serde(default)]
    pub areas: Vec<CellAreaKey>,
    /// Observed WiFi access points.
    #[serde(default)]
    pub wifis: Vec<WifiLookup>,
}

impl LocateQuery {
    /// Build a query, deriving the area fallback keys from the cells.
    pub fn new(cells: Vec<CellLookup>, wifis: Vec<WifiLookup>) -> Self {
        let mut areas: Vec<CellAreaKey> = cells.iter().map(|c| c.key.area_key()).collect();
        areas.sort_unstable();
        areas.dedup();
        Self {
            cells,
            areas,
            wifis,
        }
    }

    /// Area fallback keys: the explicit areas plus the area of every
    /// cell, sorted and unique.
    ///
    /// Queries decoded from JSON usually list only cells, so the areas are
    /// derived here rather than trusted to the `areas` field.
    pub fn area_keys(&self) -> Vec<CellAreaKey> {
        let mut keys: Vec<CellAreaKey> = self
            .cells
            .iter()
            .map(|c| c.key.area_key())
            .chain(self.areas.iter().copied())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Whether the query carries no observations at all.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.areas.is_empty() && self.wifis.is_empty()
    }
}

/// A resolved position with its origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Accuracy radius in meters.
    pub accuracy: f64,
    /// Which source produced the position.
    pub provenance: Provenance,
    /// Set when the position is a coarse fallback.
    pub fallback: Option<Fallback>,
}

/// Wire form of a resolution result.
///
/// An empty result has `empty == true` and zeroed coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocateResponse {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Accuracy radius in meters.
    pub accuracy: f64,
    /// Fallback tag, if the position is coarse.
    pub fallback: Option<Fallback>,
    /// Whether no source produced a position.
    pub empty: bool,
}

impl From<Option<Position>> for LocateResponse {
    fn from(position: Option<Position>) -> Self {
        position.map_or(
            Self {
                lat: 0.0,
                lon: 0.0,
                accuracy: 0.0,
                fallback: None,
                empty: true,
            },
            |p| Self {
                lat: p.lat,
                lon: p.lon,
                accuracy: p.accuracy,
                fallback: p.fallback,
                empty: false,
            },
        )
    }
}
