//! Observations: single reported sightings of a radio source.
//!
//! An observation pairs a station identity with the position the reporting
//! device believed it was at. Observations are ephemeral in queries; in the
//! update pipeline they travel through the work queue as JSON and are then
//! retained per station so aggregates can be recomputed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys::{CellKey, MacAddr, StationKey};

/// Namespace for observation fingerprints (UUID v5).
const FINGERPRINT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_52d4_97a3_4e0b_8c2e_1d5a_7b90_c3f4);

/// A reported sighting of one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: StationKey"))]
pub struct Observation<K> {
    /// Identity of the observed station.
    pub key: K,
    /// Reported latitude in degrees.
    pub lat: f64,
    /// Reported longitude in degrees.
    pub lon: f64,
    /// Accuracy of the reporting device's own position fix, in meters.
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Received signal strength in dBm.
    #[serde(default)]
    pub signal: Option<i16>,
    /// When the sighting happened, as reported by the device.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    /// Identifier of the submission report this sighting came from.
    #[serde(default)]
    pub report_id: Option<Uuid>,
}

/// A cell tower sighting.
pub type CellObservation = Observation<CellKey>;

/// A WiFi access point sighting.
pub type WifiObservation = Observation<MacAddr>;

impl<K: StationKey> Observation<K> {
    /// Create an observation with only the required fields set.
    pub const fn new(key: K, lat: f64, lon: f64) -> Self {
        Self {
            key,
            lat,
            lon,
            accuracy: None,
            signal: None,
            time: None,
            report_id: None,
        }
    }

    /// Set the device accuracy.
    #[must_use]
    pub const fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Set the signal strength.
    #[must_use]
    pub const fn with_signal(mut self, signal: i16) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Set the sighting time.
    #[must_use]
    pub const fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Set the submission report id.
    #[must_use]
    pub const fn with_report_id(mut self, report_id: Uuid) -> Self {
        self.report_id = Some(report_id);
        self
    }

    /// Give an observation with neither a time nor a report id a fresh
    /// report id of its own.
    ///
    /// Without either, every sighting of a station at the same fix would
    /// share one fingerprint and count once. Observations carrying a time
    /// or a report id are returned unchanged.
    #[must_use]
    pub fn identified(mut self) -> Self {
        if self.time.is_none() && self.report_id.is_none() {
            self.report_id = Some(Uuid::now_v7());
        }
        self
    }

    /// Deterministic identity of this sighting.
    ///
    /// Two observations with the same station, coordinates (to 1e-7
    /// degrees), time and report id share a fingerprint. Retained
    /// observations are unique per fingerprint, which makes re-submitting
    /// the same batch a no-op for station aggregates.
    pub fn fingerprint(&self) -> Uuid {
        let time = self.time.map(|t| t.timestamp_millis()).unwrap_or_default();
        let report = self.report_id.unwrap_or_default();
        let canonical = format!(
            "{}|{:.7}|{:.7}|{time}|{report}",
            self.key, self.lat, self.lon
        );
        Uuid::new_v5(&FINGERPRINT_NAMESPACE, canonical.as_bytes())
    }
}

/// An observation that has been folded into a station's aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedObservation {
    /// Fingerprint of the original observation.
    pub fingerprint: Uuid,
    /// Reported latitude in degrees.
    pub lat: f64,
    /// Reported longitude in degrees.
    pub lon: f64,
    /// Device accuracy in meters, if reported.
    pub accuracy: Option<f64>,
    /// When the observation was retained.
    pub received: DateTime<Utc>,
}

impl RetainedObservation {
    /// Retain `observation`, stamping it with the time it was accepted.
    pub fn from_observation<K: StationKey>(observation: &Observation<K>, received: DateTime<Utc>) -> Self {
        Self {
            fingerprint: observation.fingerprint(),
            lat: observation.lat,
            lon: observation.lon,
            accuracy: observation.accuracy,
            received,
        }
    }
}
