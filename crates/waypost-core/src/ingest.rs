//! Ingestion filter: validates raw observations before they are queued.
//!
//! Malformed observations are dropped and counted, never fatal. Recoverable
//! defects (an implausible signal or accuracy) are cleared instead of
//! rejecting the whole observation.

use std::sync::Arc;

use serde::Serialize;
use waypost_db::{DbError, WorkQueue};
use waypost_types::{CellKey, MacAddr, Observation, StationKey};

/// Valid mobile country codes.
const MCC_RANGE: core::ops::RangeInclusive<u16> = 1..=999;
/// Valid mobile network codes.
const MNC_RANGE: core::ops::RangeInclusive<u16> = 0..=999;
/// Valid location area codes. 65534 and 65535 are reserved.
const LAC_RANGE: core::ops::RangeInclusive<u32> = 1..=65_533;
/// Valid cell ids (28 bits).
const CID_RANGE: core::ops::RangeInclusive<u32> = 1..=268_435_455;
/// Plausible received signal strengths, in dBm.
const SIGNAL_RANGE: core::ops::RangeInclusive<i16> = -150..=-1;

/// Why an observation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// Latitude or longitude missing, non-finite or out of range.
    #[error("coordinates out of range")]
    Coordinates,

    /// A cell identity field is out of range.
    #[error("invalid cell identity")]
    CellIdentity,

    /// The MAC is zero, broadcast or multicast.
    #[error("invalid WiFi identity")]
    WifiIdentity,
}

/// Identity checks per station kind.
pub trait ValidKey: StationKey {
    /// Check that the identity can belong to a real station.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] describing the bad identity.
    fn check(&self) -> Result<(), Rejection>;
}

impl ValidKey for CellKey {
    fn check(&self) -> Result<(), Rejection> {
        let valid = MCC_RANGE.contains(&self.mcc)
            && MNC_RANGE.contains(&self.mnc)
            && LAC_RANGE.contains(&self.lac)
            && CID_RANGE.contains(&self.cid);
        if valid { Ok(()) } else { Err(Rejection::CellIdentity) }
    }
}

impl ValidKey for MacAddr {
    fn check(&self) -> Result<(), Rejection> {
        if self.is_zero() || self.is_broadcast() || self.is_multicast() {
            return Err(Rejection::WifiIdentity);
        }
        Ok(())
    }
}

/// Validate one observation, clearing fields that are implausible but
/// not fatal.
///
/// # Errors
///
/// Returns the [`Rejection`] for observations that must be dropped.
pub fn sanitize<K: ValidKey>(mut observation: Observation<K>) -> Result<Observation<K>, Rejection> {
    let lat_ok = observation.lat.is_finite() && (-90.0..=90.0).contains(&observation.lat);
    let lon_ok = observation.lon.is_finite() && (-180.0..=180.0).contains(&observation.lon);
    if !lat_ok || !lon_ok {
        return Err(Rejection::Coordinates);
    }
    observation.key.check()?;

    observation.signal = observation.signal.filter(|s| SIGNAL_RANGE.contains(s));
    observation.accuracy = observation
        .accuracy
        .filter(|a| a.is_finite() && *a > 0.0);
    Ok(observation)
}

/// Counts from one submitted batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Observations queued for the station updater.
    pub accepted: usize,
    /// Observations dropped as malformed.
    pub rejected: usize,
}

/// Filters observation batches and queues the valid ones.
pub struct Ingestor<Q> {
    queue: Arc<Q>,
}

impl<Q: WorkQueue> Ingestor<Q> {
    /// Build an ingestor that feeds `queue`.
    pub const fn new(queue: Arc<Q>) -> Self {
        Self { queue }
    }

    /// Validate `batch` and queue the survivors.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the queue rejects the push. Malformed
    /// observations are never an error.
    pub async fn submit<K: ValidKey>(&self, batch: Vec<Observation<K>>) -> Result<IngestReport, DbError> {
        let total = batch.len();
        let mut valid = Vec::with_capacity(total);
        for observation in batch {
            match sanitize(observation) {
                Ok(observation) => valid.push(observation.identified()),
                Err(reason) => {
                    tracing::debug!(kind = K::KIND.as_str(), %reason, "Rejected observation");
                }
            }
        }

        let accepted = if valid.is_empty() {
            0
        } else {
            self.queue.push_observations(&valid).await?
        };
        let report = IngestReport {
            accepted,
            rejected: total.saturating_sub(valid.len()),
        };
        tracing::info!(
            kind = K::KIND.as_str(),
            accepted = report.accepted,
            rejected = report.rejected,
            "Observations ingested"
        );
        Ok(report)
    }
}
