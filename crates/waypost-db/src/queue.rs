//! Work queue trait for pending observations and dirty areas.
//!
//! Observations wait in one FIFO per station kind until an updater claims
//! them. Areas whose cells changed are collected in a set so each area is
//! recomputed once no matter how many of its cells changed. Every claim
//! removes what it returns in the same atomic step, so two concurrent
//! workers never process the same entry.

use std::future::Future;

use waypost_types::{CellAreaKey, Observation, StationKey, StationKind};

use crate::error::DbError;

/// Queue name for pending observations of `kind`.
pub fn observation_queue(kind: StationKind) -> String {
    format!("queue:update:{kind}")
}

/// Queue name for areas awaiting recomputation.
pub const AREA_QUEUE: &str = "queue:update:cell_area";

/// Durable queues feeding the station and area pipelines.
pub trait WorkQueue: Send + Sync {
    /// Append observations to their kind's queue. Returns the number
    /// enqueued.
    fn push_observations<K: StationKey>(
        &self,
        observations: &[Observation<K>],
    ) -> impl Future<Output = Result<usize, DbError>> + Send;

    /// Atomically remove and return up to `count` of the oldest queued
    /// observations for `K`'s kind.
    fn claim_observations<K: StationKey>(
        &self,
        count: usize,
    ) -> impl Future<Output = Result<Vec<Observation<K>>, DbError>> + Send;

    /// Number of observations still waiting for `kind`.
    fn pending_observations(
        &self,
        kind: StationKind,
    ) -> impl Future<Output = Result<usize, DbError>> + Send;

    /// Mark areas as needing recomputation.
    fn schedule_areas(
        &self,
        keys: &[CellAreaKey],
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Atomically remove and return up to `count` scheduled areas.
    fn claim_areas(
        &self,
        count: usize,
    ) -> impl Future<Output = Result<Vec<CellAreaKey>, DbError>> + Send;

    /// Number of areas waiting for recomputation.
    fn pending_areas(&self) -> impl Future<Output = Result<usize, DbError>> + Send;
}

/// Decode claimed JSON payloads, dropping and logging the malformed ones.
///
/// A claimed entry is already gone from the queue, so a single corrupt
/// payload must not fail the whole claim.
pub(crate) fn decode_claimed<K: StationKey>(queue: &str, raw: &[String]) -> Vec<Observation<K>> {
    raw.iter()
        .filter_map(|payload| match serde_json::from_str(payload) {
            Ok(obs) => Some(obs),
            Err(e) => {
                tracing::warn!(queue, error = %e, "Dropping malformed queued observation");
                None
            }
        })
        .collect()
}

/// Parse claimed area keys, dropping and logging the malformed ones.
pub(crate) fn decode_areas(raw: &[String]) -> Vec<CellAreaKey> {
    raw.iter()
        .filter_map(|key| match key.parse() {
            Ok(area) => Some(area),
            Err(e) => {
                tracing::warn!(queue = AREA_QUEUE, error = %e, "Dropping malformed area key");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use waypost_types::MacAddr;

    use super::*;

    #[test]
    fn queue_names() {
        assert_eq!(observation_queue(StationKind::Cell), "queue:update:cell");
        assert_eq!(observation_queue(StationKind::Wifi), "queue:update:wifi");
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        let good = serde_json::to_string(&Observation::new(MacAddr::from_u64(7), 1.0, 2.0))
            .unwrap_or_default();
        let raw = vec![good, "{not json".to_owned(), "{\"key\":\"zz\",\"lat\":1,\"lon\":2}".to_owned()];
        let decoded: Vec<Observation<MacAddr>> = decode_claimed("q", &raw);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn malformed_area_keys_are_dropped() {
        let raw = vec!["gsm:1:2:3".to_owned(), "bogus".to_owned()];
        assert_eq!(decode_areas(&raw).len(), 1);
    }
}
