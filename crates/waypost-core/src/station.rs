//! Station updater: folds queued observations into station aggregates.
//!
//! One run claims a batch of observations for a station kind, groups them
//! by station and updates each station inside its own transaction:
//!
//! 1. A blocked station discards the observations. If it still had a
//!    location, that location and its retained observations are cleared.
//! 2. Otherwise the observations are retained (duplicates by fingerprint
//!    are ignored) and the position is recomputed from everything
//!    retained.
//! 3. A station whose position shifted, or whose observations spread,
//!    further than the kind's movement threshold is recorded as moving.
//!    Moving always blocks it, so its location is cleared as in step 1.
//!
//! Cells schedule their location area for recomputation whenever their
//! row changes.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use waypost_db::{DbError, StationStore, StationTx, WorkQueue};
use waypost_geo::{Circle, GeoError, Point, distance, weighted_centroid};
use waypost_types::{Observation, RetainedObservation, StationKey, StationLocation, StationRecord};

use crate::blocklist::BlocklistPolicy;
use crate::config::WaypostConfig;

/// Errors that abort a station update run.
#[derive(Debug, thiserror::Error)]
pub enum StationError {
    /// Storage or queue failure.
    #[error("station storage error: {0}")]
    Db(#[from] DbError),

    /// Retained observations could not be aggregated.
    #[error("cannot aggregate observations for station {station}: {source}")]
    Geometry {
        /// The station being updated.
        station: String,
        /// The underlying geometry error.
        source: GeoError,
    },
}

/// Result of one updater run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StationUpdate {
    /// Stations whose aggregate changed, moved ones included.
    pub processed: usize,
    /// Stations detected as moving.
    pub moved: usize,
    /// Observations still queued after the claim.
    pub remaining: usize,
    /// Whether more than a full batch is still queued.
    pub follow_up: bool,
}

/// What happened to one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StationOutcome {
    /// Blocked and already inactive; nothing written.
    Skipped,
    /// Blocked; location cleared.
    Cleared,
    /// Every observation was already retained; nothing written.
    Unchanged,
    /// Aggregate recomputed.
    Updated,
    /// Seen moving and blocked.
    Moved,
}

impl StationOutcome {
    const fn is_processed(self) -> bool {
        matches!(self, Self::Updated | Self::Moved)
    }

    const fn wrote_row(self) -> bool {
        matches!(self, Self::Cleared | Self::Updated | Self::Moved)
    }
}

/// Batch updater for one station kind.
pub struct StationUpdater<K, S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    policy: BlocklistPolicy,
    min_accuracy: f64,
    max_move: f64,
    max_retained: usize,
    kind: PhantomData<fn() -> K>,
}

impl<K: StationKey, S: StationStore, Q: WorkQueue> StationUpdater<K, S, Q> {
    /// Build an updater for stations keyed by `K`.
    pub fn new(store: Arc<S>, queue: Arc<Q>, config: &WaypostConfig) -> Self {
        Self {
            store,
            queue,
            policy: BlocklistPolicy::new(&config.blocklist),
            min_accuracy: config.accuracy.station_min(K::KIND),
            max_move: config.movement.max_move(K::KIND),
            max_retained: config.pipeline.max_retained_observations,
            kind: PhantomData,
        }
    }

    /// Claim up to `batch` observations and fold them in.
    ///
    /// # Errors
    ///
    /// Returns [`StationError`] on the first station that cannot be
    /// updated. Stations committed before it stay committed.
    pub async fn update_stations(&self, batch: usize) -> Result<StationUpdate, StationError> {
        self.update_stations_at(batch, Utc::now()).await
    }

    /// As [`update_stations`](Self::update_stations), with `now` as the
    /// current time for timestamps and blocklist decisions.
    ///
    /// # Errors
    ///
    /// As [`update_stations`](Self::update_stations).
    pub async fn update_stations_at(
        &self,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<StationUpdate, StationError> {
        let claimed: Vec<Observation<K>> = self.queue.claim_observations(batch).await?;

        let mut grouped: BTreeMap<K, Vec<Observation<K>>> = BTreeMap::new();
        for observation in claimed.into_iter().map(Observation::identified) {
            grouped
                .entry(observation.key.clone())
                .or_default()
                .push(observation);
        }

        let mut update = StationUpdate::default();
        for (key, observations) in &grouped {
            let outcome = self.update_station(key, observations, now).await?;
            if outcome.is_processed() {
                update.processed = update.processed.saturating_add(1);
            }
            if outcome == StationOutcome::Moved {
                update.moved = update.moved.saturating_add(1);
            }
            if let Some(area) = key.area().filter(|_| outcome.wrote_row()) {
                self.queue.schedule_areas(&[area]).await?;
            }
        }

        update.remaining = self.queue.pending_observations(K::KIND).await?;
        update.follow_up = update.remaining > batch;

        tracing::info!(
            kind = K::KIND.as_str(),
            stations = grouped.len(),
            processed = update.processed,
            moved = update.moved,
            remaining = update.remaining,
            "Station update complete"
        );
        Ok(update)
    }

    async fn update_station(
        &self,
        key: &K,
        observations: &[Observation<K>],
        now: DateTime<Utc>,
    ) -> Result<StationOutcome, StationError> {
        let today = now.date_naive();
        let mut tx = self.store.begin().await?;
        let existing = tx.lock_station(key).await?;
        let exists = existing.is_some();
        let mut record = existing.unwrap_or_else(|| StationRecord::new(key.clone(), now));

        if self.policy.state_of(&record, today).is_blocked() {
            if !record.is_active() {
                tracing::debug!(station = %key, discarded = observations.len(), "Blocked station");
                return Ok(StationOutcome::Skipped);
            }
            record.deactivate(now);
            tx.save_station(&record).await?;
            tx.clear_observations(key).await?;
            tx.commit().await?;
            tracing::debug!(station = %key, "Cleared blocked station");
            return Ok(StationOutcome::Cleared);
        }

        let incoming: Vec<RetainedObservation> = observations
            .iter()
            .map(|o| RetainedObservation::from_observation(o, now))
            .collect();
        let accepted = tx
            .retain_observations(key, &incoming, self.max_retained)
            .await?;
        if accepted == 0 && exists {
            return Ok(StationOutcome::Unchanged);
        }

        let retained = tx.retained_observations(key).await?;
        let circles: Vec<Circle> = retained
            .iter()
            .map(|o| Circle::new(o.lat, o.lon, o.accuracy.unwrap_or(self.min_accuracy)))
            .collect();
        let estimate =
            weighted_centroid(&circles, self.min_accuracy).map_err(|source| StationError::Geometry {
                station: key.to_string(),
                source,
            })?;

        let shift = record
            .location
            .map(|prior| distance(Point::new(prior.lat, prior.lon), estimate.center()));
        let spread = retained
            .iter()
            .map(|o| distance(estimate.center(), Point::new(o.lat, o.lon)))
            .fold(0.0, f64::max);
        let moved = shift.is_some_and(|d| d > self.max_move) || spread > self.max_move;

        let outcome = if moved {
            self.policy.record_move(&mut record, today);
            record.deactivate(now);
            tx.clear_observations(key).await?;
            StationOutcome::Moved
        } else {
            let accepted = u32::try_from(accepted).unwrap_or(u32::MAX);
            record.location = Some(StationLocation {
                lat: estimate.lat,
                lon: estimate.lon,
                range: estimate.accuracy,
            });
            record.new_measures = accepted;
            record.total_measures = record.total_measures.saturating_add(accepted);
            record.modified = now;
            StationOutcome::Updated
        };

        tx.save_station(&record).await?;
        tx.commit().await?;

        tracing::debug!(
            station = %key,
            accepted,
            ?outcome,
            block_count = record.block_count,
            "Station updated"
        );
        Ok(outcome)
    }

    /// Clear the blocklist history of `keys`, permanent blocks included.
    ///
    /// A reset station accepts observations again from the next run.
    /// Unknown keys and stations with no history are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`StationError`] on the first station that cannot be
    /// written. Stations reset before it stay reset.
    pub async fn reset_stations_at(
        &self,
        keys: &[K],
        now: DateTime<Utc>,
    ) -> Result<StationUpdate, StationError> {
        let mut update = StationUpdate::default();
        for key in keys {
            let mut tx = self.store.begin().await?;
            let Some(mut record) = tx
                .lock_station(key)
                .await?
                .filter(|r| r.block_count > 0 || r.block_last.is_some())
            else {
                continue;
            };
            BlocklistPolicy::reset(&mut record);
            record.modified = now;
            tx.save_station(&record).await?;
            tx.commit().await?;
            update.processed = update.processed.saturating_add(1);
        }

        tracing::info!(
            kind = K::KIND.as_str(),
            requested = keys.len(),
            reset = update.processed,
            "Blocklist reset"
        );
        Ok(update)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use chrono::NaiveDate;
    use waypost_db::{MemoryQueue, MemoryStore};
    use waypost_types::{CellKey, MacAddr, Radio, StationKind};

    use super::*;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                queue: Arc::new(MemoryQueue::new()),
            }
        }

        fn updater<K: StationKey>(&self, config: &WaypostConfig) -> StationUpdater<K, MemoryStore, MemoryQueue> {
            StationUpdater::new(Arc::clone(&self.store), Arc::clone(&self.queue), config)
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
    }

    fn wifi_obs(mac: u64, lat: f64, lon: f64, seq: i64) -> Observation<MacAddr> {
        Observation::new(MacAddr::from_u64(mac), lat, lon)
            .with_accuracy(20.0)
            .with_time(DateTime::from_timestamp(1_700_000_000_i64.saturating_add(seq), 0).unwrap())
    }

    fn cell() -> CellKey {
        CellKey {
            radio: Radio::Umts,
            mcc: 310,
            mnc: 260,
            lac: 42,
            cid: 1_234,
        }
    }

    #[tokio::test]
    async fn new_station_is_created_from_observations() {
        let h = Harness::new();
        let mac = 0x00aa_bbcc_dd01;
        h.queue
            .push_observations(&[wifi_obs(mac, 51.0, 7.0, 0), wifi_obs(mac, 51.000_2, 7.0, 1)])
            .await
            .unwrap();

        let update = h
            .updater::<MacAddr>(&WaypostConfig::default())
            .update_stations_at(100, at(1))
            .await
            .unwrap();

        assert_eq!(update, StationUpdate { processed: 1, moved: 0, remaining: 0, follow_up: false });
        let record = h.store.station(&MacAddr::from_u64(mac)).await.unwrap().unwrap();
        let location = record.location.unwrap();
        assert!((location.lat - 51.000_1).abs() < 1e-6);
        assert!((location.range - 100.0).abs() < 1e-9);
        assert_eq!(record.total_measures, 2);
        assert_eq!(record.new_measures, 2);
    }

    #[tokio::test]
    async fn counters_accumulate_across_runs() {
        let h = Harness::new();
        let updater = h.updater::<MacAddr>(&WaypostConfig::default());
        let mac = 0x00aa_bbcc_dd02;

        h.queue.push_observations(&[wifi_obs(mac, 51.0, 7.0, 0)]).await.unwrap();
        updater.update_stations_at(100, at(1)).await.unwrap();
        h.queue
            .push_observations(&[wifi_obs(mac, 51.0, 7.0, 1), wifi_obs(mac, 51.0, 7.0, 2)])
            .await
            .unwrap();
        updater.update_stations_at(100, at(2)).await.unwrap();

        let record = h.store.station(&MacAddr::from_u64(mac)).await.unwrap().unwrap();
        assert_eq!(record.total_measures, 3);
        assert_eq!(record.new_measures, 2);
    }

    #[tokio::test]
    async fn duplicate_batch_does_not_double_count() {
        let h = Harness::new();
        let updater = h.updater::<MacAddr>(&WaypostConfig::default());
        let mac = 0x00aa_bbcc_dd03;
        let batch = [wifi_obs(mac, 51.0, 7.0, 0), wifi_obs(mac, 51.000_1, 7.0, 1)];

        h.queue.push_observations(&batch).await.unwrap();
        updater.update_stations_at(100, at(1)).await.unwrap();
        h.queue.push_observations(&batch).await.unwrap();
        let second = updater.update_stations_at(100, at(1)).await.unwrap();

        assert_eq!(second.processed, 0);
        let record = h.store.station(&MacAddr::from_u64(mac)).await.unwrap().unwrap();
        assert_eq!(record.total_measures, 2);
        assert_eq!(h.store.retained_count(&MacAddr::from_u64(mac)).await, 2);
    }

    #[tokio::test]
    async fn anonymous_sightings_at_one_fix_all_count() {
        let h = Harness::new();
        let mac = MacAddr::from_u64(0x00aa_bbcc_dd08);
        let batch: Vec<Observation<MacAddr>> = (0..3).map(|_| Observation::new(mac, 51.0, 7.0)).collect();
        h.queue.push_observations(&batch).await.unwrap();

        h.updater::<MacAddr>(&WaypostConfig::default())
            .update_stations_at(100, at(1))
            .await
            .unwrap();

        let record = h.store.station(&mac).await.unwrap().unwrap();
        assert_eq!(record.total_measures, 3);
        assert_eq!(h.store.retained_count(&mac).await, 3);
    }

    #[tokio::test]
    async fn shifted_station_is_blocked_and_cleared() {
        let h = Harness::new();
        let updater = h.updater::<MacAddr>(&WaypostConfig::default());
        let mac = 0x00aa_bbcc_dd04;

        h.queue.push_observations(&[wifi_obs(mac, 51.0, 7.0, 0)]).await.unwrap();
        updater.update_stations_at(100, at(1)).await.unwrap();
        h.queue.push_observations(&[wifi_obs(mac, 51.2, 7.0, 1)]).await.unwrap();
        let update = updater.update_stations_at(100, at(2)).await.unwrap();

        assert_eq!((update.processed, update.moved), (1, 1));
        let key = MacAddr::from_u64(mac);
        let record = h.store.station(&key).await.unwrap().unwrap();
        assert!(record.location.is_none());
        assert_eq!(record.block_count, 1);
        assert_eq!(record.block_last, Some(at(2).date_naive()));
        assert_eq!(record.total_measures, 0);
        assert_eq!(h.store.retained_count(&key).await, 0);
    }

    #[tokio::test]
    async fn widely_spread_new_station_is_moving() {
        let h = Harness::new();
        let mac = 0x00aa_bbcc_dd05;
        h.queue
            .push_observations(&[wifi_obs(mac, 51.0, 7.0, 0), wifi_obs(mac, 51.1, 7.0, 1)])
            .await
            .unwrap();

        let update = h
            .updater::<MacAddr>(&WaypostConfig::default())
            .update_stations_at(100, at(1))
            .await
            .unwrap();

        assert_eq!(update.moved, 1);
        let record = h.store.station(&MacAddr::from_u64(mac)).await.unwrap().unwrap();
        assert!(!record.is_active());
    }

    #[tokio::test]
    async fn blocked_station_discards_observations() {
        let h = Harness::new();
        let key = MacAddr::from_u64(0x00aa_bbcc_dd06);
        let mut record = StationRecord::new(key, at(1));
        record.location = Some(StationLocation {
            lat: 51.0,
            lon: 7.0,
            range: 100.0,
        });
        record.total_measures = 4;
        record.block_count = 1;
        record.block_last = Some(at(2).date_naive());
        h.store.insert_stations(&[record]).await;

        h.queue.push_observations(&[wifi_obs(key.as_u64(), 51.0, 7.0, 0)]).await.unwrap();
        let update = h
            .updater::<MacAddr>(&WaypostConfig::default())
            .update_stations_at(100, at(3))
            .await
            .unwrap();

        assert_eq!(update.processed, 0);
        let stored = h.store.station(&key).await.unwrap().unwrap();
        assert!(stored.location.is_none());
        assert_eq!(stored.block_count, 1);
        assert_eq!(h.store.retained_count(&key).await, 0);
    }

    #[tokio::test]
    async fn reset_reopens_permanently_blocked_station() {
        let h = Harness::new();
        let updater = h.updater::<MacAddr>(&WaypostConfig::default());
        let key = MacAddr::from_u64(0x00aa_bbcc_dd07);
        let mut record = StationRecord::new(key, at(1));
        record.block_count = 6;
        record.block_last = Some(at(1).date_naive());
        h.store.insert_stations(&[record]).await;

        h.queue.push_observations(&[wifi_obs(key.as_u64(), 51.0, 7.0, 0)]).await.unwrap();
        assert_eq!(updater.update_stations_at(100, at(2)).await.unwrap().processed, 0);

        let unknown = MacAddr::from_u64(0x00aa_bbcc_dd70);
        let reset = updater.reset_stations_at(&[key, unknown], at(2)).await.unwrap();
        assert_eq!(reset.processed, 1);
        let stored = h.store.station(&key).await.unwrap().unwrap();
        assert_eq!((stored.block_count, stored.block_last), (0, None));
        assert!(h.store.station(&unknown).await.unwrap().is_none());

        h.queue.push_observations(&[wifi_obs(key.as_u64(), 51.0, 7.0, 1)]).await.unwrap();
        assert_eq!(updater.update_stations_at(100, at(3)).await.unwrap().processed, 1);
        assert!(h.store.station(&key).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn cell_updates_schedule_their_area() {
        let h = Harness::new();
        let obs = Observation::new(cell(), 40.7, -74.0).with_accuracy(500.0);
        h.queue.push_observations(&[obs]).await.unwrap();

        let update = h
            .updater::<CellKey>(&WaypostConfig::default())
            .update_stations_at(100, at(1))
            .await
            .unwrap();

        assert_eq!(update.processed, 1);
        assert_eq!(h.queue.claim_areas(10).await.unwrap(), vec![cell().area_key()]);
        let record = h.store.station(&cell()).await.unwrap().unwrap();
        assert!((record.location.unwrap().range - 1_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn backlog_requests_follow_up() {
        let h = Harness::new();
        let obs: Vec<Observation<MacAddr>> = (0..7_u64)
            .map(|i| wifi_obs(0x00aa_bbcc_0000_u64.saturating_add(i), 51.0, 7.0, 0))
            .collect();
        h.queue.push_observations(&obs).await.unwrap();
        let updater = h.updater::<MacAddr>(&WaypostConfig::default());

        let first = updater.update_stations_at(2, at(1)).await.unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.remaining, 5);
        assert!(first.follow_up);

        let second = updater.update_stations_at(5, at(1)).await.unwrap();
        assert_eq!(second.remaining, 0);
        assert!(!second.follow_up);
    }

    #[tokio::test]
    async fn retention_keeps_the_newest_observations() {
        let h = Harness::new();
        let mut config = WaypostConfig::default();
        config.pipeline.max_retained_observations = 3;
        let updater = h.updater::<MacAddr>(&config);
        let mac = 0x00aa_bbcc_dd07;

        for seq in 0..5_i64 {
            h.queue.push_observations(&[wifi_obs(mac, 51.0, 7.0, seq)]).await.unwrap();
            let day = u32::try_from(seq.saturating_add(1)).unwrap();
            updater.update_stations_at(100, at(day)).await.unwrap();
        }

        let key = MacAddr::from_u64(mac);
        assert_eq!(h.store.retained_count(&key).await, 3);
        assert_eq!(h.store.station(&key).await.unwrap().unwrap().total_measures, 5);
    }

    #[tokio::test]
    async fn malformed_queue_entries_are_dropped() {
        let h = Harness::new();
        h.queue.push_raw(StationKind::Wifi, "{not json").await;
        h.queue
            .push_observations(&[wifi_obs(0x00aa_bbcc_dd08, 51.0, 7.0, 0)])
            .await
            .unwrap();

        let update = h
            .updater::<MacAddr>(&WaypostConfig::default())
            .update_stations_at(100, at(1))
            .await
            .unwrap();
        assert_eq!(update.processed, 1);
    }

    #[tokio::test]
    async fn queue_failure_surfaces_as_error() {
        let h = Harness::new();
        h.queue.set_failing(true);
        let result = h
            .updater::<MacAddr>(&WaypostConfig::default())
            .update_stations_at(100, at(1))
            .await;
        assert!(matches!(result, Err(StationError::Db(DbError::Unavailable(_)))));
    }
}
