//! Area updater: recomputes location-area aggregates from their cells.
//!
//! An area's position is the centroid of its positioned cells. Its range
//! covers every cell's full circle, so it is the largest
//! `distance(center, cell) + cell.range`, floored at the area minimum. An
//! area left without positioned cells is deleted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use waypost_db::{DbError, StationStore, StationTx, WorkQueue};
use waypost_geo::{Circle, GeoError, Point, distance, weighted_centroid};
use waypost_types::{AreaRecord, CellAreaKey};

use crate::config::WaypostConfig;

/// Errors that abort an area update run.
#[derive(Debug, thiserror::Error)]
pub enum AreaError {
    /// Storage or queue failure.
    #[error("area storage error: {0}")]
    Db(#[from] DbError),

    /// Cell positions could not be aggregated.
    #[error("cannot aggregate cells for area {area}: {source}")]
    Geometry {
        /// The area being updated.
        area: CellAreaKey,
        /// The underlying geometry error.
        source: GeoError,
    },
}

/// Result of one area run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AreaUpdate {
    /// Areas recomputed and saved.
    pub updated: usize,
    /// Areas deleted for lack of cells.
    pub removed: usize,
    /// Area keys still pending after the claim.
    pub remaining: usize,
    /// Whether more than a full batch is still pending.
    pub follow_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AreaOutcome {
    Saved,
    Deleted,
    /// No cells and no row; nothing to do.
    Absent,
}

/// Recomputes areas inside one transaction each.
pub struct AreaUpdater<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    area_min: f64,
}

impl<S: StationStore, Q: WorkQueue> AreaUpdater<S, Q> {
    /// Build an area updater.
    pub fn new(store: Arc<S>, queue: Arc<Q>, config: &WaypostConfig) -> Self {
        Self {
            store,
            queue,
            area_min: config.accuracy.area_min,
        }
    }

    /// Recompute the given areas.
    ///
    /// # Errors
    ///
    /// Returns [`AreaError`] on the first area that cannot be updated.
    /// Areas committed before it stay committed.
    pub async fn update_areas(&self, keys: &[CellAreaKey]) -> Result<AreaUpdate, AreaError> {
        self.update_areas_at(keys, Utc::now()).await
    }

    /// As [`update_areas`](Self::update_areas) with an explicit clock.
    ///
    /// # Errors
    ///
    /// As [`update_areas`](Self::update_areas).
    pub async fn update_areas_at(
        &self,
        keys: &[CellAreaKey],
        now: DateTime<Utc>,
    ) -> Result<AreaUpdate, AreaError> {
        let mut keys = keys.to_vec();
        keys.sort_unstable();
        keys.dedup();

        let mut update = AreaUpdate::default();
        for key in &keys {
            match self.update_area(key, now).await? {
                AreaOutcome::Saved => update.updated = update.updated.saturating_add(1),
                AreaOutcome::Deleted => update.removed = update.removed.saturating_add(1),
                AreaOutcome::Absent => {}
            }
        }

        tracing::info!(
            areas = keys.len(),
            updated = update.updated,
            removed = update.removed,
            "Area update complete"
        );
        Ok(update)
    }

    /// Claim up to `batch` scheduled areas and recompute them.
    ///
    /// # Errors
    ///
    /// As [`update_areas`](Self::update_areas), plus queue failures.
    pub async fn scan_areas(&self, batch: usize) -> Result<AreaUpdate, AreaError> {
        self.scan_areas_at(batch, Utc::now()).await
    }

    /// As [`scan_areas`](Self::scan_areas) with an explicit clock.
    ///
    /// # Errors
    ///
    /// As [`scan_areas`](Self::scan_areas).
    pub async fn scan_areas_at(&self, batch: usize, now: DateTime<Utc>) -> Result<AreaUpdate, AreaError> {
        let keys = self.queue.claim_areas(batch).await?;
        let mut update = self.update_areas_at(&keys, now).await?;
        update.remaining = self.queue.pending_areas().await?;
        update.follow_up = update.remaining > batch;
        Ok(update)
    }

    async fn update_area(&self, key: &CellAreaKey, now: DateTime<Utc>) -> Result<AreaOutcome, AreaError> {
        let mut tx = self.store.begin().await?;
        let existing = tx.lock_area(key).await?;
        let cells = tx.area_cells(key).await?;

        let circles: Vec<Circle> = cells
            .iter()
            .filter_map(|c| c.location.map(|loc| Circle::new(loc.lat, loc.lon, loc.range)))
            .collect();

        if circles.is_empty() {
            if existing.is_none() {
                return Ok(AreaOutcome::Absent);
            }
            tx.delete_area(key).await?;
            tx.commit().await?;
            tracing::debug!(area = %key, "Removed empty area");
            return Ok(AreaOutcome::Deleted);
        }

        let center = weighted_centroid(&circles, self.area_min)
            .map_err(|source| AreaError::Geometry { area: *key, source })?
            .center();
        let range = circles
            .iter()
            .map(|c| distance(center, Point::new(c.lat, c.lon)) + c.radius)
            .fold(self.area_min, f64::max);
        let avg_cell_range =
            circles.iter().map(|c| c.radius).sum::<f64>() / circles.len() as f64;

        let area = AreaRecord {
            key: *key,
            lat: center.lat,
            lon: center.lon,
            range,
            num_cells: u32::try_from(circles.len()).unwrap_or(u32::MAX),
            avg_cell_range,
            created: existing.map_or(now, |a| a.created),
            modified: now,
        };
        tx.save_area(&area).await?;
        tx.commit().await?;

        tracing::debug!(area = %key, num_cells = area.num_cells, range, "Area recomputed");
        Ok(AreaOutcome::Saved)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use waypost_db::{MemoryQueue, MemoryStore};
    use waypost_types::{CellKey, Radio, StationLocation, StationRecord};

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn cell(cid: u32) -> CellKey {
        CellKey {
            radio: Radio::Gsm,
            mcc: 234,
            mnc: 15,
            lac: 300,
            cid,
        }
    }

    fn positioned(cid: u32, lat: f64, lon: f64, range: f64) -> StationRecord<CellKey> {
        let mut record = StationRecord::new(cell(cid), at(0));
        record.location = Some(StationLocation { lat, lon, range });
        record
    }

    fn updater(store: &Arc<MemoryStore>, queue: &Arc<MemoryQueue>) -> AreaUpdater<MemoryStore, MemoryQueue> {
        AreaUpdater::new(Arc::clone(store), Arc::clone(queue), &WaypostConfig::default())
    }

    #[tokio::test]
    async fn area_covers_its_cells() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store
            .insert_stations(&[
                positioned(1, 51.0, 0.0, 3_000.0),
                positioned(2, 51.3, 0.0, 3_000.0),
                StationRecord::new(cell(3), at(0)),
            ])
            .await;

        let update = updater(&store, &queue)
            .update_areas_at(&[cell(1).area_key()], at(10))
            .await
            .unwrap();
        assert_eq!(update.updated, 1);

        let area = store.area(&cell(1).area_key()).await.unwrap().unwrap();
        assert!((area.lat - 51.15).abs() < 1e-6);
        assert_eq!(area.num_cells, 2);
        assert!((area.avg_cell_range - 3_000.0).abs() < 1e-9);
        // Half the 33 km spread plus one cell range stays under the floor.
        assert!((area.range - 20_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn wide_area_range_exceeds_floor() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store
            .insert_stations(&[positioned(1, 51.0, 0.0, 5_000.0), positioned(2, 52.0, 0.0, 5_000.0)])
            .await;

        updater(&store, &queue)
            .update_areas_at(&[cell(1).area_key()], at(10))
            .await
            .unwrap();

        let area = store.area(&cell(1).area_key()).await.unwrap().unwrap();
        let half_spread = distance(Point::new(51.0, 0.0), Point::new(51.5, 0.0));
        assert!((area.range - (half_spread + 5_000.0)).abs() < 1.0);
    }

    #[tokio::test]
    async fn recompute_keeps_creation_time() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store.insert_stations(&[positioned(1, 51.0, 0.0, 1_000.0)]).await;
        let areas = updater(&store, &queue);

        areas.update_areas_at(&[cell(1).area_key()], at(10)).await.unwrap();
        areas.update_areas_at(&[cell(1).area_key()], at(20)).await.unwrap();

        let area = store.area(&cell(1).area_key()).await.unwrap().unwrap();
        assert_eq!(area.created, at(10));
        assert_eq!(area.modified, at(20));
        assert!((area.range - 20_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn area_without_cells_is_deleted() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store.insert_stations(&[positioned(1, 51.0, 0.0, 1_000.0)]).await;
        let areas = updater(&store, &queue);
        areas.update_areas_at(&[cell(1).area_key()], at(10)).await.unwrap();

        store.insert_stations(&[StationRecord::new(cell(1), at(0))]).await;
        let update = areas.update_areas_at(&[cell(1).area_key()], at(20)).await.unwrap();

        assert_eq!(update.removed, 1);
        assert!(store.area(&cell(1).area_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_claims_scheduled_areas() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store.insert_stations(&[positioned(1, 51.0, 0.0, 1_000.0)]).await;
        let other = CellKey { lac: 301, ..cell(1) }.area_key();
        queue.schedule_areas(&[cell(1).area_key(), other]).await.unwrap();

        let update = updater(&store, &queue).scan_areas(1).await.unwrap();
        assert_eq!(update.updated.saturating_add(update.removed), 1);
        assert_eq!(update.remaining, 1);
        assert!(!update.follow_up);

        let update = updater(&store, &queue).scan_areas(10).await.unwrap();
        assert_eq!(update.remaining, 0);
        assert!(store.area(&cell(1).area_key()).await.unwrap().is_some());
        assert!(store.area(&other).await.unwrap().is_none());
    }
}
