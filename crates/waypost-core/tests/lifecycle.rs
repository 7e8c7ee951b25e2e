//! End-to-end pipeline tests against the in-memory store and queue.
//!
//! Observations enter through the ingestion filter, are folded in by the
//! task runner with a simulated clock, and are read back through the
//! resolver.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use waypost_core::config::WaypostConfig;
use waypost_core::ingest::{Ingestor, ValidKey};
use waypost_core::locate::Resolver;
use waypost_core::station::StationUpdate;
use waypost_core::tasks::{Task, TaskOutcome, TaskRunner};
use waypost_db::{MemoryQueue, MemoryStore, WorkQueue};
use waypost_types::{
    CellKey, CellLookup, LocateQuery, MacAddr, Observation, Provenance, Radio, WifiLookup,
};

// =============================================================================
// Helpers
// =============================================================================

struct Pipeline {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    ingestor: Ingestor<MemoryQueue>,
    runner: TaskRunner<MemoryStore, MemoryQueue>,
    resolver: Resolver<MemoryStore>,
}

impl Pipeline {
    fn new() -> Self {
        let config = WaypostConfig::default();
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        Self {
            ingestor: Ingestor::new(Arc::clone(&queue)),
            runner: TaskRunner::new(Arc::clone(&store), Arc::clone(&queue), &config),
            resolver: Resolver::new(Arc::clone(&store), &config),
            store,
            queue,
        }
    }

    async fn observe<K: ValidKey>(&self, key: K, lat: f64, lon: f64, at: DateTime<Utc>) {
        let report = self
            .ingestor
            .submit(vec![Observation::new(key, lat, lon).with_time(at)])
            .await
            .unwrap();
        assert_eq!(report.accepted, 1);
    }

    async fn update(&self, task: Task, now: DateTime<Utc>) -> StationUpdate {
        match self.runner.run_at(&task, now).await.unwrap() {
            TaskOutcome::Stations(update) => update,
            TaskOutcome::Areas(_) => StationUpdate::default(),
        }
    }
}

fn month_start(month: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(2023, 1, 1)
        .unwrap()
        .checked_add_days(Days::new(u64::from(month).saturating_mul(30)))
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
        .and_utc()
}

fn cell_key() -> CellKey {
    CellKey {
        radio: Radio::Gsm,
        mcc: 208,
        mnc: 10,
        lac: 512,
        cid: 77,
    }
}

// =============================================================================
// Blocklist lifecycle
// =============================================================================

#[tokio::test]
async fn moving_wifi_is_blocked_temporarily_then_permanently() {
    let pipeline = Pipeline::new();
    let mac = MacAddr::from_u64(0x00aa_bbcc_0001);

    for month in 0..24_u32 {
        let now = month_start(month);
        // Even months near Madrid, odd months 111 km further north.
        let lat = if month % 2 == 0 { 40.0 } else { 41.0 };
        pipeline.observe(mac, lat, -3.7, now).await;

        let update = pipeline.update(Task::UpdateWifis { batch: 100 }, now).await;
        let expected = match month {
            0..=11 if month % 2 == 0 => (1, 0),
            0..=11 => (1, 1),
            _ => (0, 0),
        };
        assert_eq!((update.processed, update.moved), expected, "month {month}");

        let record = pipeline.store.station(&mac).await.unwrap().unwrap();
        if month < 12 && month % 2 == 0 {
            assert!(record.is_active(), "month {month}");
        } else {
            assert!(!record.is_active(), "month {month}");
        }
        assert_eq!(record.block_count, month.saturating_add(1).min(12) / 2, "month {month}");
    }

    let record = pipeline.store.station(&mac).await.unwrap().unwrap();
    assert_eq!(record.block_count, 6);
    assert_eq!(record.block_last, Some(month_start(11).date_naive()));
}

#[tokio::test]
async fn temporary_block_rejects_until_decayed() {
    let pipeline = Pipeline::new();
    let mac = MacAddr::from_u64(0x00aa_bbcc_0002);
    let day = |n: u64| month_start(0).checked_add_days(Days::new(n)).unwrap();

    pipeline.observe(mac, 48.85, 2.35, day(0)).await;
    pipeline.update(Task::UpdateWifis { batch: 10 }, day(0)).await;
    pipeline.observe(mac, 49.85, 2.35, day(1)).await;
    let moved = pipeline.update(Task::UpdateWifis { batch: 10 }, day(1)).await;
    assert_eq!(moved.moved, 1);

    // Within the decay window the observation is dropped.
    pipeline.observe(mac, 48.85, 2.35, day(5)).await;
    let blocked = pipeline.update(Task::UpdateWifis { batch: 10 }, day(5)).await;
    assert_eq!(blocked.processed, 0);
    assert!(!pipeline.store.station(&mac).await.unwrap().unwrap().is_active());

    // After it the station is recreated from scratch.
    pipeline.observe(mac, 48.85, 2.35, day(9)).await;
    let accepted = pipeline.update(Task::UpdateWifis { batch: 10 }, day(9)).await;
    assert_eq!((accepted.processed, accepted.moved), (1, 0));
    let record = pipeline.store.station(&mac).await.unwrap().unwrap();
    assert_eq!(record.total_measures, 1);
    assert_eq!(record.block_count, 1);
}

#[tokio::test]
async fn moving_cell_takes_its_area_down() {
    let pipeline = Pipeline::new();
    let key = cell_key();

    pipeline.observe(key, 45.0, 5.0, month_start(0)).await;
    pipeline.update(Task::UpdateCells { batch: 10 }, month_start(0)).await;
    pipeline
        .runner
        .run_at(&Task::ScanAreas { batch: 10 }, month_start(0))
        .await
        .unwrap();
    assert!(pipeline.store.area(&key.area_key()).await.unwrap().is_some());

    // Both positions sit about 165 km from their midpoint, past the cell
    // movement threshold.
    pipeline.observe(key, 48.0, 5.0, month_start(1)).await;
    let update = pipeline.update(Task::UpdateCells { batch: 10 }, month_start(1)).await;
    assert_eq!(update.moved, 1);

    pipeline
        .runner
        .run_at(&Task::ScanAreas { batch: 10 }, month_start(1))
        .await
        .unwrap();
    assert!(pipeline.store.area(&key.area_key()).await.unwrap().is_none());
    assert_eq!(pipeline.queue.pending_areas().await.unwrap(), 0);
}

// =============================================================================
// Idempotency and resolution
// =============================================================================

#[tokio::test]
async fn resubmitted_batch_does_not_double_count() {
    let pipeline = Pipeline::new();
    let mac = MacAddr::from_u64(0x00aa_bbcc_0003);
    let batch: Vec<Observation<MacAddr>> = (0..3_u64)
        .map(|i| {
            Observation::new(mac, 52.52, 13.405)
                .with_time(month_start(0).checked_add_days(Days::new(i)).unwrap())
        })
        .collect();

    pipeline.ingestor.submit(batch.clone()).await.unwrap();
    pipeline.update(Task::UpdateWifis { batch: 100 }, month_start(0)).await;
    pipeline.ingestor.submit(batch).await.unwrap();
    let second = pipeline.update(Task::UpdateWifis { batch: 100 }, month_start(0)).await;

    assert_eq!(second.processed, 0);
    let record = pipeline.store.station(&mac).await.unwrap().unwrap();
    assert_eq!(record.total_measures, 3);
    assert_eq!(record.new_measures, 3);
}

#[tokio::test]
async fn ingested_stations_resolve_queries() {
    let pipeline = Pipeline::new();
    let first = MacAddr::from_u64(0x00aa_bbcc_0010);
    let second = MacAddr::from_u64(0x00aa_bbcc_1020);
    let now = month_start(0);

    pipeline
        .ingestor
        .submit(vec![
            Observation::new(first, 35.6895, 139.6917).with_accuracy(15.0).with_time(now),
            Observation::new(second, 35.6897, 139.6917).with_accuracy(15.0).with_time(now),
        ])
        .await
        .unwrap();
    pipeline.observe(cell_key(), 35.69, 139.69, now).await;
    pipeline.update(Task::UpdateWifis { batch: 100 }, now).await;

    let wifi_query = LocateQuery::new(
        vec![CellLookup { key: cell_key(), signal: None }],
        vec![
            WifiLookup { mac: first, signal: Some(-55) },
            WifiLookup { mac: second, signal: Some(-75) },
        ],
    );
    // The cell has not been folded in yet, so WiFi answers.
    let position = pipeline.resolver.position(&wifi_query, now.date_naive()).await.unwrap();
    assert_eq!(position.provenance, Provenance::Wifi);
    assert!((position.accuracy - 100.0).abs() < 1e-9);
    assert!(position.lat > 35.6895 && position.lat < 35.6897);

    pipeline.update(Task::UpdateCells { batch: 100 }, now).await;
    let position = pipeline.resolver.position(&wifi_query, now.date_naive()).await.unwrap();
    assert_eq!(position.provenance, Provenance::Cell);
    assert!((position.accuracy - 1_000.0).abs() < 1e-9);
}
