//! In-memory implementations of the storage and queue traits.
//!
//! Used by unit tests across the workspace and for running the pipeline
//! without infrastructure. Transactions take an exclusive lock on the whole
//! store and work on a copy that replaces the shared state on commit, so
//! an uncommitted transaction leaves no trace.
//!
//! Both types count read calls and can be switched into a failing mode to
//! exercise degraded paths.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard};
use waypost_types::{
    AreaRecord, CellAreaKey, CellKey, CellStation, Observation, RetainedObservation, StationKey,
    StationKind, StationRecord,
};

use crate::error::DbError;
use crate::queue::{WorkQueue, decode_areas, decode_claimed, observation_queue};
use crate::store::{AreaRow, StationRow, StationStore, StationTx};

// =========================================================================
// Station store
// =========================================================================

#[derive(Debug, Clone, Default)]
struct MemoryState {
    stations: BTreeMap<(StationKind, String), StationRow>,
    retained: BTreeMap<(StationKind, String), Vec<RetainedObservation>>,
    areas: BTreeMap<String, AreaRow>,
}

/// A station store held entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    lookups: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read calls ([`load_stations`](StationStore::load_stations)
    /// and [`load_areas`](StationStore::load_areas)) issued so far.
    pub fn lookup_calls(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Make every subsequent operation fail with [`DbError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Read a station outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Key`] if the stored key is malformed.
    pub async fn station<K: StationKey>(&self, key: &K) -> Result<Option<StationRecord<K>>, DbError> {
        let state = self.state.lock().await;
        state
            .stations
            .get(&(K::KIND, key.to_string()))
            .cloned()
            .map(StationRow::into_record)
            .transpose()
    }

    /// Number of retained observations for a station.
    pub async fn retained_count<K: StationKey>(&self, key: &K) -> usize {
        let state = self.state.lock().await;
        state
            .retained
            .get(&(K::KIND, key.to_string()))
            .map_or(0, Vec::len)
    }

    /// Read an area outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Key`] if the stored key is malformed.
    pub async fn area(&self, key: &CellAreaKey) -> Result<Option<AreaRecord>, DbError> {
        let state = self.state.lock().await;
        state
            .areas
            .get(&key.to_string())
            .cloned()
            .map(AreaRow::into_record)
            .transpose()
    }

    /// Write stations directly, bypassing the pipeline.
    pub async fn insert_stations<K: StationKey>(&self, records: &[StationRecord<K>]) {
        let mut state = self.state.lock().await;
        for record in records {
            state
                .stations
                .insert((K::KIND, record.key.to_string()), StationRow::from_record(record));
        }
    }

    /// Write areas directly, bypassing the pipeline.
    pub async fn insert_areas(&self, areas: &[AreaRecord]) {
        let mut state = self.state.lock().await;
        for area in areas {
            state.areas.insert(area.key.to_string(), AreaRow::from_record(area));
        }
    }

    fn check(&self) -> Result<(), DbError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("memory store is failing".to_owned()));
        }
        Ok(())
    }
}

impl StationStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, DbError> {
        self.check()?;
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = MemoryState::clone(&guard);
        Ok(MemoryTx { guard, working })
    }

    async fn load_stations<K: StationKey>(&self, keys: &[K]) -> Result<Vec<StationRecord<K>>, DbError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let state = self.state.lock().await;
        let wanted: BTreeSet<String> = keys.iter().map(ToString::to_string).collect();
        wanted
            .into_iter()
            .filter_map(|key| state.stations.get(&(K::KIND, key)).cloned())
            .map(StationRow::into_record)
            .collect()
    }

    async fn load_areas(&self, keys: &[CellAreaKey]) -> Result<Vec<AreaRecord>, DbError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let state = self.state.lock().await;
        let wanted: BTreeSet<String> = keys.iter().map(ToString::to_string).collect();
        wanted
            .into_iter()
            .filter_map(|key| state.areas.get(&key).cloned())
            .map(AreaRow::into_record)
            .collect()
    }
}

/// A transaction over a [`MemoryStore`].
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl StationTx for MemoryTx {
    async fn lock_station<K: StationKey>(&mut self, key: &K) -> Result<Option<StationRecord<K>>, DbError> {
        self.working
            .stations
            .get(&(K::KIND, key.to_string()))
            .cloned()
            .map(StationRow::into_record)
            .transpose()
    }

    async fn save_station<K: StationKey>(&mut self, record: &StationRecord<K>) -> Result<(), DbError> {
        self.working
            .stations
            .insert((K::KIND, record.key.to_string()), StationRow::from_record(record));
        Ok(())
    }

    async fn retain_observations<K: StationKey>(
        &mut self,
        key: &K,
        observations: &[RetainedObservation],
        limit: usize,
    ) -> Result<usize, DbError> {
        let retained = self
            .working
            .retained
            .entry((K::KIND, key.to_string()))
            .or_default();

        let mut inserted = 0_usize;
        for obs in observations {
            if retained.iter().any(|r| r.fingerprint == obs.fingerprint) {
                continue;
            }
            retained.push(obs.clone());
            inserted = inserted.saturating_add(1);
        }

        // Stable sort keeps insertion order among equal timestamps.
        retained.sort_by_key(|r| r.received);
        let excess = retained.len().saturating_sub(limit);
        if excess > 0 {
            retained.drain(..excess);
        }
        Ok(inserted)
    }

    async fn retained_observations<K: StationKey>(
        &mut self,
        key: &K,
    ) -> Result<Vec<RetainedObservation>, DbError> {
        Ok(self
            .working
            .retained
            .get(&(K::KIND, key.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_observations<K: StationKey>(&mut self, key: &K) -> Result<(), DbError> {
        self.working.retained.remove(&(K::KIND, key.to_string()));
        Ok(())
    }

    async fn area_cells(&mut self, area: &CellAreaKey) -> Result<Vec<CellStation>, DbError> {
        let area_key = area.to_string();
        self.working
            .stations
            .iter()
            .filter(|((kind, _), row)| {
                *kind == CellKey::KIND
                    && row.area_key.as_deref() == Some(area_key.as_str())
                    && row.lat.is_some()
                    && row.lon.is_some()
            })
            .map(|(_, row)| row.clone().into_record())
            .collect()
    }

    async fn lock_area(&mut self, key: &CellAreaKey) -> Result<Option<AreaRecord>, DbError> {
        self.working
            .areas
            .get(&key.to_string())
            .cloned()
            .map(AreaRow::into_record)
            .transpose()
    }

    async fn save_area(&mut self, area: &AreaRecord) -> Result<(), DbError> {
        self.working
            .areas
            .insert(area.key.to_string(), AreaRow::from_record(area));
        Ok(())
    }

    async fn delete_area(&mut self, key: &CellAreaKey) -> Result<(), DbError> {
        self.working.areas.remove(&key.to_string());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), DbError> {
        *self.guard = self.working;
        Ok(())
    }
}

// =========================================================================
// Work queue
// =========================================================================

#[derive(Debug, Default)]
struct QueueState {
    observations: BTreeMap<String, VecDeque<String>>,
    areas: BTreeSet<String>,
}

/// A work queue held entirely in memory.
///
/// Observations are stored as JSON, exactly as they travel through
/// `Dragonfly`. Area claims return keys in sorted order.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    failing: Arc<AtomicBool>,
}

impl MemoryQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with [`DbError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Push a raw payload, bypassing serialization.
    pub async fn push_raw(&self, kind: StationKind, payload: &str) {
        let mut state = self.state.lock().await;
        state
            .observations
            .entry(observation_queue(kind))
            .or_default()
            .push_back(payload.to_owned());
    }

    fn check(&self) -> Result<(), DbError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("memory queue is failing".to_owned()));
        }
        Ok(())
    }
}

impl WorkQueue for MemoryQueue {
    async fn push_observations<K: StationKey>(
        &self,
        observations: &[Observation<K>],
    ) -> Result<usize, DbError> {
        self.check()?;
        let payloads = observations
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<String>, _>>()?;
        let count = payloads.len();
        let mut state = self.state.lock().await;
        state
            .observations
            .entry(observation_queue(K::KIND))
            .or_default()
            .extend(payloads);
        Ok(count)
    }

    async fn claim_observations<K: StationKey>(&self, count: usize) -> Result<Vec<Observation<K>>, DbError> {
        self.check()?;
        let queue = observation_queue(K::KIND);
        let mut state = self.state.lock().await;
        let raw: Vec<String> = state.observations.get_mut(&queue).map_or_else(Vec::new, |q| {
            let take = count.min(q.len());
            q.drain(..take).collect()
        });
        drop(state);
        Ok(decode_claimed(&queue, &raw))
    }

    async fn pending_observations(&self, kind: StationKind) -> Result<usize, DbError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .observations
            .get(&observation_queue(kind))
            .map_or(0, VecDeque::len))
    }

    async fn schedule_areas(&self, keys: &[CellAreaKey]) -> Result<(), DbError> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.areas.extend(keys.iter().map(ToString::to_string));
        Ok(())
    }

    async fn claim_areas(&self, count: usize) -> Result<Vec<CellAreaKey>, DbError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let mut raw = Vec::with_capacity(count.min(state.areas.len()));
        while raw.len() < count {
            let Some(key) = state.areas.pop_first() else {
                break;
            };
            raw.push(key);
        }
        drop(state);
        Ok(decode_areas(&raw))
    }

    async fn pending_areas(&self) -> Result<usize, DbError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.areas.len())
    }
}
