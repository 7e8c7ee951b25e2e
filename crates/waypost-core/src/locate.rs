//! Position resolution: turns a [`LocateQuery`] into a position.
//!
//! Sources are tried in priority order and the first one that produces a
//! position wins:
//!
//! 1. [`CellPositionSource`] -- individual cells, then their location areas
//!    as a coarse fallback.
//! 2. [`WifiPositionSource`] -- WiFi access points.
//!
//! A source whose observations are absent from the query is skipped
//! without touching storage. Storage failures and timeouts are handed to
//! an [`ErrorReporter`] and the source counts as empty, so resolution
//! itself never fails.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use waypost_db::{DbError, StationStore};
use waypost_geo::Estimate;
use waypost_types::{
    AreaRecord, CellAreaKey, Fallback, LocateQuery, LocateResponse, Position, Provenance,
    StationKey, StationRecord,
};

use crate::blocklist::BlocklistPolicy;
use crate::cluster::{Candidate, ClusterEngine};
use crate::config::{LookupConfig, WaypostConfig};

// =========================================================================
// Error reporting
// =========================================================================

/// Why a source lookup produced no data.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The store returned an error.
    #[error("storage lookup failed: {0}")]
    Storage(#[from] DbError),

    /// The store did not answer in time.
    #[error("storage lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Receives lookup failures swallowed during resolution.
pub trait ErrorReporter: Send + Sync {
    /// Record that a lookup for `source` failed.
    fn report(&self, source: Provenance, error: &LookupError);
}

/// Reports lookup failures as `tracing` error events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, source: Provenance, error: &LookupError) {
        tracing::error!(?source, error = %error, "Position source lookup failed");
    }
}

// =========================================================================
// Sources
// =========================================================================

/// A positioning source consulted by the [`Resolver`].
pub trait PositionSource: Send + Sync {
    /// Whether the query carries anything this source can use.
    fn should_search(&self, query: &LocateQuery) -> bool;

    /// Resolve the query, treating stations as blocked per `today`.
    fn search(
        &self,
        query: &LocateQuery,
        today: NaiveDate,
    ) -> impl Future<Output = Option<Position>> + Send;
}

/// Bounded, failure-tolerant reads shared by the sources.
struct StationLookup<S, R> {
    store: Arc<S>,
    reporter: Arc<R>,
    config: LookupConfig,
    policy: BlocklistPolicy,
}

impl<S: StationStore, R: ErrorReporter> StationLookup<S, R> {
    /// Usable stations for `keys`: positioned and not blocked on `today`.
    async fn stations<K: StationKey>(
        &self,
        source: Provenance,
        keys: &[K],
        today: NaiveDate,
    ) -> Vec<StationRecord<K>> {
        let deadline = self.config.lookup_timeout();
        let loaded = match tokio::time::timeout(deadline, self.store.load_stations(keys)).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                self.reporter.report(source, &LookupError::Storage(e));
                return Vec::new();
            }
            Err(_elapsed) => {
                self.reporter.report(source, &LookupError::Timeout(deadline));
                return Vec::new();
            }
        };

        loaded
            .into_iter()
            .filter(|r| r.is_active() && !self.policy.state_of(r, today).is_blocked())
            .collect()
    }

    async fn areas(&self, keys: &[CellAreaKey]) -> Vec<AreaRecord> {
        let deadline = self.config.lookup_timeout();
        match tokio::time::timeout(deadline, self.store.load_areas(keys)).await {
            Ok(Ok(areas)) => areas,
            Ok(Err(e)) => {
                self.reporter.report(Provenance::CellArea, &LookupError::Storage(e));
                Vec::new()
            }
            Err(_elapsed) => {
                self.reporter
                    .report(Provenance::CellArea, &LookupError::Timeout(deadline));
                Vec::new()
            }
        }
    }

    /// Merge duplicate keys, keeping the strongest signal, and bound the
    /// result to `max_lookups` keys.
    fn bounded<K: Ord>(&self, entries: impl IntoIterator<Item = (K, Option<i16>)>) -> BTreeMap<K, Option<i16>> {
        let mut merged: BTreeMap<K, Option<i16>> = BTreeMap::new();
        for (key, signal) in entries {
            merged
                .entry(key)
                .and_modify(|existing| *existing = (*existing).max(signal))
                .or_insert(signal);
        }
        while merged.len() > self.config.max_lookups {
            merged.pop_last();
        }
        merged
    }
}

fn candidates<K: StationKey>(
    stations: &[StationRecord<K>],
    signals: &BTreeMap<K, Option<i16>>,
) -> Vec<Candidate<K>> {
    stations
        .iter()
        .filter_map(|s| Candidate::from_station(s, signals.get(&s.key).copied().flatten()))
        .collect()
}

const fn precise(estimate: Estimate, provenance: Provenance) -> Position {
    Position {
        lat: estimate.lat,
        lon: estimate.lon,
        accuracy: estimate.accuracy,
        provenance,
        fallback: None,
    }
}

/// Cell towers, falling back to their location areas.
pub struct CellPositionSource<S, R> {
    lookup: StationLookup<S, R>,
    engine: ClusterEngine,
    area_min: f64,
}

impl<S: StationStore, R: ErrorReporter> CellPositionSource<S, R> {
    /// Build the source over `store`.
    pub fn new(store: Arc<S>, reporter: Arc<R>, config: &WaypostConfig) -> Self {
        Self {
            lookup: StationLookup {
                store,
                reporter,
                config: config.lookup.clone(),
                policy: BlocklistPolicy::new(&config.blocklist),
            },
            engine: ClusterEngine::new(&config.cluster, &config.accuracy),
            area_min: config.accuracy.area_min,
        }
    }

    async fn by_cells(&self, query: &LocateQuery, today: NaiveDate) -> Option<Position> {
        let signals = self
            .lookup
            .bounded(query.cells.iter().map(|c| (c.key, c.signal)));
        if signals.is_empty() {
            return None;
        }
        let keys: Vec<_> = signals.keys().copied().collect();
        let stations = self.lookup.stations(Provenance::Cell, &keys, today).await;
        self.engine
            .locate_cells(candidates(&stations, &signals))
            .map(|estimate| precise(estimate, Provenance::Cell))
    }

    async fn by_area(&self, query: &LocateQuery) -> Option<Position> {
        let bounded = self.lookup.bounded(query.area_keys().into_iter().map(|a| (a, None)));
        if bounded.is_empty() {
            return None;
        }
        let keys: Vec<CellAreaKey> = bounded.into_keys().collect();
        let areas = self.lookup.areas(&keys).await;

        let best = areas
            .into_iter()
            .filter(|a| a.lat.is_finite() && a.lon.is_finite() && a.range.is_finite())
            .min_by(|a, b| a.range.total_cmp(&b.range).then_with(|| a.key.cmp(&b.key)))?;

        Some(Position {
            lat: best.lat,
            lon: best.lon,
            accuracy: best.range.max(self.area_min),
            provenance: Provenance::CellArea,
            fallback: Some(Fallback::Lacf),
        })
    }
}

impl<S: StationStore, R: ErrorReporter> PositionSource for CellPositionSource<S, R> {
    fn should_search(&self, query: &LocateQuery) -> bool {
        !query.cells.is_empty() || !query.areas.is_empty()
    }

    async fn search(&self, query: &LocateQuery, today: NaiveDate) -> Option<Position> {
        if let Some(position) = self.by_cells(query, today).await {
            return Some(position);
        }
        self.by_area(query).await
    }
}

/// WiFi access points.
pub struct WifiPositionSource<S, R> {
    lookup: StationLookup<S, R>,
    engine: ClusterEngine,
    min_cluster: usize,
}

impl<S: StationStore, R: ErrorReporter> WifiPositionSource<S, R> {
    /// Build the source over `store`.
    pub fn new(store: Arc<S>, reporter: Arc<R>, config: &WaypostConfig) -> Self {
        Self {
            lookup: StationLookup {
                store,
                reporter,
                config: config.lookup.clone(),
                policy: BlocklistPolicy::new(&config.blocklist),
            },
            engine: ClusterEngine::new(&config.cluster, &config.accuracy),
            min_cluster: config.cluster.min_wifi_cluster,
        }
    }
}

impl<S: StationStore, R: ErrorReporter> PositionSource for WifiPositionSource<S, R> {
    fn should_search(&self, query: &LocateQuery) -> bool {
        !query.wifis.is_empty()
    }

    async fn search(&self, query: &LocateQuery, today: NaiveDate) -> Option<Position> {
        let signals = self
            .lookup
            .bounded(query.wifis.iter().map(|w| (w.mac, w.signal)));
        // Too few distinct access points can never form a usable cluster.
        if signals.len() < self.min_cluster {
            return None;
        }
        let keys: Vec<_> = signals.keys().copied().collect();
        let stations = self.lookup.stations(Provenance::Wifi, &keys, today).await;
        self.engine
            .locate_wifis(candidates(&stations, &signals))
            .map(|estimate| precise(estimate, Provenance::Wifi))
    }
}

// =========================================================================
// Resolver
// =========================================================================

async fn attempt<P: PositionSource>(source: &P, query: &LocateQuery, today: NaiveDate) -> Option<Position> {
    if !source.should_search(query) {
        return None;
    }
    source.search(query, today).await
}

/// Resolves queries against the station store.
pub struct Resolver<S, R = TracingReporter> {
    cells: CellPositionSource<S, R>,
    wifis: WifiPositionSource<S, R>,
}

impl<S: StationStore> Resolver<S, TracingReporter> {
    /// A resolver that reports lookup failures through `tracing`.
    pub fn new(store: Arc<S>, config: &WaypostConfig) -> Self {
        Self::with_reporter(store, Arc::new(TracingReporter), config)
    }
}

impl<S: StationStore, R: ErrorReporter> Resolver<S, R> {
    /// A resolver with a custom failure reporter.
    pub fn with_reporter(store: Arc<S>, reporter: Arc<R>, config: &WaypostConfig) -> Self {
        Self {
            cells: CellPositionSource::new(Arc::clone(&store), Arc::clone(&reporter), config),
            wifis: WifiPositionSource::new(store, reporter, config),
        }
    }

    /// Resolve `query` into its wire response.
    pub async fn resolve(&self, query: &LocateQuery) -> LocateResponse {
        self.position(query, Utc::now().date_naive()).await.into()
    }

    /// Resolve `query`, judging blocklist state as of `today`.
    pub async fn position(&self, query: &LocateQuery, today: NaiveDate) -> Option<Position> {
        let position = match attempt(&self.cells, query, today).await {
            Some(position) => Some(position),
            None => attempt(&self.wifis, query, today).await,
        };

        match &position {
            Some(p) => tracing::debug!(
                provenance = ?p.provenance,
                accuracy = p.accuracy,
                "Resolved position"
            ),
            None => tracing::debug!(
                cells = query.cells.len(),
                wifis = query.wifis.len(),
                "No position for query"
            ),
        }
        position
    }
}
