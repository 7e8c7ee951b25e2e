//! Cluster engine: picks the best-supported group of stations in a query.
//!
//! Candidates are the stations a query matched, each with its stored
//! circle and the signal strength the device reported. Grouping depends on
//! the mode:
//!
//! - **Cell**: one cluster per location area.
//! - **WiFi**: connected components of the "linked" relation. Two access
//!   points are linked when they are closer than `cluster_meters` or their
//!   MACs differ in fewer than `bit_distance_threshold` bits.
//!
//! Clusters are ranked by member count, then by the smallest member range,
//! then (WiFi only) by summed signal, then by the smallest member key.
//! Candidates are sorted by key before grouping, so the outcome never
//! depends on input order.
//!
//! Inside the winning cluster, members farther than the mode's outlier
//! distance from the first-pass centroid are dropped and the centroid is
//! recomputed over the rest.

use core::cmp::Ordering;
use std::collections::BTreeMap;

use waypost_geo::{Circle, Estimate, GeoError, bit_distance, distance, scaled_centroid};
use waypost_types::{CellAreaKey, CellKey, MacAddr, StationKey, StationRecord};

use crate::config::{AccuracyConfig, ClusterConfig};

/// Signal assumed for observations that did not report one, in dBm.
pub const MISSING_SIGNAL: i16 = -100;

/// Signals are clamped into this range before weighting, in dBm.
const SIGNAL_RANGE: (i16, i16) = (-100, -30);

/// A matched station considered for clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<K> {
    /// Station identity.
    pub key: K,
    /// Stored position and range of the station.
    pub circle: Circle,
    /// Signal strength reported by the querying device, in dBm.
    pub signal: Option<i16>,
}

impl<K: StationKey> Candidate<K> {
    /// Candidate for a stored station, or `None` if it has no location.
    pub fn from_station(record: &StationRecord<K>, signal: Option<i16>) -> Option<Self> {
        record.location.as_ref().map(|loc| Self {
            key: record.key.clone(),
            circle: Circle::new(loc.lat, loc.lon, loc.range),
            signal,
        })
    }

    fn effective_signal(&self) -> i16 {
        self.signal.unwrap_or(MISSING_SIGNAL)
    }
}

/// Weight multiplier for a reported signal strength.
///
/// Grows linearly from 1.0 at -100 dBm to 8.0 at -30 dBm. A missing signal
/// gets the weakest weight.
pub fn signal_weight(signal: Option<i16>) -> f64 {
    let (weakest, strongest) = SIGNAL_RANGE;
    let clamped = signal.unwrap_or(MISSING_SIGNAL).clamp(weakest, strongest);
    1.0 + (f64::from(clamped) - f64::from(weakest)) / 10.0
}

/// Grouping and ranking rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    /// Group by location area.
    Cell,
    /// Group by proximity or MAC similarity, rank with signal.
    Wifi,
}

/// A non-empty group of candidates, sorted by key.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster<K> {
    members: Vec<Candidate<K>>,
}

impl<K: StationKey> Cluster<K> {
    /// Build a cluster; `None` for an empty member list.
    pub fn new(mut members: Vec<Candidate<K>>) -> Option<Self> {
        if members.is_empty() {
            return None;
        }
        members.sort_by(|a, b| a.key.cmp(&b.key));
        Some(Self { members })
    }

    /// The members, sorted by key.
    pub fn members(&self) -> &[Candidate<K>] {
        &self.members
    }

    /// Number of members. Never zero.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`; clusters are never empty.
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Smallest member range.
    pub fn min_range(&self) -> f64 {
        self.members
            .iter()
            .map(|m| m.circle.radius)
            .fold(f64::INFINITY, f64::min)
    }

    /// Sum of member signals, missing signals counted as [`MISSING_SIGNAL`].
    pub fn signal_sum(&self) -> i64 {
        self.members
            .iter()
            .map(|m| i64::from(m.effective_signal()))
            .fold(0_i64, i64::saturating_add)
    }

    fn smallest_key(&self) -> Option<&K> {
        self.members.first().map(|m| &m.key)
    }
}

/// Order clusters best first.
fn rank<K: StationKey>(mode: ClusterMode, a: &Cluster<K>, b: &Cluster<K>) -> Ordering {
    let by_size = b.len().cmp(&a.len());
    let by_range = a.min_range().total_cmp(&b.min_range());
    let by_signal = match mode {
        ClusterMode::Cell => Ordering::Equal,
        ClusterMode::Wifi => b.signal_sum().cmp(&a.signal_sum()),
    };
    by_size
        .then(by_range)
        .then(by_signal)
        .then_with(|| a.smallest_key().cmp(&b.smallest_key()))
}

/// Groups candidates, picks the winning cluster and aggregates it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterEngine {
    cluster: ClusterConfig,
    accuracy: AccuracyConfig,
}

impl ClusterEngine {
    /// Build an engine from configuration.
    pub fn new(cluster: &ClusterConfig, accuracy: &AccuracyConfig) -> Self {
        Self {
            cluster: cluster.clone(),
            accuracy: accuracy.clone(),
        }
    }

    // =========================================================================
    // Grouping
    // =========================================================================

    /// One cluster per location area, ordered by area key.
    pub fn cell_clusters(mut candidates: Vec<Candidate<CellKey>>) -> Vec<Cluster<CellKey>> {
        candidates.sort_by(|a, b| a.key.cmp(&b.key));
        let mut areas: BTreeMap<CellAreaKey, Vec<Candidate<CellKey>>> = BTreeMap::new();
        for candidate in candidates {
            areas.entry(candidate.key.area_key()).or_default().push(candidate);
        }
        areas.into_values().filter_map(Cluster::new).collect()
    }

    /// Connected components of linked access points, ordered by their
    /// smallest key. Components below `min_wifi_cluster` are dropped.
    pub fn wifi_clusters(&self, mut candidates: Vec<Candidate<MacAddr>>) -> Vec<Cluster<MacAddr>> {
        candidates.sort_by(|a, b| a.key.cmp(&b.key));
        candidates.dedup_by(|later, earlier| later.key == earlier.key);

        let linked = |a: &Candidate<MacAddr>, b: &Candidate<MacAddr>| {
            distance(a.circle.center(), b.circle.center()) < self.cluster.cluster_meters
                || bit_distance(a.key, b.key) < self.cluster.bit_distance_threshold
        };

        let mut assigned = vec![false; candidates.len()];
        let mut clusters = Vec::new();
        for start in 0..candidates.len() {
            if assigned.get(start).copied().unwrap_or(true) {
                continue;
            }
            let mut component = vec![start];
            if let Some(slot) = assigned.get_mut(start) {
                *slot = true;
            }
            let mut cursor = 0_usize;
            while let Some(&index) = component.get(cursor) {
                cursor = cursor.saturating_add(1);
                let Some(current) = candidates.get(index) else {
                    continue;
                };
                for (other, candidate) in candidates.iter().enumerate() {
                    let Some(slot) = assigned.get_mut(other) else {
                        continue;
                    };
                    if !*slot && linked(current, candidate) {
                        *slot = true;
                        component.push(other);
                    }
                }
            }

            if component.len() >= self.cluster.min_wifi_cluster {
                let members = component
                    .iter()
                    .filter_map(|&i| candidates.get(i).cloned())
                    .collect();
                clusters.extend(Cluster::new(members));
            }
        }
        clusters
    }

    /// The best cluster under `mode`'s ranking.
    pub fn best<K: StationKey>(mode: ClusterMode, clusters: Vec<Cluster<K>>) -> Option<Cluster<K>> {
        clusters.into_iter().min_by(|a, b| rank(mode, a, b))
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    /// Position from the best cell cluster, floored at the cell minimum.
    pub fn locate_cells(&self, candidates: Vec<Candidate<CellKey>>) -> Option<Estimate> {
        let winner = Self::best(ClusterMode::Cell, Self::cell_clusters(candidates))?;
        let weighted: Vec<(Candidate<CellKey>, f64)> =
            winner.members.into_iter().map(|m| (m, 1.0)).collect();
        aggregate(
            &weighted,
            self.cluster.cell_outlier_meters,
            self.accuracy.cell_min,
        )
    }

    /// Position from the best WiFi cluster, floored at the WiFi minimum.
    ///
    /// Only the `max_wifi_cluster` strongest members contribute, each
    /// weighted by [`signal_weight`] on top of its inverse range.
    pub fn locate_wifis(&self, candidates: Vec<Candidate<MacAddr>>) -> Option<Estimate> {
        let winner = Self::best(ClusterMode::Wifi, self.wifi_clusters(candidates))?;
        let mut members = winner.members;
        members.sort_by(|a, b| {
            b.effective_signal()
                .cmp(&a.effective_signal())
                .then_with(|| a.key.cmp(&b.key))
        });
        members.truncate(self.cluster.max_wifi_cluster);

        let weighted: Vec<(Candidate<MacAddr>, f64)> = members
            .into_iter()
            .map(|m| {
                let weight = signal_weight(m.signal);
                (m, weight)
            })
            .collect();
        aggregate(
            &weighted,
            self.cluster.wifi_outlier_meters,
            self.accuracy.wifi_min,
        )
    }
}

/// Centroid over `members` after dropping outliers.
fn aggregate<K: StationKey>(
    members: &[(Candidate<K>, f64)],
    outlier_meters: f64,
    min_accuracy: f64,
) -> Option<Estimate> {
    let first_pass = centroid(members, min_accuracy)?;

    let kept: Vec<(Candidate<K>, f64)> = members
        .iter()
        .filter(|(m, _)| distance(first_pass.center(), m.circle.center()) <= outlier_meters)
        .cloned()
        .collect();

    if kept.len() == members.len() {
        return Some(first_pass);
    }

    tracing::debug!(
        dropped = members.len().saturating_sub(kept.len()),
        outlier_meters,
        "Dropped cluster outliers"
    );

    if kept.is_empty() {
        let tightest = members.iter().min_by(|(a, _), (b, _)| {
            a.circle
                .radius
                .total_cmp(&b.circle.radius)
                .then_with(|| a.key.cmp(&b.key))
        })?;
        return centroid(core::slice::from_ref(tightest), min_accuracy);
    }

    centroid(&kept, min_accuracy)
}

fn centroid<K: StationKey>(members: &[(Candidate<K>, f64)], min_accuracy: f64) -> Option<Estimate> {
    let circles: Vec<(Circle, f64)> = members.iter().map(|(m, w)| (m.circle, *w)).collect();
    match scaled_centroid(&circles, min_accuracy) {
        Ok(estimate) => Some(estimate),
        Err(GeoError::Empty) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping cluster with unusable station data");
            None
        }
    }
}
