//! Great-circle distance and identity bit distance.

use waypost_types::MacAddr;

use crate::Point;

/// Mean earth radius used for all distance computations, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Haversine distance between two points, in meters.
///
/// Meter-level accuracy is all clustering and movement detection need, so
/// the earth is treated as a sphere.
pub fn distance(a: Point, b: Point) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let half_dlat = ((b.lat - a.lat).to_radians() / 2.0).sin();
    let half_dlon = ((b.lon - a.lon).to_radians() / 2.0).sin();

    let h = (lat_a.cos() * lat_b.cos()).mul_add(half_dlon.powi(2), half_dlat.powi(2));
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Number of differing bits between two 48-bit identities.
///
/// Virtual radios on one physical device typically differ from each other
/// in a single bit, so a small bit distance means "probably the same box".
pub const fn bit_distance(a: MacAddr, b: MacAddr) -> u32 {
    (a.as_u64() ^ b.as_u64()).count_ones()
}
