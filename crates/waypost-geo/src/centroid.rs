//! Inverse-range weighted centroids.
//!
//! Each circle pulls the estimate with weight `1 / radius`, so tight
//! circles dominate loose ones. The reported accuracy is the smallest
//! radius around the centroid that still covers every contributing
//! center, floored at the caller's minimum accuracy.
//!
//! Longitudes are averaged as offsets from the first circle and wrapped
//! back into `[-180, 180)`, so clusters straddling the antimeridian land
//! next to their members instead of on the opposite side of the planet.

use crate::distance::distance;
use crate::error::GeoError;
use crate::{Circle, Estimate, Point};

/// Radii below this are treated as this value when computing weights.
const MIN_WEIGHT_RADIUS: f64 = 1.0;

/// Weighted centroid of `circles`, each weighted by its inverse radius.
///
/// A single circle is returned unchanged apart from the accuracy floor.
///
/// # Errors
///
/// Returns [`GeoError::Empty`] for an empty slice and
/// [`GeoError::NonFinite`] when any coordinate or radius is NaN or
/// infinite.
pub fn weighted_centroid(circles: &[Circle], min_accuracy: f64) -> Result<Estimate, GeoError> {
    let scaled: Vec<(Circle, f64)> = circles.iter().map(|c| (*c, 1.0)).collect();
    scaled_centroid(&scaled, min_accuracy)
}

/// Weighted centroid with an extra multiplicative weight per circle.
///
/// The effective weight of a circle is `extra / radius`. This is how
/// signal strength is layered on top of the range-based weighting.
///
/// # Errors
///
/// As [`weighted_centroid`], plus [`GeoError::InvalidWeight`] for a
/// negative or non-finite extra weight and [`GeoError::ZeroWeight`] when
/// every effective weight is zero.
pub fn scaled_centroid(circles: &[(Circle, f64)], min_accuracy: f64) -> Result<Estimate, GeoError> {
    let Some(&(first, _)) = circles.first() else {
        return Err(GeoError::Empty);
    };

    for (index, (circle, weight)) in circles.iter().enumerate() {
        if !(circle.lat.is_finite() && circle.lon.is_finite() && circle.radius.is_finite()) {
            return Err(GeoError::NonFinite { index });
        }
        if !weight.is_finite() || *weight < 0.0 {
            return Err(GeoError::InvalidWeight { index });
        }
    }

    if let [(only, _)] = circles {
        return Ok(Estimate {
            lat: only.lat,
            lon: only.lon,
            accuracy: only.radius.max(min_accuracy),
        });
    }

    let weights: Vec<f64> = circles
        .iter()
        .map(|(c, extra)| extra / c.radius.max(MIN_WEIGHT_RADIUS))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(GeoError::ZeroWeight);
    }

    let lat = circles
        .iter()
        .zip(&weights)
        .map(|((c, _), w)| c.lat * w)
        .sum::<f64>()
        / total;
    let lon_offset = circles
        .iter()
        .zip(&weights)
        .map(|((c, _), w)| wrap_longitude(c.lon - first.lon) * w)
        .sum::<f64>()
        / total;
    let lon = wrap_longitude(first.lon + lon_offset);

    let center = Point::new(lat, lon);
    let spread = circles
        .iter()
        .map(|(c, _)| distance(center, c.center()))
        .fold(0.0, f64::max);

    Ok(Estimate {
        lat,
        lon,
        accuracy: spread.max(min_accuracy),
    })
}

/// Wrap a longitude (or longitude offset) into `[-180, 180)`.
fn wrap_longitude(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}
