//! Geometry for crowd-sourced positioning.
//!
//! Everything here is pure computation on small in-memory slices: the
//! resolution engine, the cluster engine and the station pipeline all feed
//! circles in and get a single estimate back.
//!
//! # Modules
//!
//! - [`distance`] -- Great-circle distance and identity bit distance.
//! - [`centroid`] -- Inverse-range weighted centroids with accuracy floors.
//! - [`error`] -- Error types for centroid computations.

pub mod centroid;
pub mod distance;
pub mod error;

use serde::{Deserialize, Serialize};

pub use centroid::{scaled_centroid, weighted_centroid};
pub use distance::{EARTH_RADIUS_METERS, bit_distance, distance};
pub use error::GeoError;

/// A position on the earth's surface, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
}

impl Point {
    /// Create a point.
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A position with an uncertainty radius in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Radius in meters.
    pub radius: f64,
}

impl Circle {
    /// Create a circle.
    pub const fn new(lat: f64, lon: f64, radius: f64) -> Self {
        Self { lat, lon, radius }
    }

    /// The circle's center.
    pub const fn center(self) -> Point {
        Point::new(self.lat, self.lon)
    }
}

/// An aggregated position estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Accuracy radius in meters.
    pub accuracy: f64,
}

impl Estimate {
    /// The estimate's center.
    pub const fn center(self) -> Point {
        Point::new(self.lat, self.lon)
    }
}
