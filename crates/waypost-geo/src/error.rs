//! Error types for the `waypost-geo` crate.
//!
//! All fallible operations in this crate return [`GeoError`].

/// Errors raised by centroid computations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeoError {
    /// No circles were supplied.
    #[error("cannot aggregate an empty set of circles")]
    Empty,

    /// A coordinate or radius is NaN or infinite.
    #[error("circle {index} has a non-finite coordinate or radius")]
    NonFinite {
        /// Position of the offending circle in the input.
        index: usize,
    },

    /// An extra weight is negative or non-finite.
    #[error("circle {index} has an invalid weight")]
    InvalidWeight {
        /// Position of the offending circle in the input.
        index: usize,
    },

    /// Every weight was zero, so no centroid exists.
    #[error("total weight of the circles is zero")]
    ZeroWeight,
}
