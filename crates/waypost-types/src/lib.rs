//! Shared type definitions for Waypost.
//!
//! This crate is the single source of truth for the values that flow
//! between the resolution engine, the station pipeline and storage.
//!
//! # Modules
//!
//! - [`keys`] -- Typed station identities (cells, cell areas, WiFi MACs)
//! - [`enums`] -- Radio technology, station kind, provenance, fallback tags
//! - [`observation`] -- Reported sightings and their retained form
//! - [`station`] -- Station and area aggregate records
//! - [`query`] -- Resolution requests, positions and the response wire form

pub mod enums;
pub mod keys;
pub mod observation;
pub mod query;
pub mod station;

// Re-export all public types at crate root for convenience.
pub use enums::{Fallback, Provenance, Radio, StationKind};
pub use keys::{CellAreaKey, CellKey, KeyParseError, MacAddr, StationKey};
pub use observation::{CellObservation, Observation, RetainedObservation, WifiObservation};
pub use query::{CellLookup, LocateQuery, LocateResponse, Position, WifiLookup};
pub use station::{AreaRecord, CellStation, StationLocation, StationRecord, WifiStation};
