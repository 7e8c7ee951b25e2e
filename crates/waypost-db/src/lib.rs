//! Data layer for Waypost (`Dragonfly` + `PostgreSQL`).
//!
//! `PostgreSQL` holds the durable station and area aggregates together
//! with the observations retained behind them. `Dragonfly` holds the work
//! queues that feed the batch pipelines.
//!
//! # Architecture
//!
//! ```text
//! Ingestion
//!     |
//!     +-- push observations --> Dragonfly (WorkQueue)
//!                                   |
//! Station updater <-- claim batch --+
//!     |
//!     +-- per-station tx -----> PostgreSQL (StationStore / StationTx)
//!     |                             |-- station
//!     |                             |-- station_observation
//!     +-- schedule areas ---> Dragonfly (area set)
//!                                   |
//! Area updater <-- claim areas -----+-- per-area tx --> cell_area
//! ```
//!
//! # Modules
//!
//! - [`store`] -- Storage traits and row types
//! - [`station_store`] -- `PostgreSQL` implementation of the storage traits
//! - [`queue`] -- Work queue trait and queue names
//! - [`dragonfly`] -- `Dragonfly` (Redis-compatible) work queues
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`memory`] -- In-memory store and queue for tests and local runs
//! - [`error`] -- Shared error types

pub mod dragonfly;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod queue;
pub mod station_store;
pub mod store;

// Re-export primary types for convenience.
pub use dragonfly::DragonflyPool;
pub use error::DbError;
pub use memory::{MemoryQueue, MemoryStore, MemoryTx};
pub use postgres::{PostgresConfig, PostgresPool};
pub use queue::{AREA_QUEUE, WorkQueue, observation_queue};
pub use station_store::{PgStationStore, PgStationTx};
pub use store::{AreaRow, StationRow, StationStore, StationTx};
