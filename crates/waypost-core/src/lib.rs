//! Position resolution and station pipelines for Waypost.
//!
//! This crate turns crowd-sourced radio observations into station
//! positions and answers position queries from them. Storage and queues
//! come from `waypost-db`; geometry from `waypost-geo`.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `waypost.yaml` into
//!   strongly-typed structs.
//! - [`blocklist`] -- Temporary and permanent blocking of moving stations.
//! - [`cluster`] -- Grouping, ranking and aggregation of matched stations.
//! - [`locate`] -- [`Resolver`] and the [`PositionSource`] implementations.
//! - [`ingest`] -- Observation validation in front of the work queue.
//! - [`station`] -- Batch station updater shared by cells and WiFi.
//! - [`area`] -- Location-area recomputation.
//! - [`tasks`] -- [`TaskRunner`] and the periodic [`Scheduler`].
//!
//! [`Resolver`]: locate::Resolver
//! [`PositionSource`]: locate::PositionSource
//! [`TaskRunner`]: tasks::TaskRunner
//! [`Scheduler`]: tasks::Scheduler

pub mod area;
pub mod blocklist;
pub mod cluster;
pub mod config;
pub mod ingest;
pub mod locate;
pub mod station;
pub mod tasks;
