//! Blocklist policy for stations seen moving.
//!
//! The state is never stored directly. It is derived from a station's
//! `block_count` and `block_last` fields and the current date:
//!
//! ```text
//!            move                 move (count < threshold)
//!   Clean ---------> Temporary <---------------------------+
//!     ^                  |  |                              |
//!     |  decay_days pass |  +------------------------------+
//!     +------------------+  |
//!                           | move (count reaches threshold)
//!                           v
//!                       Permanent   (terminal until reset)
//! ```
//!
//! Decay only affects acceptance. `block_count` is never decremented, so
//! repeated offenses accumulate toward the permanent threshold across
//! decay windows.

use chrono::NaiveDate;
use serde::Serialize;
use waypost_types::{StationKey, StationRecord};

use crate::config::BlocklistConfig;

/// Acceptance state of a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    /// Observations are accepted.
    Clean,
    /// Seen moving recently; observations are rejected until the block
    /// decays.
    TemporarilyBlocked,
    /// Seen moving too often; observations are rejected for good.
    PermanentlyBlocked,
}

impl BlockState {
    /// Whether observations for the station must be rejected.
    pub const fn is_blocked(self) -> bool {
        !matches!(self, Self::Clean)
    }
}

/// Derives block states and applies move transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlocklistPolicy {
    permanent_threshold: u32,
    decay_days: u32,
}

impl BlocklistPolicy {
    /// Build a policy from configuration.
    pub const fn new(config: &BlocklistConfig) -> Self {
        Self {
            permanent_threshold: config.permanent_threshold,
            decay_days: config.decay_days,
        }
    }

    /// The state implied by the raw blocklist fields on `today`.
    ///
    /// A `block_last` in the future (clock skew between workers) counts as
    /// a fresh block.
    pub fn state(&self, block_count: u32, block_last: Option<NaiveDate>, today: NaiveDate) -> BlockState {
        if block_count >= self.permanent_threshold {
            return BlockState::PermanentlyBlocked;
        }
        match block_last {
            Some(last) if today.signed_duration_since(last).num_days() <= i64::from(self.decay_days) => {
                BlockState::TemporarilyBlocked
            }
            _ => BlockState::Clean,
        }
    }

    /// The state of `record` on `today`.
    pub fn state_of<K: StationKey>(&self, record: &StationRecord<K>, today: NaiveDate) -> BlockState {
        self.state(record.block_count, record.block_last, today)
    }

    /// Record that `record` was seen moving on `today`.
    ///
    /// Returns the resulting state, which is always blocked.
    pub fn record_move<K: StationKey>(&self, record: &mut StationRecord<K>, today: NaiveDate) -> BlockState {
        record.block_count = record.block_count.saturating_add(1);
        record.block_last = Some(today);
        let state = self.state_of(record, today);
        tracing::debug!(
            station = %record.key,
            block_count = record.block_count,
            ?state,
            "Station seen moving"
        );
        state
    }

    /// Clear all blocklist history, including a permanent block.
    ///
    /// Operators reach this through `Task::ResetCells` and
    /// `Task::ResetWifis`.
    pub const fn reset<K: StationKey>(record: &mut StationRecord<K>) {
        record.block_count = 0;
        record.block_last = None;
    }
}
