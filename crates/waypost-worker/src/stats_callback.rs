//! Task callback that keeps running totals of pipeline work.
//!
//! The totals are logged on every run that changed something and once
//! more when the worker stops.

use tracing::{debug, info};
use waypost_core::tasks::{Task, TaskCallback, TaskOutcome};

/// Running totals across all task runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineTotals {
    /// Stations whose aggregate changed.
    pub stations_processed: u64,
    /// Stations detected as moving.
    pub stations_moved: u64,
    /// Areas recomputed.
    pub areas_updated: u64,
    /// Areas deleted.
    pub areas_removed: u64,
}

/// Callback that accumulates [`PipelineTotals`].
#[derive(Debug, Default)]
pub struct StatsCallback {
    totals: PipelineTotals,
}

impl StatsCallback {
    /// Totals so far.
    pub const fn totals(&self) -> PipelineTotals {
        self.totals
    }

    /// Log the totals.
    pub fn log_totals(&self) {
        info!(
            stations_processed = self.totals.stations_processed,
            stations_moved = self.totals.stations_moved,
            areas_updated = self.totals.areas_updated,
            areas_removed = self.totals.areas_removed,
            "Pipeline totals"
        );
    }
}

fn widen(count: usize) -> u64 {
    u64::try_from(count).unwrap_or(u64::MAX)
}

impl TaskCallback for StatsCallback {
    fn on_task(&mut self, task: &Task, outcome: &TaskOutcome) {
        let totals = &mut self.totals;
        let changed = match outcome {
            TaskOutcome::Stations(update) => {
                totals.stations_processed = totals.stations_processed.saturating_add(widen(update.processed));
                totals.stations_moved = totals.stations_moved.saturating_add(widen(update.moved));
                update.processed > 0
            }
            TaskOutcome::Areas(update) => {
                totals.areas_updated = totals.areas_updated.saturating_add(widen(update.updated));
                totals.areas_removed = totals.areas_removed.saturating_add(widen(update.removed));
                update.updated > 0 || update.removed > 0
            }
        };

        if changed {
            debug!(task = task.name(), ?outcome, "Task changed storage");
        }
    }
}

#[cfg(test)]
mod tests {
    use waypost_core::area::AreaUpdate;
    use waypost_core::station::StationUpdate;

    use super::*;

    #[test]
    fn totals_accumulate_per_outcome_kind() {
        let mut callback = StatsCallback::default();
        let stations = TaskOutcome::Stations(StationUpdate {
            processed: 4,
            moved: 1,
            remaining: 0,
            follow_up: false,
        });
        let areas = TaskOutcome::Areas(AreaUpdate {
            updated: 2,
            removed: 1,
            remaining: 0,
            follow_up: false,
        });

        callback.on_task(&Task::UpdateWifis { batch: 10 }, &stations);
        callback.on_task(&Task::UpdateCells { batch: 10 }, &stations);
        callback.on_task(&Task::ScanAreas { batch: 10 }, &areas);

        assert_eq!(
            callback.totals(),
            PipelineTotals {
                stations_processed: 8,
                stations_moved: 2,
                areas_updated: 2,
                areas_removed: 1,
            }
        );
    }

    #[test]
    fn idle_runs_leave_totals_untouched() {
        let mut callback = StatsCallback::default();
        callback.on_task(
            &Task::ScanAreas { batch: 10 },
            &TaskOutcome::Areas(AreaUpdate::default()),
        );
        assert_eq!(callback.totals(), PipelineTotals::default());
    }
}
