//! Task orchestration for the batch pipelines.
//!
//! - [`Task`] names one unit of work and its parameters.
//! - [`TaskRunner`] executes tasks against the store and the work queue.
//! - [`Scheduler`] triggers the periodic jobs on fixed intervals and
//!   chains immediate follow-up runs while a backlog remains.
//!
//! Every job runs to completion before the next one starts. A failed run
//! is logged and the job simply fires again on its next tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use waypost_db::{StationStore, WorkQueue};
use waypost_types::{CellAreaKey, CellKey, MacAddr};

use crate::area::{AreaError, AreaUpdate, AreaUpdater};
use crate::config::{JobConfig, ScheduleConfig, WaypostConfig};
use crate::station::{StationError, StationUpdate, StationUpdater};

/// A unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Fold queued cell observations into cell stations.
    UpdateCells {
        /// Observations claimed per run.
        batch: usize,
    },
    /// Fold queued WiFi observations into WiFi stations.
    UpdateWifis {
        /// Observations claimed per run.
        batch: usize,
    },
    /// Recompute areas scheduled by the cell updater.
    ScanAreas {
        /// Area keys claimed per run.
        batch: usize,
    },
    /// Recompute specific areas.
    UpdateAreas {
        /// The areas to recompute.
        keys: Vec<CellAreaKey>,
    },
    /// Clear the blocklist history of specific cells.
    ResetCells {
        /// The cells to reopen.
        keys: Vec<CellKey>,
    },
    /// Clear the blocklist history of specific WiFi stations.
    ResetWifis {
        /// The WiFi stations to reopen.
        keys: Vec<MacAddr>,
    },
}

impl Task {
    /// Short name used in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::UpdateCells { .. } => "update_cells",
            Self::UpdateWifis { .. } => "update_wifis",
            Self::ScanAreas { .. } => "scan_areas",
            Self::UpdateAreas { .. } => "update_areas",
            Self::ResetCells { .. } => "reset_cells",
            Self::ResetWifis { .. } => "reset_wifis",
        }
    }
}

/// What a task run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Result of a station updater run.
    Stations(StationUpdate),
    /// Result of an area run.
    Areas(AreaUpdate),
}

impl TaskOutcome {
    /// Whether the run left more than a full batch behind.
    pub const fn follow_up(&self) -> bool {
        match self {
            Self::Stations(update) => update.follow_up,
            Self::Areas(update) => update.follow_up,
        }
    }
}

/// Errors surfaced by a task run.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The station updater failed.
    #[error("station update failed: {source}")]
    Station {
        /// The underlying updater error.
        #[from]
        source: StationError,
    },

    /// The area updater failed.
    #[error("area update failed: {source}")]
    Area {
        /// The underlying updater error.
        #[from]
        source: AreaError,
    },
}

/// Executes tasks with the configuration given at construction.
pub struct TaskRunner<S, Q> {
    cells: StationUpdater<CellKey, S, Q>,
    wifis: StationUpdater<MacAddr, S, Q>,
    areas: AreaUpdater<S, Q>,
}

impl<S: StationStore, Q: WorkQueue> TaskRunner<S, Q> {
    /// Build a runner over `store` and `queue`.
    pub fn new(store: Arc<S>, queue: Arc<Q>, config: &WaypostConfig) -> Self {
        Self {
            cells: StationUpdater::new(Arc::clone(&store), Arc::clone(&queue), config),
            wifis: StationUpdater::new(Arc::clone(&store), Arc::clone(&queue), config),
            areas: AreaUpdater::new(store, queue, config),
        }
    }

    /// Run `task` now.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] if the underlying pipeline fails.
    pub async fn run(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
        self.run_at(task, Utc::now()).await
    }

    /// Run `task` as if the current time were `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] if the underlying pipeline fails.
    pub async fn run_at(&self, task: &Task, now: DateTime<Utc>) -> Result<TaskOutcome, TaskError> {
        let outcome = match task {
            Task::UpdateCells { batch } => {
                TaskOutcome::Stations(self.cells.update_stations_at(*batch, now).await?)
            }
            Task::UpdateWifis { batch } => {
                TaskOutcome::Stations(self.wifis.update_stations_at(*batch, now).await?)
            }
            Task::ScanAreas { batch } => TaskOutcome::Areas(self.areas.scan_areas_at(*batch, now).await?),
            Task::UpdateAreas { keys } => TaskOutcome::Areas(self.areas.update_areas_at(keys, now).await?),
            Task::ResetCells { keys } => TaskOutcome::Stations(self.cells.reset_stations_at(keys, now).await?),
            Task::ResetWifis { keys } => TaskOutcome::Stations(self.wifis.reset_stations_at(keys, now).await?),
        };
        Ok(outcome)
    }
}

// =========================================================================
// Scheduler
// =========================================================================

/// Callback invoked after each successful task run.
pub trait TaskCallback: Send {
    /// Called with the task and what it produced.
    fn on_task(&mut self, task: &Task, outcome: &TaskOutcome);
}

/// A no-op task callback.
pub struct NoOpCallback;

impl TaskCallback for NoOpCallback {
    fn on_task(&mut self, _task: &Task, _outcome: &TaskOutcome) {}
}

/// Totals from a scheduler session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Successful task runs, follow-ups included.
    pub runs: u64,
    /// Failed task runs.
    pub failures: u64,
}

fn job_interval(job: &JobConfig) -> Interval {
    let mut interval = tokio::time::interval(job.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Drives the periodic jobs until shutdown.
pub struct Scheduler<S, Q> {
    runner: TaskRunner<S, Q>,
    schedule: ScheduleConfig,
    max_follow_ups: u32,
}

impl<S: StationStore, Q: WorkQueue> Scheduler<S, Q> {
    /// Build a scheduler around `runner`.
    pub fn new(runner: TaskRunner<S, Q>, config: &WaypostConfig) -> Self {
        Self {
            runner,
            schedule: config.schedule.clone(),
            max_follow_ups: config.pipeline.max_follow_ups,
        }
    }

    /// Run the jobs until `shutdown` turns `true` or its sender is dropped.
    ///
    /// All jobs fire once immediately, then on their own intervals.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        callback: &mut dyn TaskCallback,
    ) -> SchedulerReport {
        let mut cells = job_interval(&self.schedule.update_cells);
        let mut wifis = job_interval(&self.schedule.update_wifis);
        let mut areas = job_interval(&self.schedule.scan_areas);
        let mut report = SchedulerReport::default();

        info!(
            update_cells_secs = self.schedule.update_cells.interval_secs,
            update_wifis_secs = self.schedule.update_wifis.interval_secs,
            scan_areas_secs = self.schedule.scan_areas.interval_secs,
            max_follow_ups = self.max_follow_ups,
            "Scheduler starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let task = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = cells.tick() => Task::UpdateCells { batch: self.schedule.update_cells.batch },
                _ = wifis.tick() => Task::UpdateWifis { batch: self.schedule.update_wifis.batch },
                _ = areas.tick() => Task::ScanAreas { batch: self.schedule.scan_areas.batch },
            };

            match self.run_job(&task, callback).await {
                Ok(runs) => report.runs = report.runs.saturating_add(u64::from(runs)),
                Err((runs, e)) => {
                    report.runs = report.runs.saturating_add(u64::from(runs));
                    report.failures = report.failures.saturating_add(1);
                    warn!(task = task.name(), error = %e, "Task failed, retrying on next tick");
                }
            }
        }

        info!(runs = report.runs, failures = report.failures, "Scheduler stopped");
        report
    }

    /// Run `task` and its follow-ups.
    ///
    /// Returns the number of successful runs, alongside the error if one
    /// ended the chain.
    async fn run_job(
        &self,
        task: &Task,
        callback: &mut dyn TaskCallback,
    ) -> Result<u32, (u32, TaskError)> {
        let mut runs = 0_u32;
        loop {
            let outcome = self.runner.run(task).await.map_err(|e| (runs, e))?;
            runs = runs.saturating_add(1);
            callback.on_task(task, &outcome);

            if !outcome.follow_up() {
                return Ok(runs);
            }
            if runs > self.max_follow_ups {
                debug!(task = task.name(), runs, "Follow-up limit reached");
                return Ok(runs);
            }
            debug!(task = task.name(), runs, "Backlog remains, running follow-up");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::time::Duration;

    use waypost_db::{MemoryQueue, MemoryStore};
    use waypost_types::{Observation, StationKind};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        tasks: Vec<&'static str>,
    }

    impl TaskCallback for Recorder {
        fn on_task(&mut self, task: &Task, _outcome: &TaskOutcome) {
            self.tasks.push(task.name());
        }
    }

    fn wifi_backlog(count: u64) -> Vec<Observation<MacAddr>> {
        (0..count)
            .map(|i| Observation::new(MacAddr::from_u64(0x00aa_0000_0000_u64.saturating_add(i)), 10.0, 10.0))
            .collect()
    }

    fn scheduler(
        store: &Arc<MemoryStore>,
        queue: &Arc<MemoryQueue>,
        config: &WaypostConfig,
    ) -> Scheduler<MemoryStore, MemoryQueue> {
        Scheduler::new(TaskRunner::new(Arc::clone(store), Arc::clone(queue), config), config)
    }

    #[tokio::test]
    async fn runner_dispatches_each_task() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        queue.push_observations(&wifi_backlog(3)).await.unwrap();
        let runner = TaskRunner::new(Arc::clone(&store), Arc::clone(&queue), &WaypostConfig::default());

        let outcome = runner.run(&Task::UpdateWifis { batch: 10 }).await.unwrap();
        assert!(matches!(
            outcome,
            TaskOutcome::Stations(StationUpdate { processed: 3, moved: 0, .. })
        ));

        let outcome = runner.run(&Task::UpdateAreas { keys: Vec::new() }).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Areas(AreaUpdate::default()));
    }

    #[tokio::test]
    async fn reset_task_reopens_blocked_stations() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let key = MacAddr::from_u64(0x00aa_0000_0042);
        let mut record = waypost_types::StationRecord::new(key, Utc::now());
        record.block_count = 9;
        record.block_last = Some(Utc::now().date_naive());
        store.insert_stations(&[record]).await;
        let runner = TaskRunner::new(Arc::clone(&store), Arc::clone(&queue), &WaypostConfig::default());

        let task = Task::ResetWifis { keys: vec![key] };
        assert_eq!(task.name(), "reset_wifis");
        let outcome = runner.run(&task).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Stations(StationUpdate { processed: 1, .. })));
        assert!(!outcome.follow_up());
        assert_eq!(store.station(&key).await.unwrap().unwrap().block_count, 0);

        let outcome = runner.run(&Task::ResetCells { keys: Vec::new() }).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Stations(StationUpdate::default()));
    }

    #[tokio::test]
    async fn follow_ups_drain_the_backlog() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        queue.push_observations(&wifi_backlog(7)).await.unwrap();
        let scheduler = scheduler(&store, &queue, &WaypostConfig::default());
        let mut recorder = Recorder::default();

        let runs = scheduler
            .run_job(&Task::UpdateWifis { batch: 2 }, &mut recorder)
            .await
            .unwrap();

        // 7 -> 5 -> 3 -> 1: the last run leaves less than a batch behind.
        assert_eq!(runs, 3);
        assert_eq!(queue.pending_observations(StationKind::Wifi).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn follow_ups_are_bounded() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        queue.push_observations(&wifi_backlog(20)).await.unwrap();
        let mut config = WaypostConfig::default();
        config.pipeline.max_follow_ups = 1;
        let scheduler = scheduler(&store, &queue, &config);

        let runs = scheduler
            .run_job(&Task::UpdateWifis { batch: 2 }, &mut NoOpCallback)
            .await
            .unwrap();

        assert_eq!(runs, 2);
        assert_eq!(queue.pending_observations(StationKind::Wifi).await.unwrap(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_runs_jobs_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        queue.push_observations(&wifi_backlog(2)).await.unwrap();
        let scheduler = scheduler(&store, &queue, &WaypostConfig::default());
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send(true).unwrap();
        });

        let mut recorder = Recorder::default();
        let report = scheduler.run(rx, &mut recorder).await;

        assert_eq!(report.failures, 0);
        assert!(report.runs >= 3);
        for name in ["update_cells", "update_wifis", "scan_areas"] {
            assert!(recorder.tasks.contains(&name), "{name} never ran");
        }
        assert_eq!(queue.pending_observations(StationKind::Wifi).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_on_next_tick() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        queue.set_failing(true);
        let scheduler = scheduler(&store, &queue, &WaypostConfig::default());
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            drop(tx);
        });

        let report = scheduler.run(rx, &mut NoOpCallback).await;

        assert_eq!(report.runs, 0);
        // Immediate first ticks for all three jobs plus later wifi/cell ticks.
        assert!(report.failures > 3);
    }
}
