//! Periodic backup triggers
//!
//! Every (database, kind) pair gets its own timer task. A pair is either
//! `Idle` or `Running`; a tick that lands while the pair is still running,
//! or while another operation holds the database lock, is skipped and
//! logged rather than queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::database::BackupError;
use crate::database::backup::BackupService;
use crate::database::request::{BackupKind, BackupRequest};
use crate::database::storage::ArtifactRecord;

/// One periodic trigger
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub database: String,
    pub kind: BackupKind,
    pub interval: Duration,
}

/// One entry per (database, kind) pair, each kind on its own cadence
pub fn entries_for(databases: &[String], schedule: &ScheduleConfig) -> Vec<ScheduleEntry> {
    databases
        .iter()
        .flat_map(|database| {
            BackupKind::ALL.iter().map(move |&kind| ScheduleEntry {
                database: database.clone(),
                kind,
                interval: schedule.interval(kind),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The previous tick of the same pair has not finished
    PairRunning,
    /// Another operation holds the database lock
    DatabaseBusy,
}

/// Result of a single tick
#[derive(Debug)]
pub enum TickOutcome {
    Completed(ArtifactRecord),
    Failed(BackupError),
    Skipped(SkipReason),
}

type PairKey = (String, BackupKind);
type PairStates = Arc<StdMutex<HashMap<PairKey, PairState>>>;

fn lock_states(states: &PairStates) -> std::sync::MutexGuard<'_, HashMap<PairKey, PairState>> {
    match states.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Marks a pair `Running` until dropped
struct RunningPair {
    states: PairStates,
    key: PairKey,
}

impl Drop for RunningPair {
    fn drop(&mut self) {
        lock_states(&self.states).insert(self.key.clone(), PairState::Idle);
    }
}

pub struct Scheduler {
    service: Arc<BackupService>,
    states: PairStates,
}

impl Scheduler {
    pub fn new(service: Arc<BackupService>) -> Self {
        Self {
            service,
            states: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn begin(&self, entry: &ScheduleEntry) -> Option<RunningPair> {
        let key = (entry.database.clone(), entry.kind);
        let mut states = lock_states(&self.states);
        if states.get(&key) == Some(&PairState::Running) {
            return None;
        }
        states.insert(key.clone(), PairState::Running);
        Some(RunningPair {
            states: self.states.clone(),
            key,
        })
    }

    /// Run one scheduled backup for the entry's pair, unless it has to be skipped
    pub async fn tick(&self, entry: &ScheduleEntry) -> TickOutcome {
        let Some(_running) = self.begin(entry) else {
            warn!(
                "Skipping scheduled {} backup of {}: previous run still in progress",
                entry.kind, entry.database
            );
            return TickOutcome::Skipped(SkipReason::PairRunning);
        };

        let request = BackupRequest::new(&entry.database, entry.kind);
        let validated = match self.service.validate(&request).await {
            Ok(validated) => validated,
            Err(e) => return failed(entry, e),
        };

        let Some(_guard) = self.service.locks().try_acquire(&entry.database) else {
            warn!(
                "Skipping scheduled {} backup of {}: database is busy",
                entry.kind, entry.database
            );
            return TickOutcome::Skipped(SkipReason::DatabaseBusy);
        };

        match self.service.execute(&validated, Utc::now()).await {
            Ok(record) => TickOutcome::Completed(record),
            Err(e) => failed(entry, e),
        }
    }

    /// When the entry's timer first fires
    ///
    /// A FULL pair with nothing cataloged fires at once so differentials
    /// have a base; every other pair waits one interval.
    async fn first_deadline(&self, entry: &ScheduleEntry) -> Instant {
        let after_interval = Instant::now() + entry.interval;
        if entry.kind != BackupKind::Full {
            return after_interval;
        }

        match self.service.has_full_backup(&entry.database).await {
            Ok(true) => after_interval,
            Ok(false) => {
                info!("No FULL backup of {} cataloged, taking one now", entry.database);
                Instant::now()
            }
            Err(e) => {
                warn!("Cannot look up FULL backups of {}: {}", entry.database, e);
                after_interval
            }
        }
    }

    /// Start one timer task per entry on `tracker`
    ///
    /// Ticks run as their own tracked tasks so a long backup never delays
    /// its timer. The timers stop when `shutdown` flips and in-flight ticks
    /// are left to the tracker.
    pub fn start(
        self: &Arc<Self>,
        entries: Vec<ScheduleEntry>,
        tracker: &TaskTracker,
        shutdown: watch::Receiver<bool>,
    ) {
        for entry in entries {
            info!(
                "Scheduling {} backups of {} every {:?}",
                entry.kind, entry.database, entry.interval
            );

            let scheduler = self.clone();
            let ticks = tracker.clone();
            let mut shutdown = shutdown.clone();
            let entry = Arc::new(entry);

            tracker.spawn(async move {
                let first = scheduler.first_deadline(&entry).await;
                let mut timer = interval_at(first, entry.interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = timer.tick() => {
                            let scheduler = scheduler.clone();
                            let entry = entry.clone();
                            ticks.spawn(async move {
                                scheduler.tick(&entry).await;
                            });
                        }
                    }
                }
                debug!("Timer for {} {} stopped", entry.database, entry.kind);
            });
        }
    }
}

fn failed(entry: &ScheduleEntry, e: BackupError) -> TickOutcome {
    error!(
        "Scheduled {} backup of {} failed [{}]: {}",
        entry.kind,
        entry.database,
        e.code(),
        e
    );
    TickOutcome::Failed(e)
}
