//! Named periodic tasks with an explicit start/stop lifecycle.
//!
//! The event loop sleeps until `next_deadline()` and then asks `due()`
//! which tasks fired. Time is `tokio::time::Instant`, so paused-clock
//! tests advance it deterministically.
use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// The runtime's periodic tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    /// Broadcast an empty probe on `catchup`.
    CatchupProbe,
    /// Query the bootstrap directories and dial what they return.
    Discovery,
    /// Report peer and post counts to the application.
    StatusRefresh,
}

#[derive(Debug, Clone)]
struct Task {
    period: Duration,
    next: Instant,
    active: bool,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: BTreeMap<TaskKind, Task>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a task. It starts active.
    ///
    /// With `fire_immediately` the first tick is due at `now`, otherwise
    /// one period later.
    pub fn register(&mut self, kind: TaskKind, period: Duration, now: Instant, fire_immediately: bool) {
        let period = period.max(Duration::from_millis(1));
        let next = if fire_immediately { now } else { now + period };
        self.tasks.insert(
            kind,
            Task {
                period,
                next,
                active: true,
            },
        );
    }

    /// Resume a stopped task; its next tick is one period from `now`.
    pub fn start(&mut self, kind: TaskKind, now: Instant) {
        if let Some(task) = self.tasks.get_mut(&kind) {
            if !task.active {
                task.active = true;
                task.next = now + task.period;
            }
        }
    }

    pub fn stop(&mut self, kind: TaskKind) {
        if let Some(task) = self.tasks.get_mut(&kind) {
            task.active = false;
        }
    }

    /// Stop every task (teardown).
    pub fn stop_all(&mut self) {
        for task in self.tasks.values_mut() {
            task.active = false;
        }
    }

    pub fn is_active(&self, kind: TaskKind) -> bool {
        self.tasks.get(&kind).is_some_and(|t| t.active)
    }

    /// Earliest pending tick among active tasks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks
            .values()
            .filter(|t| t.active)
            .map(|t| t.next)
            .min()
    }

    /// Tasks whose tick is due at `now`, rescheduled for their next period.
    ///
    /// A task that fell several periods behind fires once; missed ticks
    /// are skipped, not replayed.
    pub fn due(&mut self, now: Instant) -> Vec<TaskKind> {
        let mut fired = Vec::new();
        for (kind, task) in self.tasks.iter_mut() {
            if !task.active || task.next > now {
                continue;
            }
            fired.push(*kind);
            while task.next <= now {
                task.next += task.period;
            }
        }
        fired
    }
}
