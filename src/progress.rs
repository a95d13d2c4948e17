//! Per-task progress, aggregated from worker events.
//!
//! Workers never touch this state directly. They send events over the
//! executor's channel and the calling thread folds them into a
//! [`ProgressAggregator`], which hands throttled snapshots to observers.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::planner::Disposition;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    SkippedCached,
    SkippedExcluded,
    SkippedDepFailed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "PASS",
            TaskStatus::Failed => "FAIL",
            TaskStatus::SkippedCached => "SKIP-CACHED",
            TaskStatus::SkippedExcluded => "SKIP-EXCLUDED",
            TaskStatus::SkippedDepFailed => "SKIP-DEP-FAILED",
        }
    }
}

impl From<Disposition> for TaskStatus {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Run => TaskStatus::Pending,
            Disposition::SkipCached => TaskStatus::SkippedCached,
            Disposition::SkipExcluded => TaskStatus::SkippedExcluded,
            Disposition::SkipDepFailed => TaskStatus::SkippedDepFailed,
        }
    }
}

/// A change reported for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressDelta {
    Started { total: Option<u64> },
    Advanced(u64),
    Finished(TaskStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub status: TaskStatus,
    /// Records produced so far.
    pub iterations: u64,
    /// Expected number of records, when the producer knows it.
    pub total: Option<u64>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub tasks: BTreeMap<TaskId, TaskProgress>,
}

impl ProgressSnapshot {
    pub fn get(&self, id: &TaskId) -> Option<&TaskProgress> {
        self.tasks.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskId, &TaskProgress)> {
        self.tasks.iter()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks
            .values()
            .filter(|task| task.status == status)
            .count()
    }

    /// True once every known task reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|task| task.status.is_terminal())
    }
}

/// Receives progress snapshots, at most once per progress interval.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressSnapshot) + Send + Sync,
{
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self(snapshot)
    }
}

/// Shared read access to the latest emitted snapshot, for consumers that
/// poll from another thread.
#[derive(Debug, Clone, Default)]
pub struct ProgressMonitor {
    inner: Arc<RwLock<ProgressSnapshot>>,
}

impl ProgressMonitor {
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn all_terminal(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .all_terminal()
    }

    fn publish(&self, snapshot: &ProgressSnapshot) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
    }
}

struct Entry {
    status: TaskStatus,
    iterations: u64,
    total: Option<u64>,
    started: Option<Instant>,
    elapsed: Duration,
}

pub struct ProgressAggregator {
    tasks: BTreeMap<TaskId, Entry>,
    interval: Duration,
    last_emit: Option<Instant>,
    observers: Vec<Arc<dyn ProgressObserver>>,
    monitor: ProgressMonitor,
}

impl ProgressAggregator {
    pub fn new(interval: Duration) -> Self {
        Self {
            tasks: BTreeMap::new(),
            interval,
            last_emit: None,
            observers: Vec::new(),
            monitor: ProgressMonitor::default(),
        }
    }

    pub fn with_monitor(mut self, monitor: ProgressMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn observe(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    /// Starts tracking a task with an initial status.
    pub fn track(&mut self, id: TaskId, status: TaskStatus) {
        self.tasks.insert(
            id,
            Entry {
                status,
                iterations: 0,
                total: None,
                started: None,
                elapsed: Duration::ZERO,
            },
        );
    }

    /// Folds one event in and notifies observers if the interval allows it.
    pub fn on_event(&mut self, id: &TaskId, delta: ProgressDelta) {
        let entry = self.tasks.entry(id.clone()).or_insert_with(|| Entry {
            status: TaskStatus::Pending,
            iterations: 0,
            total: None,
            started: None,
            elapsed: Duration::ZERO,
        });

        match delta {
            ProgressDelta::Started { total } => {
                entry.status = TaskStatus::Running;
                entry.total = total;
                entry.started = Some(Instant::now());
            }
            ProgressDelta::Advanced(count) => {
                entry.iterations += count;
            }
            ProgressDelta::Finished(status) => {
                entry.status = status;
                if let Some(started) = entry.started.take() {
                    entry.elapsed = started.elapsed();
                }
            }
        }

        self.emit(false);
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|entry| entry.status)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let tasks = self
            .tasks
            .iter()
            .map(|(id, entry)| {
                let elapsed = match entry.started {
                    Some(started) => started.elapsed(),
                    None => entry.elapsed,
                };

                let progress = TaskProgress {
                    status: entry.status,
                    iterations: entry.iterations,
                    total: entry.total,
                    elapsed,
                };

                (id.clone(), progress)
            })
            .collect();

        ProgressSnapshot { tasks }
    }

    /// Emits the current state regardless of the interval.
    pub fn flush(&mut self) {
        self.emit(true);
    }

    fn emit(&mut self, force: bool) {
        let due = self
            .last_emit
            .is_none_or(|last| last.elapsed() >= self.interval);

        if !force && !due {
            return;
        }

        let snapshot = self.snapshot();
        self.monitor.publish(&snapshot);
        for observer in &self.observers {
            observer.on_progress(&snapshot);
        }

        self.last_emit = Some(Instant::now());
    }
}
