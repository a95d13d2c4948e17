use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::task::TaskId;

pub use anyhow::Error as RuntimeError;

/// Errors raised by [`Scheduler`](crate::Scheduler) before any task is
/// dispatched. Failures of individual tasks never surface here, they are
/// collected into the [`RunResult`](crate::RunResult) instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cycle(#[from] CycleDetectedError),

    #[error("Task '{task}' depends on '{dependency}', which is not registered")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("'{0}' does not correspond to any registered task")]
    UnknownTask(String),

    #[error("Couldn't compile name pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Cache store:\n{0}")]
    Cache(#[from] CacheError),
}

/// Raised at registration time.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Task '{0}' is already registered with a different body")]
    IdentityCollision(TaskId),

    #[error("Invalid task name '{0}': use letters, digits, '_', '-' or '.'")]
    InvalidName(String),

    #[error("Task family '{0}' is not registered")]
    UnknownFamily(String),
}

/// The dependency graph contains a cycle. Carries the full cycle path, the
/// first node is repeated at the end.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub struct CycleDetectedError {
    pub path: Vec<TaskId>,
}

impl fmt::Display for CycleDetectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cycle detected in task graph: ")?;

        for (i, id) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{id}")?;
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't access cache data.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't encode cache data.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode cache data.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Cache partition '{0}' is corrupt: {1}")]
    Corrupt(Utf8PathBuf, String),

    #[error("Couldn't flush records of '{0}' after retrying.\n{1}")]
    Flush(TaskId, Box<CacheError>),

    #[error("Cache handle of '{0}' was already finalized")]
    Finalized(TaskId),

    #[error("No cached data for '{0}'")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't parse configuration.\n{0}")]
    Toml(#[from] toml::de::Error),
}

/// Why a single task ended up FAILED.
#[derive(Debug, Error)]
pub enum TaskExecutionError {
    #[error("{0:#}")]
    Body(anyhow::Error),

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// A dependent read data that may not reflect a complete, current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleDependencyWarning {
    pub task: TaskId,
    pub dependency: TaskId,
    pub reason: StaleReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The dependency's record is not finalized.
    Incomplete,
    /// The dependency was excluded from this run, its prior cache is read.
    Excluded,
    /// The dependency has no record at all.
    Missing,
}

impl fmt::Display for StaleDependencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.reason {
            StaleReason::Incomplete => "is incomplete",
            StaleReason::Excluded => "was excluded from this run",
            StaleReason::Missing => "has no cached data",
        };
        write!(f, "'{}' read '{}', which {}", self.task, self.dependency, reason)
    }
}

/// Non-fatal diagnostics gathered during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    Stale(StaleDependencyWarning),
    /// A body read a task family it never declared a dependency on.
    UndeclaredRead { task: TaskId, family: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::Stale(warning) => write!(f, "{warning}"),
            Warning::UndeclaredRead { task, family } => write!(
                f,
                "'{task}' read '{family}' without declaring it, ordering is not guaranteed"
            ),
        }
    }
}
