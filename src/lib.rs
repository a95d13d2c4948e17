#![forbid(unsafe_code)]
//! Dependency-aware parallel task scheduler with an incremental result cache.
//!
//! Tasks are named, parameterized computations that produce records one at a
//! time. Every record is appended to a per-task cache partition and flushed
//! to disk periodically, so an interrupted or failed task keeps what it
//! produced so far. On every [`Scheduler::run`] only the tasks without a
//! finalized record, or the ones explicitly asked for, are executed; their
//! dependents follow when cascading is on.
//!
//! ```rust,no_run
//! use stratum::{Record, RunPolicy, Scheduler, Settings, Step, Value, producer};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut scheduler = Scheduler::new(Settings::new(".stratum"));
//!
//! let sim = scheduler.task("sim").run(|_| {
//!     Ok(producer::records(
//!         (0..100).map(|i| Ok(Record::from([("x".to_string(), Value::from(i))]))),
//!     ))
//! })?;
//!
//! scheduler.task("vis").depends_on(&sim).run(|ctx| {
//!     let count = ctx.load("sim")?.records().map(|record| record.len()).sum::<usize>();
//!     let mut done = false;
//!     Ok(producer::from_fn(move || {
//!         if done {
//!             return Ok(Step::Done);
//!         }
//!         done = true;
//!         let fields = Record::from([("count".to_string(), Value::from(count as u64))]);
//!         Ok(Step::Once(fields))
//!     }))
//! })?;
//!
//! let result = scheduler.run(&RunPolicy::default())?;
//! print!("{}", result.report());
//! # Ok(())
//! # }
//! ```

pub mod cache;
mod config;
mod core;
mod engine;
mod error;
mod graph;
#[cfg(feature = "logging")]
pub mod logging;
mod planner;
mod progress;
mod task;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use console::style;

pub use crate::cache::{CacheRecord, CacheStore, FlushPolicy, Loaded, RecordState};
pub use crate::config::{HookMode, RunPolicy, Settings};
pub use crate::core::{ArcStr, Hash32, Record, Value};
pub use crate::engine::{
    Diagnostics, RunResult, SkipReason, SkippedTask, TaskExecution, TaskFailure,
};
pub use crate::error::*;
pub use crate::graph::DependencyGraph;
pub use crate::planner::{Disposition, RunPlan, Selection};
pub use crate::progress::{
    ProgressDelta, ProgressMonitor, ProgressObserver, ProgressSnapshot, TaskProgress, TaskStatus,
};
pub use crate::task::{
    Params, Producer, Registry, Step, Task, TaskBody, TaskContext, TaskId, producer,
};

use crate::engine::Executor;
use crate::progress::ProgressAggregator;
use crate::task::FamilySpec;

type HookCallback = Box<dyn Fn(&RunResult, &ProgressSnapshot) -> anyhow::Result<()> + Send + Sync>;

/// Callbacks fired by [`Scheduler::run`].
pub enum Hook {
    AtEnd(HookCallback),
}

impl Hook {
    /// Runs once per run, on the calling thread, after every task reached a
    /// terminal state. Receives the result and the final progress snapshot.
    /// An error is recorded in [`RunResult::hook_errors`] and changes nothing
    /// else.
    pub fn at_end<F>(fun: F) -> Self
    where
        F: Fn(&RunResult, &ProgressSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Hook::AtEnd(Box::new(fun))
    }
}

/// Owns the task registry and the cache, and runs the tasks.
///
/// There is no global state, everything lives in this value.
pub struct Scheduler {
    registry: Registry,
    settings: Settings,
    store: CacheStore,
    hooks: Vec<Hook>,
    observers: Vec<Arc<dyn ProgressObserver>>,
    monitor: ProgressMonitor,
}

impl Scheduler {
    pub fn new(settings: Settings) -> Self {
        let store = CacheStore::new(
            settings.cache_dir.clone(),
            FlushPolicy {
                max_bytes: settings.flush_bytes,
                interval: settings.flush_interval,
            },
        );

        Self {
            registry: Registry::new(),
            settings,
            store,
            hooks: Vec::new(),
            observers: Vec::new(),
            monitor: ProgressMonitor::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Starts the definition of a task family.
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            scheduler: self,
            name: name.into(),
            depends: Vec::new(),
            reads: Vec::new(),
            description: None,
        }
    }

    /// Registers the parameterless instance of `name`.
    pub fn register(
        &mut self,
        name: &str,
        body: TaskBody,
        depends: &[TaskId],
    ) -> Result<TaskId, SchedulerError> {
        let spec = FamilySpec {
            name: name.into(),
            body: body.0,
            depends: depends.to_vec(),
            reads: Vec::new(),
            description: None,
        };

        Ok(self.registry.register(spec)?)
    }

    /// Adds an instance of an already defined family for a parameter sweep.
    pub fn add_instance(&mut self, name: &str, params: Params) -> Result<TaskId, SchedulerError> {
        Ok(self.registry.add_instance(name, params)?)
    }

    /// Every registered task, ordered by identity.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.registry.tasks()
    }

    pub fn add_hook(&mut self, hook: Hook) -> &mut Self {
        self.hooks.push(hook);
        self
    }

    /// Receives throttled progress snapshots during every run.
    pub fn observe(&mut self, observer: impl ProgressObserver + 'static) -> &mut Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Handle to the latest progress snapshot, usable from other threads
    /// while a run is in progress.
    pub fn progress(&self) -> ProgressMonitor {
        self.monitor.clone()
    }

    /// Reads cached data of the registered instances of a task family, see
    /// [`CacheStore::load`].
    pub fn load(&self, name: &str, filter: Option<&Params>) -> Result<Loaded, CacheError> {
        let instances = self.registry.instances(name).unwrap_or_default();
        self.store.load(name, instances, filter)
    }

    /// Computes what a run with `policy` would do, without running anything.
    pub fn plan(&self, policy: &RunPolicy) -> Result<RunPlan, SchedulerError> {
        let (_, plan) = self.prepare(policy)?;
        Ok(plan)
    }

    fn prepare(&self, policy: &RunPolicy) -> Result<(DependencyGraph, RunPlan), SchedulerError> {
        let graph = DependencyGraph::build(&self.registry)?;

        let selection = Selection {
            force: policy.force,
            rerun: self.registry.resolve_all(&policy.rerun)?,
            exclude: self.registry.resolve_all(&policy.exclude)?,
            cascade: policy.cascade,
        };

        let mut states = BTreeMap::new();
        for id in graph.nodes() {
            states.insert(id.clone(), self.store.state(id)?);
        }

        let plan = planner::plan(&graph, &states, &selection);
        Ok((graph, plan))
    }

    /// Builds the dependency graph, plans, and executes.
    ///
    /// Only problems found before any task starts are returned as errors: a
    /// cycle, an unknown dependency or name, or an unreadable cache. Task
    /// failures are collected into the [`RunResult`].
    pub fn run(&self, policy: &RunPolicy) -> Result<RunResult, SchedulerError> {
        tracing::info!(
            "{} {}",
            style("stratum").red(),
            style("run").blue()
        );

        if policy.hooks == HookMode::Only {
            let mut result = RunResult::default();
            self.run_hooks(&mut result, &ProgressSnapshot::default());
            return Ok(result);
        }

        let (graph, plan) = self.prepare(policy)?;

        let mut store = self.store.clone();
        store.set_policy(self.settings.flush_policy(policy));

        let mut progress = ProgressAggregator::new(self.settings.progress_interval)
            .with_monitor(self.monitor.clone());
        for observer in &self.observers {
            progress.observe(observer.clone());
        }

        let executor = Executor {
            registry: &self.registry,
            graph: &graph,
            store: &store,
            workers: policy.workers(),
        };

        let mut result = executor.execute(&plan, &mut progress)?;

        if policy.hooks == HookMode::Run {
            let snapshot = progress.snapshot();
            debug_assert!(snapshot.all_terminal());
            self.run_hooks(&mut result, &snapshot);
        }

        Ok(result)
    }

    fn run_hooks(&self, result: &mut RunResult, snapshot: &ProgressSnapshot) {
        for hook in &self.hooks {
            match hook {
                Hook::AtEnd(callback) => {
                    if let Err(err) = callback(result, snapshot) {
                        tracing::error!("end-of-run hook failed: {err:#}");
                        result.hook_errors.push(err);
                    }
                }
            }
        }
    }

    /// Removes the cached data of the named tasks, or of every registered
    /// task when `names` is empty. Returns the tasks that had data.
    pub fn delete<S>(&self, names: &[S]) -> Result<Vec<TaskId>, SchedulerError>
    where
        S: AsRef<str>,
    {
        let ids: BTreeSet<TaskId> = if names.is_empty() {
            self.registry.tasks().map(|task| task.id().clone()).collect()
        } else {
            self.registry.resolve_all(names)?
        };

        let mut removed = Vec::new();
        for id in ids {
            if self.store.remove(&id)? {
                removed.push(id);
            }
        }

        Ok(removed)
    }

    /// Removes cached data that no longer belongs to a registered task.
    pub fn clean(&self) -> Result<Vec<Utf8PathBuf>, SchedulerError> {
        let keep = self
            .registry
            .tasks()
            .map(|task| task.id().clone())
            .collect();

        Ok(self.store.retain(&keep)?)
    }
}

/// Builder returned by [`Scheduler::task`].
pub struct TaskDef<'a> {
    scheduler: &'a mut Scheduler,
    name: String,
    depends: Vec<TaskId>,
    reads: Vec<ArcStr>,
    description: Option<ArcStr>,
}

impl TaskDef<'_> {
    /// Declares a dependency on one task instance.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.depends.push(id.into());
        self
    }

    /// Declares that the body reads the cache of a whole family. This adds
    /// an edge from every instance of that family registered by the time the
    /// run starts.
    pub fn reads(mut self, family: impl AsRef<str>) -> Self {
        self.reads.push(family.as_ref().into());
        self
    }

    pub fn describe(mut self, description: impl AsRef<str>) -> Self {
        self.description = Some(description.as_ref().into());
        self
    }

    fn spec(&self, body: TaskBody) -> FamilySpec {
        FamilySpec {
            name: self.name.as_str().into(),
            body: body.0,
            depends: self.depends.clone(),
            reads: self.reads.clone(),
            description: self.description.clone(),
        }
    }

    /// Registers the parameterless instance with this body.
    pub fn run<F, P>(self, body: F) -> Result<TaskId, SchedulerError>
    where
        F: Fn(&TaskContext) -> anyhow::Result<P> + Send + Sync + 'static,
        P: Producer + 'static,
    {
        self.run_body(TaskBody::new(body))
    }

    /// Like [`run`](Self::run), with a body that may be shared.
    pub fn run_body(self, body: TaskBody) -> Result<TaskId, SchedulerError> {
        let spec = self.spec(body);
        Ok(self.scheduler.registry.register(spec)?)
    }

    /// Defines the family and adds one instance per parameter set.
    pub fn sweep<F, P, I>(self, body: F, instances: I) -> Result<Vec<TaskId>, SchedulerError>
    where
        F: Fn(&TaskContext) -> anyhow::Result<P> + Send + Sync + 'static,
        P: Producer + 'static,
        I: IntoIterator<Item = Params>,
    {
        let spec = self.spec(TaskBody::new(body));
        self.scheduler.registry.define(spec)?;

        instances
            .into_iter()
            .map(|params| self.scheduler.add_instance(&self.name, params))
            .collect()
    }
}
