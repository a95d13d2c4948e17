//! Layer-by-layer execution of a [`RunPlan`].
//!
//! Every layer is spawned into a rayon scope on a pool of the requested
//! size, and the scope end is the barrier before the next layer. Workers
//! report progress and completion over a channel drained by the calling
//! thread, which owns all aggregate state: the [`RunResult`], the progress
//! aggregator, and the set of tasks blocked by a failure.

mod diagnostics;
mod worker;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc::channel;

use console::style;
use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::CacheStore;
use crate::core::ArcStr;
use crate::error::{RuntimeError, SchedulerError, TaskExecutionError, Warning};
use crate::graph::DependencyGraph;
use crate::planner::{Disposition, RunPlan};
use crate::progress::{ProgressAggregator, ProgressDelta, TaskStatus};
use crate::task::{Registry, TaskContext, TaskId};

pub use diagnostics::{Diagnostics, TaskExecution};
use worker::{Completion, Event};

/// A task that ran and failed.
#[derive(Debug)]
pub struct TaskFailure {
    pub id: TaskId,
    pub error: TaskExecutionError,
}

/// Why a task was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Its finalized record was current.
    Cached,
    /// It was excluded from the run.
    Excluded,
    /// A task it depends on failed, or was excluded without a usable record.
    DependencyFailed(TaskId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTask {
    pub id: TaskId,
    pub reason: SkipReason,
}

/// Everything that happened during a run. Task failures end up here instead
/// of being raised; the caller decides what they mean.
#[derive(Debug, Default)]
pub struct RunResult {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskFailure>,
    pub skipped: Vec<SkippedTask>,
    pub warnings: Vec<Warning>,
    /// Errors returned by end-of-run hooks.
    pub hook_errors: Vec<RuntimeError>,
    pub diagnostics: Diagnostics,
}

impl RunResult {
    /// True when nothing failed and nothing was skipped because of a failure.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && !self
                .skipped
                .iter()
                .any(|skip| matches!(skip.reason, SkipReason::DependencyFailed(_)))
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }

    /// Final status of a task, if it was part of the run.
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        if self.completed.contains(id) {
            return Some(TaskStatus::Completed);
        }

        if self.failed.iter().any(|failure| &failure.id == id) {
            return Some(TaskStatus::Failed);
        }

        self.skipped
            .iter()
            .find(|skip| &skip.id == id)
            .map(|skip| match skip.reason {
                SkipReason::Cached => TaskStatus::SkippedCached,
                SkipReason::Excluded => TaskStatus::SkippedExcluded,
                SkipReason::DependencyFailed(_) => TaskStatus::SkippedDepFailed,
            })
    }

    pub fn failure(&self, id: &TaskId) -> Option<&TaskFailure> {
        self.failed.iter().find(|failure| &failure.id == id)
    }

    /// Human readable summary, one line per task.
    pub fn report(&self) -> String {
        let mut out = String::new();

        // writing into a String cannot fail
        for id in &self.completed {
            let time = self
                .diagnostics
                .execution_times
                .get(id)
                .map(|exec| format!(" ({:.2?})", exec.duration))
                .unwrap_or_default();
            let _ = writeln!(out, "{} {id}{time}", style("PASS").green().bold());
        }

        for failure in &self.failed {
            let _ = writeln!(
                out,
                "{} {}: {}",
                style("FAIL").red().bold(),
                failure.id,
                failure.error
            );
        }

        for skip in &self.skipped {
            let _ = match &skip.reason {
                SkipReason::Cached => {
                    writeln!(out, "{} {} (cached)", style("SKIP").dim(), skip.id)
                }
                SkipReason::Excluded => {
                    writeln!(out, "{} {} (excluded)", style("SKIP").yellow(), skip.id)
                }
                SkipReason::DependencyFailed(cause) => writeln!(
                    out,
                    "{} {} (dependency '{cause}' did not complete)",
                    style("SKIP").red(),
                    skip.id
                ),
            };
        }

        for warning in &self.warnings {
            let _ = writeln!(out, "{} {warning}", style("WARN").yellow().bold());
        }

        for error in &self.hook_errors {
            let _ = writeln!(out, "{} hook: {error:#}", style("FAIL").red().bold());
        }

        out
    }
}

pub(crate) fn style_bar() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

pub(crate) fn style_task() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed}] {pos} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// What the executor needs besides the plan.
pub(crate) struct Executor<'a> {
    pub registry: &'a Registry,
    pub graph: &'a DependencyGraph,
    pub store: &'a CacheStore,
    pub workers: usize,
}

impl Executor<'_> {
    pub fn execute(
        &self,
        plan: &RunPlan,
        progress: &mut ProgressAggregator,
    ) -> Result<RunResult, SchedulerError> {
        let mut result = RunResult::default();
        let excluded: Arc<BTreeSet<TaskId>> = Arc::new(
            plan.with(Disposition::SkipExcluded)
                .into_iter()
                .cloned()
                .collect(),
        );
        let families: Arc<BTreeMap<ArcStr, Vec<TaskId>>> = Arc::new(
            self.registry
                .families()
                .map(|name| {
                    let instances = self.registry.instances(name).unwrap_or_default();
                    (ArcStr::from(name), instances.to_vec())
                })
                .collect(),
        );

        for (id, disposition) in plan.dispositions() {
            progress.track(id.clone(), disposition.into());

            let reason = match disposition {
                Disposition::Run => continue,
                Disposition::SkipCached => SkipReason::Cached,
                Disposition::SkipExcluded => SkipReason::Excluded,
                Disposition::SkipDepFailed => {
                    let cause = plan.cause(id).cloned().unwrap_or_else(|| id.clone());
                    tracing::warn!(
                        task = %id,
                        cause = %cause,
                        "skipping, dependency has no usable record"
                    );
                    SkipReason::DependencyFailed(cause)
                }
            };

            result.skipped.push(SkippedTask {
                id: id.clone(),
                reason,
            });
        }
        progress.flush();

        let total = plan.to_run();
        if total == 0 {
            tracing::info!("nothing to run");
            return Ok(result);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("stratum-worker-{i}"))
            .build()?;

        let root = tracing::span!(Level::INFO, "run");
        root.pb_set_length(total as u64);
        root.pb_set_style(&style_bar());
        root.pb_set_message("Running tasks...");
        let _enter = root.enter();

        tracing::info!(tasks = total, workers = self.workers, "starting run");

        // tasks that will not be dispatched because something upstream failed
        let mut blocked: BTreeMap<TaskId, TaskId> = BTreeMap::new();

        for (n, layer) in plan.layers().iter().enumerate() {
            let runnable: Vec<&TaskId> = layer
                .iter()
                .filter(|id| !blocked.contains_key(*id))
                .collect();
            if runnable.is_empty() {
                continue;
            }

            tracing::debug!(layer = n, tasks = runnable.len(), "dispatching layer");

            pool.in_place_scope(|scope| {
                let (sender, receiver) = channel::<Event>();

                for &id in &runnable {
                    let Some(task) = self.registry.get(id) else {
                        continue;
                    };

                    let declared = task
                        .depends()
                        .iter()
                        .map(|dependency| ArcStr::from(dependency.name()))
                        .chain(task.reads.iter().cloned())
                        .collect();
                    let ctx = TaskContext::new(
                        id.clone(),
                        self.store.clone(),
                        declared,
                        excluded.clone(),
                        families.clone(),
                    );

                    let sender = sender.clone();
                    let store = self.store;
                    scope.spawn(move |_| {
                        let completion = worker::drive(task, ctx, store, &sender);
                        let _ = sender.send(Event::Done(Box::new(completion)));
                    });
                }

                // the loop below ends once every worker dropped its sender
                drop(sender);

                while let Ok(event) = receiver.recv() {
                    match event {
                        Event::Progress(id, delta) => progress.on_event(&id, delta),
                        Event::Done(completion) => {
                            root.pb_inc(1);
                            self.complete(*completion, &mut result, &mut blocked, progress);
                        }
                    }
                }
            });
        }

        progress.flush();

        tracing::info!(
            completed = result.completed.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            "run finished in {:.2?}",
            result.diagnostics.wall_time()
        );

        Ok(result)
    }

    fn complete(
        &self,
        completion: Completion,
        result: &mut RunResult,
        blocked: &mut BTreeMap<TaskId, TaskId>,
        progress: &mut ProgressAggregator,
    ) {
        let Completion {
            id,
            outcome,
            warnings,
            start,
            duration,
        } = completion;

        result.warnings.extend(warnings);
        result.diagnostics.execution_times.insert(
            id.clone(),
            TaskExecution {
                start,
                duration,
                failed: outcome.is_err(),
            },
        );

        match outcome {
            Ok(records) => {
                tracing::info!(task = %id, records, "completed in {duration:.2?}");
                progress.on_event(&id, ProgressDelta::Finished(TaskStatus::Completed));
                result.completed.push(id);
            }
            Err(error) => {
                progress.on_event(&id, ProgressDelta::Finished(TaskStatus::Failed));

                // only tasks that are still pending, everything in the current
                // layer is independent of `id`
                for dependent in self.graph.transitive_dependents(&id) {
                    let pending = progress.status(&dependent) == Some(TaskStatus::Pending);
                    if !pending || blocked.contains_key(&dependent) {
                        continue;
                    }

                    tracing::warn!(task = %dependent, cause = %id, "skipping, dependency failed");
                    progress.on_event(
                        &dependent,
                        ProgressDelta::Finished(TaskStatus::SkippedDepFailed),
                    );
                    blocked.insert(dependent.clone(), id.clone());
                    result.skipped.push(SkippedTask {
                        id: dependent,
                        reason: SkipReason::DependencyFailed(id.clone()),
                    });
                }

                result.failed.push(TaskFailure { id, error });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rules() {
        let mut result = RunResult::default();
        result.completed.push(TaskId::named("a"));
        result.skipped.push(SkippedTask {
            id: TaskId::named("b"),
            reason: SkipReason::Cached,
        });
        assert!(result.is_success());
        assert_eq!(result.status(&TaskId::named("b")), Some(TaskStatus::SkippedCached));

        result.skipped.push(SkippedTask {
            id: TaskId::named("c"),
            reason: SkipReason::DependencyFailed(TaskId::named("x")),
        });
        assert!(!result.is_success());
    }

    #[test]
    fn test_report_lists_every_task() {
        let mut result = RunResult::default();
        result.completed.push(TaskId::named("a"));
        result.failed.push(TaskFailure {
            id: TaskId::named("b"),
            error: TaskExecutionError::Panic("boom".into()),
        });
        result.skipped.push(SkippedTask {
            id: TaskId::named("c"),
            reason: SkipReason::DependencyFailed(TaskId::named("b")),
        });

        console::set_colors_enabled(false);
        let report = result.report();
        assert!(report.contains("PASS a"));
        assert!(report.contains("FAIL b: Task panicked: boom"));
        assert!(report.contains("SKIP c (dependency 'b' did not complete)"));
    }
}
