//! Decides what runs.
//!
//! A task must run when its record is missing or was never finalized, or when
//! it is named for a rerun. With cascade enabled, everything depending on a
//! task that must run has to run too. Excluded tasks never run, and a task
//! that would run on top of an excluded dependency without a finalized record
//! is skipped as if that dependency had failed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::cache::RecordState;
use crate::graph::DependencyGraph;
use crate::task::TaskId;

/// What the executor does with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Disposition {
    Run,
    SkipCached,
    SkipExcluded,
    SkipDepFailed,
}

impl Disposition {
    pub fn label(self) -> &'static str {
        match self {
            Disposition::Run => "RUN",
            Disposition::SkipCached => "SKIP-CACHED",
            Disposition::SkipExcluded => "SKIP-EXCLUDED",
            Disposition::SkipDepFailed => "SKIP-DEP-FAILED",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Resolved rerun policy, with every name already mapped to identities.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub force: bool,
    pub rerun: BTreeSet<TaskId>,
    pub exclude: BTreeSet<TaskId>,
    pub cascade: bool,
}

impl Selection {
    fn forced(&self, id: &TaskId) -> bool {
        if self.force && self.rerun.is_empty() {
            return true;
        }
        self.rerun.contains(id)
    }
}

/// The outcome of planning: a disposition per task and the layers of tasks
/// to run, in order.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    layers: Vec<Vec<TaskId>>,
    dispositions: BTreeMap<TaskId, Disposition>,
    causes: BTreeMap<TaskId, TaskId>,
    order: Vec<TaskId>,
    edges: Vec<(TaskId, TaskId)>,
}

impl RunPlan {
    /// Layers of tasks with [`Disposition::Run`]. A layer only depends on
    /// the ones before it.
    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    pub fn disposition(&self, id: &TaskId) -> Option<Disposition> {
        self.dispositions.get(id).copied()
    }

    pub fn dispositions(&self) -> impl Iterator<Item = (&TaskId, Disposition)> {
        self.dispositions.iter().map(|(id, disposition)| (id, *disposition))
    }

    /// For a task skipped over a dependency, the dependency responsible.
    pub fn cause(&self, id: &TaskId) -> Option<&TaskId> {
        self.causes.get(id)
    }

    /// Tasks with the given disposition, ordered by identity.
    pub fn with(&self, disposition: Disposition) -> Vec<&TaskId> {
        self.dispositions
            .iter()
            .filter(|(_, d)| **d == disposition)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn to_run(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Layer index of a task that runs.
    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.layers.iter().position(|layer| layer.contains(id))
    }
}

/// Computes the plan for `graph` given the persisted state of every task.
/// Tasks absent from `states` are treated as missing.
pub fn plan(
    graph: &DependencyGraph,
    states: &BTreeMap<TaskId, RecordState>,
    selection: &Selection,
) -> RunPlan {
    let state = |id: &TaskId| states.get(id).copied().unwrap_or(RecordState::Missing);

    let mut must_run: BTreeSet<TaskId> = graph
        .nodes()
        .filter(|id| !state(*id).is_fresh() || selection.forced(*id))
        .cloned()
        .collect();

    if selection.cascade {
        let seeds: Vec<TaskId> = must_run.iter().cloned().collect();
        for seed in seeds {
            must_run.extend(
                graph
                    .transitive_dependents(&seed)
                    .into_iter()
                    .filter(|id| !selection.exclude.contains(id)),
            );
        }
    }

    let mut dispositions: BTreeMap<TaskId, Disposition> = BTreeMap::new();
    let mut causes = BTreeMap::new();

    // topological order, so every dependency is decided before its dependents
    for id in graph.nodes() {
        let disposition = if selection.exclude.contains(id) {
            Disposition::SkipExcluded
        } else if !must_run.contains(id) {
            Disposition::SkipCached
        } else {
            let blocked = graph.dependencies(id).into_iter().find(|dependency| {
                match dispositions.get(dependency) {
                    Some(Disposition::SkipExcluded) => !state(dependency).is_fresh(),
                    Some(Disposition::SkipDepFailed) => true,
                    _ => false,
                }
            });

            match blocked {
                Some(dependency) => {
                    causes.insert(id.clone(), dependency);
                    Disposition::SkipDepFailed
                }
                None => Disposition::Run,
            }
        };

        dispositions.insert(id.clone(), disposition);
    }

    let selected: BTreeSet<TaskId> = dispositions
        .iter()
        .filter(|(_, disposition)| **disposition == Disposition::Run)
        .map(|(id, _)| id.clone())
        .collect();

    let plan = RunPlan {
        layers: graph.layers(&selected),
        dispositions,
        causes,
        order: graph.nodes().cloned().collect(),
        edges: graph
            .edges()
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect(),
    };

    tracing::info!(
        run = plan.to_run(),
        cached = plan.with(Disposition::SkipCached).len(),
        excluded = plan.with(Disposition::SkipExcluded).len(),
        blocked = plan.with(Disposition::SkipDepFailed).len(),
        layers = plan.layers.len(),
        "planned run"
    );

    plan
}

/// Renders the plan as a Mermaid flowchart, colored by disposition.
impl fmt::Display for RunPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let index: BTreeMap<&TaskId, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        for (i, id) in self.order.iter().enumerate() {
            let disposition = self.dispositions.get(id).copied();
            let label = id.to_string().replace('"', "#quot;");

            let (text, color) = match disposition {
                Some(Disposition::Run) => {
                    let layer = self.layer_of(id).unwrap_or(0);
                    (format!("RUN, layer {layer}"), "#90EE90")
                }
                Some(Disposition::SkipCached) => ("SKIP-CACHED".to_string(), "#ADD8E6"),
                Some(Disposition::SkipExcluded) => ("SKIP-EXCLUDED".to_string(), "#D3D3D3"),
                Some(Disposition::SkipDepFailed) => ("SKIP-DEP-FAILED".to_string(), "#FFA07A"),
                None => ("?".to_string(), "#FFFFFF"),
            };

            writeln!(f, "    {i}[\"{label}\\n{text}\"]")?;
            writeln!(f, "    style {i} fill:{color}")?;
        }

        for (from, to) in &self.edges {
            if let (Some(from), Some(to)) = (index.get(from), index.get(to)) {
                writeln!(f, "    {from} --> {to}")?;
            }
        }

        Ok(())
    }
}
