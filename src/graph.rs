//! The dependency graph over task identities.
//!
//! An edge `a -> b` means `b` depends on `a`. Edges come from two places:
//! dependencies declared by identity, and families a task declares to read,
//! which expand to every registered instance of that family.

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};

use crate::error::{CycleDetectedError, SchedulerError};
use crate::task::{Registry, TaskId};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Acyclic graph of registered task instances.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    /// Nodes in a topological order, computed once at build time.
    order: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Builds the graph of every registered task and rejects it if it
    /// contains a cycle.
    pub fn build(registry: &Registry) -> Result<Self, SchedulerError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for task in registry.tasks() {
            let node = graph.add_node(task.id().clone());
            index.insert(task.id().clone(), node);
        }

        for task in registry.tasks() {
            let target = index[task.id()];

            for dependency in task.depends() {
                let Some(&source) = index.get(dependency) else {
                    return Err(SchedulerError::UnknownDependency {
                        task: task.id().clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.update_edge(source, target, ());
            }

            for family in task.reads() {
                if family == task.id().name() {
                    continue;
                }

                let Some(instances) = registry.instances(family) else {
                    tracing::warn!(
                        task = %task.id(),
                        family,
                        "declared read of an unknown task family"
                    );
                    continue;
                };

                for instance in instances {
                    graph.update_edge(index[instance], target, ());
                }
            }
        }

        let mut this = Self {
            graph,
            index,
            order: Vec::new(),
        };

        if let Some(path) = this.find_cycle() {
            let err = CycleDetectedError { path };
            tracing::error!("{err}");
            return Err(err.into());
        }

        this.order = petgraph::algo::toposort(&this.graph, None)
            .map_err(|cycle| CycleDetectedError {
                path: vec![this.graph[cycle.node_id()].clone()],
            })?;

        tracing::debug!(
            nodes = this.graph.node_count(),
            edges = this.graph.edge_count(),
            "built dependency graph"
        );

        Ok(this)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Every task in a topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskId> {
        self.order.iter().map(|&node| &self.graph[node])
    }

    /// Every edge as `(dependency, dependent)`.
    pub fn edges(&self) -> impl Iterator<Item = (&TaskId, &TaskId)> {
        self.graph
            .edge_references()
            .map(|edge| (&self.graph[edge.source()], &self.graph[edge.target()]))
    }

    /// Direct dependencies of `id`.
    pub fn dependencies(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`.
    pub fn dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> BTreeSet<TaskId> {
        let Some(&node) = self.index.get(id) else {
            return BTreeSet::new();
        };

        self.graph
            .neighbors_directed(node, direction)
            .map(|node| self.graph[node].clone())
            .collect()
    }

    /// Every task reachable from `id` along dependency edges, not including
    /// `id` itself.
    pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return found;
        };

        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                found.insert(self.graph[node].clone());
            }
        }

        found
    }

    /// Groups all tasks into layers: layer `n + 1` only depends on layers up
    /// to `n`, tasks within a layer are independent.
    pub fn topological_layers(&self) -> Vec<Vec<TaskId>> {
        let all = self.index.keys().cloned().collect();
        self.layers(&all)
    }

    /// Groups `selected` into layers the same way, but only selected tasks
    /// occupy a layer. Ordering through unselected tasks is kept: if `a`
    /// reaches `c` only through an unselected `b`, `c` still lands in a
    /// later layer than `a`.
    pub fn layers(&self, selected: &BTreeSet<TaskId>) -> Vec<Vec<TaskId>> {
        // `after[n]` is the first layer a dependent of `n` may occupy.
        let mut after = vec![0usize; self.graph.node_count()];
        let mut layers: Vec<BTreeSet<TaskId>> = Vec::new();

        for &node in &self.order {
            let earliest = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|dependency| after[dependency.index()])
                .max()
                .unwrap_or(0);

            let id = &self.graph[node];
            if selected.contains(id) {
                if layers.len() <= earliest {
                    layers.resize_with(earliest + 1, BTreeSet::new);
                }
                layers[earliest].insert(id.clone());
                after[node.index()] = earliest + 1;
            } else {
                after[node.index()] = earliest;
            }
        }

        layers
            .into_iter()
            .map(|layer| layer.into_iter().collect())
            .collect()
    }

    /// DFS with three colors, a gray successor is a back edge. Returns the
    /// cycle with its first node repeated at the end.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color = vec![Color::White; self.graph.node_count()];

        let mut starts: Vec<NodeIndex> = self.graph.node_indices().collect();
        starts.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        for start in starts {
            if color[start.index()] != Color::White {
                continue;
            }

            color[start.index()] = Color::Gray;
            let mut stack = vec![(start, self.successors(start))];

            loop {
                let Some((node, next)) = stack.last_mut() else {
                    break;
                };
                let node = *node;

                match next.pop() {
                    Some(succ) => match color[succ.index()] {
                        Color::White => {
                            color[succ.index()] = Color::Gray;
                            stack.push((succ, self.successors(succ)));
                        }
                        Color::Gray => {
                            let from = stack
                                .iter()
                                .position(|(node, _)| *node == succ)
                                .unwrap_or(0);

                            let mut path: Vec<TaskId> = stack[from..]
                                .iter()
                                .map(|(node, _)| self.graph[*node].clone())
                                .collect();
                            path.push(self.graph[succ].clone());

                            return Some(path);
                        }
                        Color::Black => {}
                    },
                    None => {
                        color[node.index()] = Color::Black;
                        stack.pop();
                    }
                }
            }
        }

        None
    }

    /// Successors sorted so the last one pops first in identity order.
    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut succ: Vec<_> = self.graph.neighbors(node).collect();
        succ.sort_by(|a, b| self.graph[*b].cmp(&self.graph[*a]));
        succ
    }
}
