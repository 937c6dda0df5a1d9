//! Dependency analysis: builds the pass DAG from the normalized accesses.
//!
//! Accesses to a resource are split into epochs. An epoch is either a single write, or a run of reads in the
//! same state. Every pass of an epoch depends on every pass of the previous epoch, so writes wait on all readers
//! before them and reads wait on the last write. Reads in the same state do not depend on each other.
//! A read in a different state starts a new epoch, since the state transition has to wait for earlier readers.
//!
//! Readers of one epoch share the barrier recorded before the first of them. Once queues are assigned,
//! [`DependencyGraph::order_shared_transitions`] orders readers on other queues after that pass.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::{Direction, Graph};

use crate::graph::pass::PassId;
use crate::graph::resource::ResourceId;
use crate::graph::FrameGraph;
use crate::phases::pass_info::PassInfoAnalysis;
use crate::phases::schedule::QueueSchedule;
use crate::resource::state::ResourceState;

/// Reason for an edge in the dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyEdge {
    /// Resources that create this dependency.
    pub resources: Vec<ResourceId>,
    /// The edge was declared explicitly with [`PassBuilder::after`](crate::graph::pass::PassBuilder::after)
    /// or [`FrameGraph::add_dependency`].
    pub explicit: bool,
}

/// The pass dependency DAG. Node indices equal pass indices.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: Graph<PassId, DependencyEdge>,
}

/// Dependency levels and the critical path of the DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Passes grouped by the length of the longest dependency chain leading to them. Passes of one level
    /// do not depend on each other.
    pub levels: Vec<Vec<PassId>>,
    /// The longest dependency chain in the graph.
    pub critical_path: Vec<PassId>,
}

#[derive(Debug)]
struct Epoch {
    state: ResourceState,
    write: bool,
    members: Vec<PassId>,
    producers: Vec<PassId>,
}

#[derive(Debug, Copy, Clone)]
struct ReadRun {
    state: ResourceState,
    /// The reader that records the barrier into `state`. `None` if the resource was imported in that state.
    opener: Option<PassId>,
}

impl DependencyGraph {
    fn node(pass: PassId) -> NodeIndex {
        NodeIndex::new(pass.index())
    }

    fn add_edge(&mut self, from: PassId, to: PassId, resource: Option<ResourceId>) {
        let (a, b) = (Self::node(from), Self::node(to));
        let edge = match self.graph.find_edge(a, b) {
            Some(edge) => edge,
            None => self.graph.add_edge(a, b, DependencyEdge::default()),
        };
        let weight = &mut self.graph[edge];
        match resource {
            Some(resource) if !weight.resources.contains(&resource) => weight.resources.push(resource),
            Some(_) => {}
            None => weight.explicit = true,
        }
    }

    /// Amount of passes in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Passes that must execute before `pass`.
    pub fn predecessors(&self, pass: PassId) -> impl Iterator<Item = PassId> + '_ {
        self.graph
            .edges_directed(Self::node(pass), Direction::Incoming)
            .map(|edge| self.graph[edge.source()])
    }

    /// Passes that must execute after `pass`.
    pub fn successors(&self, pass: PassId) -> impl Iterator<Item = PassId> + '_ {
        self.graph
            .edges_directed(Self::node(pass), Direction::Outgoing)
            .map(|edge| self.graph[edge.target()])
    }

    /// Every edge, as `(producer, consumer, reason)`.
    pub fn edges(&self) -> impl Iterator<Item = (PassId, PassId, &DependencyEdge)> + '_ {
        self.graph
            .edge_references()
            .map(|edge| (self.graph[edge.source()], self.graph[edge.target()], edge.weight()))
    }

    pub fn edge(&self, from: PassId, to: PassId) -> Option<&DependencyEdge> {
        self.graph
            .find_edge(Self::node(from), Self::node(to))
            .map(|edge| &self.graph[edge])
    }

    /// Get the underlying petgraph graph.
    pub fn inner(&self) -> &Graph<PassId, DependencyEdge> {
        &self.graph
    }

    /// Whether a directed path leads from `from` to `to`.
    pub fn has_path(&self, from: PassId, to: PassId) -> bool {
        from != to && petgraph::algo::has_path_connecting(&self.graph, Self::node(from), Self::node(to), None)
    }

    /// Group the passes into dependency levels and find the critical path. The graph must be acyclic.
    pub fn topology(&self, order: &[PassId]) -> Topology {
        let mut level = vec![0usize; self.len()];
        for pass in order {
            for successor in self.successors(*pass) {
                level[successor.index()] = level[successor.index()].max(level[pass.index()] + 1);
            }
        }
        let depth = level.iter().copied().max().map_or(0, |max| max + 1);
        let mut levels = vec![vec![]; depth];
        for pass in order {
            levels[level[pass.index()]].push(*pass);
        }
        for passes in &mut levels {
            passes.sort();
        }

        // Height: length of the longest chain starting at a pass.
        let mut height = vec![0usize; self.len()];
        for pass in order.iter().rev() {
            height[pass.index()] = self
                .successors(*pass)
                .map(|successor| height[successor.index()] + 1)
                .max()
                .unwrap_or(0);
        }
        let mut critical_path = vec![];
        let mut current = order
            .iter()
            .copied()
            .filter(|pass| self.predecessors(*pass).next().is_none())
            .min_by_key(|pass| (Reverse(height[pass.index()]), *pass));
        while let Some(pass) = current {
            critical_path.push(pass);
            current = self
                .successors(pass)
                .filter(|successor| height[successor.index()] + 1 == height[pass.index()])
                .min();
        }

        Topology {
            levels,
            critical_path,
        }
    }

    /// Order every reader of a resource state after the pass that records the barrier into that state, when
    /// the two run on different queues. Without this edge the reader could access the resource while the
    /// other queue is still transitioning it.
    ///
    /// New edges always point forward in the schedule's order, so the schedule stays valid.
    pub fn order_shared_transitions(&mut self, graph: &FrameGraph, info: &PassInfoAnalysis, schedule: &QueueSchedule) {
        let mut runs: Vec<Option<ReadRun>> = vec![None; graph.resources().len()];
        let mut touched = vec![false; graph.resources().len()];
        for pass in schedule.order() {
            for access in &info.get(*pass).accesses {
                let index = access.resource.index();
                let node = &graph.resources()[index];
                if access.kind.is_write() {
                    runs[index] = None;
                } else {
                    match runs[index] {
                        Some(run) if run.state == access.state => {
                            if let Some(opener) = run.opener {
                                if schedule.queue_of(opener) != schedule.queue_of(*pass) {
                                    trace!("{pass} reads after the transition recorded before {opener}");
                                    self.add_edge(opener, *pass, Some(access.resource));
                                }
                            }
                        }
                        _ => {
                            let unchanged = !touched[index] && node.is_imported() && node.initial_state() == access.state;
                            runs[index] = Some(ReadRun {
                                state: access.state,
                                opener: (!unchanged).then_some(*pass),
                            });
                        }
                    }
                }
                touched[index] = true;
            }
        }
    }

    /// Topologically sort the passes. Among passes that are ready at the same time, the one declared first
    /// is emitted first, so the order is deterministic and equals declaration order whenever possible.
    ///
    /// On failure, returns every strongly connected component that forms a cycle.
    pub fn topological_order(&self) -> Result<Vec<PassId>, Vec<Vec<PassId>>> {
        let count = self.graph.node_count();
        let mut in_degree = vec![0usize; count];
        for edge in self.graph.edge_references() {
            in_degree[edge.target().index()] += 1;
        }
        let mut ready = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(index))
            .collect::<BinaryHeap<_>>();

        let mut order = Vec::with_capacity(count);
        while let Some(Reverse(index)) = ready.pop() {
            let node = NodeIndex::new(index);
            order.push(self.graph[node]);
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                let target = edge.target().index();
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    ready.push(Reverse(target));
                }
            }
        }

        if order.len() == count {
            return Ok(order);
        }
        let cycles = petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some())
            .map(|scc| {
                let mut passes = scc.into_iter().map(|node| self.graph[node]).collect::<Vec<_>>();
                passes.sort();
                passes
            })
            .collect();
        Err(cycles)
    }
}

/// Build the dependency graph of a frame.
pub fn analyze(graph: &FrameGraph, info: &PassInfoAnalysis) -> DependencyGraph {
    let mut deps = DependencyGraph::default();
    for pass in &info.passes {
        deps.graph.add_node(pass.id);
    }

    let mut epochs: Vec<Option<Epoch>> = (0..graph.resources().len()).map(|_| None).collect();
    for pass in &info.passes {
        for access in &pass.accesses {
            let slot = &mut epochs[access.resource.index()];
            let write = access.kind.is_write();
            let Some(epoch) = slot.as_mut() else {
                *slot = Some(Epoch {
                    state: access.state,
                    write,
                    members: vec![pass.id],
                    producers: vec![],
                });
                continue;
            };

            if !write && !epoch.write && epoch.state == access.state {
                let producers = epoch.producers.clone();
                epoch.members.push(pass.id);
                for producer in producers {
                    deps.add_edge(producer, pass.id, Some(access.resource));
                }
            } else {
                let previous = std::mem::replace(&mut epoch.members, vec![pass.id]);
                for member in &previous {
                    deps.add_edge(*member, pass.id, Some(access.resource));
                }
                epoch.producers = previous;
                epoch.state = access.state;
                epoch.write = write;
            }
        }
    }

    for (before, after) in graph.dependencies() {
        deps.add_edge(*before, *after, None);
    }

    trace!(
        "Dependency graph has {} passes and {} edges",
        deps.graph.node_count(),
        deps.graph.edge_count()
    );
    deps
}
