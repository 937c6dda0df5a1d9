//! Queue schedule: assigns each pass to a hardware queue and linearizes the passes of every queue.
//!
//! Passes without a preference go to the primary graphics queue. Compute passes are distributed over the async
//! compute queues in round robin order, copy passes over the copy queues. A pass that needs capabilities its
//! preferred queue type lacks, for example a compute pass reading a vertex buffer, falls back to graphics.
//!
//! All queues follow one global topological order of the DAG, so every queue sequence respects the partial
//! order and passes that are ready at the same time keep their declaration order. [`reorder`] optionally moves
//! passes that share resources closer together afterwards.

use std::collections::HashSet;

use anyhow::Result;

use crate::core::error::Error;
use crate::core::queue::{QueueAffinity, QueueId, QueueInfo, QueueType, PRIMARY_QUEUE};
use crate::graph::pass::PassId;
use crate::phases::dependency::DependencyGraph;
use crate::phases::pass_info::{PassInfo, PassInfoAnalysis};

/// Output of the queue schedule phase.
#[derive(Debug, Clone, Default)]
pub struct QueueSchedule {
    queues: Vec<QueueInfo>,
    assignment: Vec<QueueId>,
    order: Vec<PassId>,
    position: Vec<usize>,
    sequences: Vec<Vec<PassId>>,
    local_index: Vec<usize>,
}

#[derive(Debug, Default)]
struct RoundRobin {
    compute: usize,
    copy: usize,
}

impl QueueSchedule {
    fn from_order(queues: &[QueueInfo], assignment: Vec<QueueId>, order: Vec<PassId>, info: &PassInfoAnalysis) -> Self {
        let mut position = vec![0; order.len()];
        let mut local_index = vec![0; order.len()];
        let mut sequences = vec![vec![]; queues.len()];
        for (index, pass) in order.iter().enumerate() {
            position[pass.index()] = index;
            let sequence: &mut Vec<PassId> = &mut sequences[assignment[pass.index()].index()];
            local_index[pass.index()] = sequence.len();
            sequence.push(*pass);
        }

        for queue in queues {
            let sequence = &sequences[queue.id.index()];
            if !sequence.is_empty() {
                trace!(
                    "{} ({}): {:?}",
                    queue.id,
                    queue.queue_type,
                    sequence.iter().map(|pass| &info.get(*pass).name).collect::<Vec<_>>()
                );
            }
        }

        Self {
            queues: queues.to_vec(),
            assignment,
            order,
            position,
            sequences,
            local_index,
        }
    }

    pub fn queues(&self) -> &[QueueInfo] {
        &self.queues
    }

    /// The queue a pass was assigned to.
    pub fn queue_of(&self, pass: PassId) -> QueueId {
        self.assignment[pass.index()]
    }

    pub fn queue_type_of(&self, pass: PassId) -> QueueType {
        self.queue_type(self.queue_of(pass))
    }

    pub fn queue_type(&self, queue: QueueId) -> QueueType {
        self.queues[queue.index()].queue_type
    }

    /// Global execution order of all passes.
    pub fn order(&self) -> &[PassId] {
        &self.order
    }

    /// Position of a pass in the global order.
    pub fn position(&self, pass: PassId) -> usize {
        self.position[pass.index()]
    }

    /// Passes executed by a queue, in submission order.
    pub fn sequence(&self, queue: QueueId) -> &[PassId] {
        &self.sequences[queue.index()]
    }

    /// Index of a pass in its queue's sequence.
    pub fn local_index(&self, pass: PassId) -> usize {
        self.local_index[pass.index()]
    }

    /// The pass submitted right before `pass` on the same queue.
    pub fn previous_on_queue(&self, pass: PassId) -> Option<PassId> {
        let local = self.local_index(pass);
        (local > 0).then(|| self.sequence(self.queue_of(pass))[local - 1])
    }

    /// Queues that execute at least one pass.
    pub fn active_queues(&self) -> impl Iterator<Item = QueueId> + '_ {
        self.queues
            .iter()
            .map(|queue| queue.id)
            .filter(|queue| !self.sequences[queue.index()].is_empty())
    }
}

fn queues_of_type(queues: &[QueueInfo], queue_type: QueueType) -> Vec<QueueId> {
    queues
        .iter()
        .filter(|queue| queue.queue_type == queue_type)
        .map(|queue| queue.id)
        .collect()
}

fn classify(pass: &PassInfo, queues: &[QueueInfo], counters: &mut RoundRobin) -> QueueId {
    let preferred = match pass.affinity {
        QueueAffinity::Any | QueueAffinity::Graphics => return PRIMARY_QUEUE,
        QueueAffinity::Compute => QueueType::Compute,
        QueueAffinity::Copy => QueueType::Copy,
    };
    let candidates = queues_of_type(queues, preferred);
    if candidates.is_empty() {
        trace!("No {preferred} queue for pass `{}`, using the graphics queue", pass.name);
        return PRIMARY_QUEUE;
    }
    if let Some(access) = pass.accesses.iter().find(|access| !access.state.supported_on(preferred)) {
        debug!(
            "Pass `{}` uses state {} which a {preferred} queue does not support, using the graphics queue",
            pass.name, access.state
        );
        return PRIMARY_QUEUE;
    }
    let counter = match preferred {
        QueueType::Copy => &mut counters.copy,
        _ => &mut counters.compute,
    };
    let queue = candidates[*counter % candidates.len()];
    *counter += 1;
    queue
}

/// Run the queue schedule.
///
/// # Errors
/// - [`Error::CrossQueueCycle`] if the dependency graph has a cycle through passes on different queues.
/// - [`Error::GraphHasCycle`] if it has a cycle within a single queue.
pub fn run(info: &PassInfoAnalysis, deps: &DependencyGraph, queues: &[QueueInfo]) -> Result<QueueSchedule> {
    if queues.first().map(|queue| queue.queue_type) != Some(QueueType::Graphics) {
        return Err(Error::NoCapableQueue.into());
    }

    let mut counters = RoundRobin::default();
    let assignment = info
        .passes
        .iter()
        .map(|pass| classify(pass, queues, &mut counters))
        .collect::<Vec<_>>();

    let order = match deps.topological_order() {
        Ok(order) => order,
        Err(cycles) => {
            for cycle in &cycles {
                let queues = cycle.iter().map(|pass| assignment[pass.index()]).collect::<HashSet<_>>();
                let passes = cycle
                    .iter()
                    .map(|pass| info.get(*pass).name.clone())
                    .collect::<Vec<_>>();
                if queues.len() > 1 {
                    error!("Dependency cycle across {} queues: {:?}", queues.len(), passes);
                    return Err(Error::CrossQueueCycle {
                        passes,
                    }
                    .into());
                }
            }
            error!("Dependency cycle in pass graph: {cycles:?}");
            return Err(Error::GraphHasCycle.into());
        }
    };

    Ok(QueueSchedule::from_order(queues, assignment, order, info))
}

/// Settings of the optional reorder step.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ReorderConfig {
    /// How many passes of the same queue a pass may be moved forward.
    pub max_distance: usize,
    /// Minimum share of resources two passes must have in common, as `shared / union`, to be moved together.
    pub min_affinity: f32,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            max_distance: 8,
            min_affinity: 0.1,
        }
    }
}

/// Move passes that share resources closer together on their queue. This shortens resource lifetimes, so more
/// resources can share memory.
///
/// For each pass in queue order, the later pass of the same queue within `max_distance` with the highest
/// affinity is moved right behind it. A move is skipped when a dependency path connects the moved pass and any
/// pass it would jump over, on any queue, so the result is still a topological order of the DAG.
pub fn reorder(schedule: QueueSchedule, info: &PassInfoAnalysis, deps: &DependencyGraph, config: &ReorderConfig) -> QueueSchedule {
    let QueueSchedule {
        queues,
        assignment,
        mut order,
        ..
    } = schedule;

    let mut moved = 0;
    for queue in &queues {
        let mut current = 0;
        loop {
            // Passes of this queue with their position in the global order.
            let sequence = order
                .iter()
                .copied()
                .enumerate()
                .filter(|(_, pass)| assignment[pass.index()] == queue.id)
                .collect::<Vec<_>>();
            if current + 1 >= sequence.len() {
                break;
            }
            let (_, anchor) = sequence[current];
            let (target, next) = sequence[current + 1];
            let end = sequence.len().min(current + 1 + config.max_distance);

            let mut best: Option<(usize, f32)> = None;
            for (from, candidate) in &sequence[current + 1..end] {
                let score = affinity(info.get(anchor), info.get(*candidate));
                if score <= 0.0 || score < config.min_affinity {
                    continue;
                }
                if best.map_or(false, |(_, best)| best >= score) {
                    continue;
                }
                let blocked = order[target..*from]
                    .iter()
                    .any(|jumped| deps.has_path(*jumped, *candidate) || deps.has_path(*candidate, *jumped));
                if !blocked {
                    best = Some((*from, score));
                }
            }

            if let Some((from, _)) = best.filter(|(from, _)| order[*from] != next) {
                let pass = order.remove(from);
                order.insert(target, pass);
                trace!("Moved `{}` behind `{}`", info.get(pass).name, info.get(anchor).name);
                moved += 1;
            }
            current += 1;
        }
    }

    debug!("Reordering moved {moved} passes");
    QueueSchedule::from_order(&queues, assignment, order, info)
}

/// Jaccard similarity of the resources two passes access.
fn affinity(a: &PassInfo, b: &PassInfo) -> f32 {
    let shared = a
        .accesses
        .iter()
        .filter(|access| b.accesses.iter().any(|other| other.resource == access.resource))
        .count();
    let union = a.accesses.len() + b.accesses.len() - shared;
    if union == 0 {
        return 0.0;
    }
    shared as f32 / union as f32
}
