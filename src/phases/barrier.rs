//! Barrier generation: walks the passes in execution order and tracks the state of every resource.
//!
//! Before each pass, every resource whose required state differs from its tracked state gets a transition
//! barrier. A write followed by another access in the same state gets a hazard barrier, since the access flags
//! do not change but the earlier write still has to be made visible. The first use of a transient resource is a
//! transition from `Undefined`: its memory comes from a pool or an alias group, and its previous contents
//! belong to whatever used the memory before.
//!
//! All barriers in front of one pass are recorded in a single batched barrier command.

use std::collections::HashMap;

use anyhow::Result;
use ash::vk;
use multimap::MultiMap;

use crate::core::error::Error;
use crate::core::queue::{QueueId, QueueType, PRIMARY_QUEUE};
use crate::device::{NativeBarrier, NativeResource};
use crate::graph::pass::PassId;
use crate::graph::resource::{ResourceId, ResourceType};
use crate::graph::FrameGraph;
use crate::phases::aliasing::MemoryAliasing;
use crate::phases::pass_info::PassInfoAnalysis;
use crate::phases::schedule::QueueSchedule;
use crate::resource::state::ResourceState;

/// Why a barrier was emitted.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum BarrierKind {
    /// The resource changes state.
    Transition,
    /// The resource stays in the same state, but an earlier or the current access writes.
    Hazard,
    /// First use of a resource whose memory was used by another resource earlier in the frame.
    Aliasing,
    /// End of frame transition of an imported resource into its final state.
    Final,
}

/// A state transition of one resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Barrier {
    pub resource: ResourceId,
    pub resource_type: ResourceType,
    pub before: ResourceState,
    pub after: ResourceState,
    pub kind: BarrierKind,
    /// Queue the barrier is recorded on.
    pub queue: QueueId,
    /// The previous access happened on another queue. The semaphore wait already orders it, so the barrier
    /// has no source scope.
    pub cross_queue: bool,
}

/// Output of the barrier phase.
#[derive(Debug, Clone, Default)]
pub struct BarrierPlan {
    before_pass: MultiMap<PassId, Barrier>,
    /// Barriers recorded on the primary queue after every pass of the frame completed.
    epilogue: Vec<Barrier>,
    final_states: Vec<ResourceState>,
}

#[derive(Debug, Copy, Clone)]
struct Tracked {
    state: ResourceState,
    queue: Option<QueueId>,
    written: bool,
}

impl Barrier {
    /// Convert into a native barrier for a resource on a queue of the given type.
    pub fn to_native(&self, resource: NativeResource, queue_type: QueueType) -> NativeBarrier {
        let (src_stage, src_access) = match self.kind {
            _ if self.cross_queue => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
            BarrierKind::Aliasing => (vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_WRITE),
            _ => (self.before.stages(queue_type), self.before.access()),
        };
        let (old_layout, new_layout) = match self.resource_type {
            ResourceType::Texture => (self.before.layout(), self.after.layout()),
            ResourceType::Buffer => (vk::ImageLayout::UNDEFINED, vk::ImageLayout::UNDEFINED),
        };
        NativeBarrier {
            resource,
            src_stage,
            src_access,
            dst_stage: self.after.stages(queue_type),
            dst_access: self.after.access(),
            old_layout,
            new_layout,
            discard: self.before == ResourceState::Undefined,
        }
    }
}

impl BarrierPlan {
    /// Barriers to record right before a pass, in one batch.
    pub fn before_pass(&self, pass: PassId) -> &[Barrier] {
        self.before_pass.get_vec(&pass).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Barriers to record at the end of the frame.
    pub fn epilogue(&self) -> &[Barrier] {
        &self.epilogue
    }

    /// State every resource is left in at the end of the frame.
    pub fn final_state(&self, resource: ResourceId) -> ResourceState {
        self.final_states
            .get(resource.index())
            .copied()
            .unwrap_or_default()
    }

    /// Total amount of barriers.
    pub fn len(&self) -> usize {
        self.before_pass.iter_all().map(|(_, barriers)| barriers.len()).sum::<usize>() + self.epilogue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replay the plan in execution order and check that every access finds its resource in the state it
    /// requires, and that every barrier starts from the state the resource is actually in.
    pub fn verify_transitions(&self, graph: &FrameGraph, info: &PassInfoAnalysis, schedule: &QueueSchedule) -> Result<()> {
        let mut states = graph
            .resources()
            .iter()
            .map(|node| node.initial_state())
            .collect::<Vec<_>>();
        let mut seen = vec![false; states.len()];
        for pass in schedule.order() {
            let pass_info = info.get(*pass);
            for barrier in self.before_pass(*pass) {
                let index = barrier.resource.index();
                // The first use of a transient resource may discard whatever the memory held.
                let expected = if seen[index] || graph.resources()[index].is_imported() {
                    states[index]
                } else {
                    ResourceState::Undefined
                };
                if barrier.before != expected {
                    return Err(Error::InvalidState {
                        pass: pass_info.name.clone(),
                        resource: graph.resources()[index].name.clone(),
                        state: barrier.before.to_string(),
                    }
                    .into());
                }
                states[index] = barrier.after;
            }
            for access in &pass_info.accesses {
                let index = access.resource.index();
                seen[index] = true;
                if states[index] != access.state {
                    return Err(Error::InvalidState {
                        pass: pass_info.name.clone(),
                        resource: graph.resources()[index].name.clone(),
                        state: states[index].to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Run barrier generation.
pub fn analyze(
    graph: &FrameGraph,
    info: &PassInfoAnalysis,
    schedule: &QueueSchedule,
    aliasing: &MemoryAliasing,
) -> BarrierPlan {
    let mut tracked = graph
        .resources()
        .iter()
        .map(|node| Tracked {
            state: node.initial_state(),
            queue: None,
            written: false,
        })
        .collect::<Vec<_>>();
    let mut plan = BarrierPlan::default();

    for pass in schedule.order() {
        let queue = schedule.queue_of(*pass);
        for access in &info.get(*pass).accesses {
            let index = access.resource.index();
            let node = &graph.resources()[index];
            let track = &mut tracked[index];
            let kind = match track.queue {
                None if node.is_imported() => (track.state != access.state).then_some(BarrierKind::Transition),
                None if aliasing.is_aliased(access.resource) => Some(BarrierKind::Aliasing),
                None => Some(BarrierKind::Transition),
                Some(_) if track.state != access.state => Some(BarrierKind::Transition),
                Some(_) if track.written || access.kind.is_write() => Some(BarrierKind::Hazard),
                Some(_) => None,
            };
            if let Some(kind) = kind {
                let before = match track.queue {
                    None if !node.is_imported() => ResourceState::Undefined,
                    _ => track.state,
                };
                let barrier = Barrier {
                    resource: access.resource,
                    resource_type: node.resource_type(),
                    before,
                    after: access.state,
                    kind,
                    queue,
                    cross_queue: track.queue.map_or(false, |previous| previous != queue),
                };
                trace!(
                    "{:?} barrier for `{}` before `{}`: {} -> {}",
                    kind,
                    node.name,
                    info.get(*pass).name,
                    before,
                    access.state
                );
                plan.before_pass.insert(*pass, barrier);
            }
            track.state = access.state;
            track.queue = Some(queue);
            track.written = access.kind.is_write();
        }
    }

    for (index, (node, track)) in graph.resources().iter().zip(&tracked).enumerate() {
        let Some(final_state) = node.imported.and_then(|imported| imported.final_state) else {
            continue;
        };
        if final_state == track.state {
            continue;
        }
        let resource = ResourceId {
            index: index as u32,
            frame: graph.frame_index(),
        };
        plan.epilogue.push(Barrier {
            resource,
            resource_type: node.resource_type(),
            before: track.state,
            after: final_state,
            kind: BarrierKind::Final,
            queue: PRIMARY_QUEUE,
            cross_queue: track.queue.map_or(false, |queue| queue != PRIMARY_QUEUE),
        });
    }

    plan.final_states = graph
        .resources()
        .iter()
        .zip(&tracked)
        .map(|(node, track)| {
            node.imported
                .and_then(|imported| imported.final_state)
                .unwrap_or(track.state)
        })
        .collect();

    debug!("Generated {} barriers", plan.len());
    plan
}
