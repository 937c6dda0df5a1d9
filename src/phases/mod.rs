//! Compile phases that turn a [`FrameGraph`] into an executable frame.
//!
//! Every phase is a function from the graph and the outputs of earlier phases to its own output, run in this order:
//! - [`pass_info`]: normalized accesses per pass.
//! - [`dependency`]: the pass DAG.
//! - [`schedule`]: queue assignment and execution order, optionally reordered so passes sharing resources run
//!   close together. Readers of a state on other queues are then ordered after the pass that transitions into it.
//! - [`lifetime`]: first and last use of each resource.
//! - [`sync`]: semaphore waits between queues.
//! - [`aliasing`]: shared memory for resources with disjoint lifetimes.
//! - [`barrier`]: state transitions before every pass.
//!
//! [`compile`] runs all of them and bundles the results in a [`CompiledFrame`].

use anyhow::Result;

use crate::core::queue::QueueInfo;
use crate::device::{MemoryRequirements, ResourceDesc};
use crate::graph::resource::ResourceId;
use crate::graph::FrameGraph;
use crate::phases::aliasing::{AliasingConfig, MemoryAliasing};
use crate::phases::barrier::BarrierPlan;
use crate::phases::dependency::DependencyGraph;
use crate::phases::lifetime::LifetimeAnalysis;
use crate::phases::pass_info::PassInfoAnalysis;
use crate::phases::schedule::{QueueSchedule, ReorderConfig};
use crate::phases::sync::SyncAnalysis;

pub mod aliasing;
pub mod barrier;
pub mod dependency;
pub mod graphviz;
pub mod lifetime;
pub mod pass_info;
pub mod schedule;
pub mod sync;

/// Knobs of the compile phases.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub aliasing: AliasingConfig,
    /// Run [`schedule::reorder`] after the queue schedule. Off by default, which keeps the declaration order
    /// wherever the DAG allows it.
    pub reorder: Option<ReorderConfig>,
}

/// Outputs of every compile phase for one frame.
#[derive(Debug, Clone)]
pub struct CompiledFrame {
    pub frame_index: u64,
    pub info: PassInfoAnalysis,
    pub dependencies: DependencyGraph,
    pub schedule: QueueSchedule,
    pub lifetimes: LifetimeAnalysis,
    pub sync: SyncAnalysis,
    pub aliasing: MemoryAliasing,
    pub barriers: BarrierPlan,
    resource_names: Vec<String>,
}

impl CompiledFrame {
    pub fn resource_name(&self, resource: ResourceId) -> &str {
        self.resource_names
            .get(resource.index())
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }
}

/// Run every compile phase on a frame graph.
///
/// # Errors
/// Fails if the graph is invalid: conflicting or invalid access declarations, or a dependency cycle.
/// No GPU work is created in that case.
pub fn compile(
    graph: &FrameGraph,
    queues: &[QueueInfo],
    options: &CompileOptions,
    requirements: &dyn Fn(&ResourceDesc) -> MemoryRequirements,
) -> Result<CompiledFrame> {
    let info = pass_info::analyze(graph)?;
    let mut dependencies = dependency::analyze(graph, &info);
    let mut schedule = schedule::run(&info, &dependencies, queues)?;
    if let Some(config) = &options.reorder {
        schedule = schedule::reorder(schedule, &info, &dependencies, config);
    }
    dependencies.order_shared_transitions(graph, &info, &schedule);
    let lifetimes = lifetime::analyze(graph, &info, &schedule);
    let sync = sync::analyze(&dependencies, &schedule);
    let aliasing = aliasing::analyze(graph, &lifetimes, &dependencies, &schedule, &options.aliasing, requirements);
    let barriers = barrier::analyze(graph, &info, &schedule, &aliasing);

    #[cfg(debug_assertions)]
    {
        barriers.verify_transitions(graph, &info, &schedule)?;
        let races = sync.find_unsynchronized(&dependencies, &schedule);
        debug_assert!(races.is_empty(), "unsynchronized cross-queue dependencies: {races:?}");
    }

    Ok(CompiledFrame {
        frame_index: graph.frame_index(),
        info,
        dependencies,
        schedule,
        lifetimes,
        sync,
        aliasing,
        barriers,
        resource_names: graph.resources().iter().map(|node| node.name.clone()).collect(),
    })
}
