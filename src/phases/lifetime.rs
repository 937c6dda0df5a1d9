//! Lifetime analysis: for every resource, the span of the global pass order in which it is used.

use crate::graph::pass::PassId;
use crate::graph::resource::ResourceId;
use crate::graph::FrameGraph;
use crate::phases::pass_info::PassInfoAnalysis;
use crate::phases::schedule::QueueSchedule;

/// Inclusive interval of positions in the global pass order.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Lifetime {
    pub first: usize,
    pub last: usize,
}

impl Lifetime {
    pub fn new(first: usize, last: usize) -> Self {
        Self {
            first,
            last,
        }
    }

    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    pub fn contains(&self, position: usize) -> bool {
        self.first <= position && position <= self.last
    }
}

/// Lifetime of one resource, together with the passes using it in execution order.
#[derive(Debug, Clone)]
pub struct ResourceLifetime {
    pub resource: ResourceId,
    pub lifetime: Lifetime,
    pub users: Vec<PassId>,
}

/// Output of the lifetime phase, indexed by resource. Resources no pass uses have no lifetime.
#[derive(Debug, Clone, Default)]
pub struct LifetimeAnalysis {
    pub resources: Vec<Option<ResourceLifetime>>,
}

impl LifetimeAnalysis {
    pub fn get(&self, resource: ResourceId) -> Option<&ResourceLifetime> {
        self.resources.get(resource.index()).and_then(Option::as_ref)
    }

    pub fn used(&self) -> impl Iterator<Item = &ResourceLifetime> {
        self.resources.iter().flatten()
    }
}

/// Run the lifetime analysis.
pub fn analyze(graph: &FrameGraph, info: &PassInfoAnalysis, schedule: &QueueSchedule) -> LifetimeAnalysis {
    let mut resources: Vec<Option<ResourceLifetime>> = (0..graph.resources().len()).map(|_| None).collect();
    let mut written = vec![false; graph.resources().len()];

    for (position, pass) in schedule.order().iter().enumerate() {
        for access in &info.get(*pass).accesses {
            let index = access.resource.index();
            let node = &graph.resources()[index];
            if access.kind.is_read() && !written[index] && !node.is_imported() {
                warn!(
                    "Transient resource `{}` is read by pass `{}` before any pass writes it",
                    node.name,
                    info.get(*pass).name
                );
            }
            written[index] |= access.kind.is_write();
            match &mut resources[index] {
                Some(lifetime) => {
                    lifetime.lifetime.last = position;
                    lifetime.users.push(*pass);
                }
                slot => {
                    *slot = Some(ResourceLifetime {
                        resource: access.resource,
                        lifetime: Lifetime::new(position, position),
                        users: vec![*pass],
                    })
                }
            }
        }
    }

    for (node, lifetime) in graph.resources().iter().zip(&resources) {
        match lifetime {
            Some(lifetime) => trace!(
                "Resource `{}` lives from {} to {}",
                node.name,
                lifetime.lifetime.first,
                lifetime.lifetime.last
            ),
            None => debug!("Resource `{}` is never used", node.name),
        }
    }

    LifetimeAnalysis {
        resources,
    }
}
