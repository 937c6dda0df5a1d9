//! Memory aliasing: transient resources whose lifetimes never overlap share one backing memory block.
//!
//! Candidates are sorted by the start of their lifetime, larger resources first, and each is placed into the
//! lowest-indexed existing group whose memory is large enough and whose last member is dead by the time the
//! candidate is first used. If no group fits, a new group is opened.
//!
//! Lifetimes are positions in the global pass order, which only orders passes on one queue. Passes on different
//! queues may run concurrently, so a resource may only follow another one if every pass using the earlier resource
//! happens before every pass using the later one, either through submission order or through a chain of
//! dependencies.

use std::collections::HashMap;

use crate::device::{MemoryKind, MemoryRequirements, MemoryUsage, ResourceDesc};
use crate::graph::pass::PassId;
use crate::graph::resource::ResourceId;
use crate::graph::FrameGraph;
use crate::phases::dependency::DependencyGraph;
use crate::phases::lifetime::{Lifetime, LifetimeAnalysis};
use crate::phases::schedule::QueueSchedule;

/// Settings of the aliasing phase.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AliasingConfig {
    pub enabled: bool,
    /// Resources smaller than this are never aliased.
    pub min_size: u64,
}

/// A resource that may be placed into shared memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AliasCandidate {
    pub resource: ResourceId,
    pub kind: MemoryKind,
    pub requirements: MemoryRequirements,
    pub lifetime: Lifetime,
}

/// A resource placed into an alias group.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AliasMember {
    pub resource: ResourceId,
    pub lifetime: Lifetime,
}

/// Resources sharing one memory block. Every resource is bound at offset zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasGroup {
    pub kind: MemoryKind,
    pub size: u64,
    pub alignment: u64,
    /// Members ordered by lifetime.
    pub members: Vec<AliasMember>,
}

/// Memory usage before and after aliasing.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AliasingStats {
    pub candidates: usize,
    pub groups: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Output of the aliasing phase.
#[derive(Debug, Clone, Default)]
pub struct MemoryAliasing {
    pub groups: Vec<AliasGroup>,
    assignment: HashMap<ResourceId, usize>,
    pub stats: AliasingStats,
}

impl Default for AliasingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 1024,
        }
    }
}

impl AliasGroup {
    pub fn new(kind: MemoryKind, requirements: MemoryRequirements) -> Self {
        Self {
            kind,
            size: requirements.size,
            alignment: requirements.alignment,
            members: vec![],
        }
    }

    /// Whether a resource with these requirements fits into this group's memory.
    pub fn fits(&self, kind: MemoryKind, requirements: &MemoryRequirements) -> bool {
        self.kind == kind && self.size >= requirements.size && self.alignment >= requirements.alignment
    }

    pub fn last(&self) -> Option<&AliasMember> {
        self.members.last()
    }

    /// Add a member to this group.
    ///
    /// # Panics
    /// If the member's lifetime overlaps the lifetime of any existing member. Sharing memory between live
    /// resources would silently corrupt both.
    pub fn insert(&mut self, member: AliasMember) {
        assert!(
            self.members.iter().all(|existing| !existing.lifetime.overlaps(&member.lifetime)),
            "lifetime {:?} of {} overlaps a resource already in its alias group",
            member.lifetime,
            member.resource
        );
        self.members.push(member);
    }

    /// Whether more than one resource uses this memory.
    pub fn is_shared(&self) -> bool {
        self.members.len() > 1
    }
}

impl MemoryAliasing {
    /// The group a resource was placed into.
    pub fn group_of(&self, resource: ResourceId) -> Option<(usize, &AliasGroup)> {
        self.assignment
            .get(&resource)
            .map(|index| (*index, &self.groups[*index]))
    }

    /// Whether the resource shares its memory with another resource.
    pub fn is_aliased(&self, resource: ResourceId) -> bool {
        self.group_of(resource).map_or(false, |(_, group)| group.is_shared())
    }

    /// Whether two resources were assigned the same memory.
    pub fn shares_memory(&self, a: ResourceId, b: ResourceId) -> bool {
        match (self.assignment.get(&a), self.assignment.get(&b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// The member that used the memory of `resource` right before it, if any.
    pub fn previous_member(&self, resource: ResourceId) -> Option<ResourceId> {
        let (_, group) = self.group_of(resource)?;
        let index = group.members.iter().position(|member| member.resource == resource)?;
        (index > 0).then(|| group.members[index - 1].resource)
    }
}

/// Transitive happens-before relation between passes, through dependencies and per-queue submission order.
struct HappensBefore {
    reach: Vec<Vec<bool>>,
}

impl HappensBefore {
    fn new(deps: &DependencyGraph, schedule: &QueueSchedule) -> Self {
        let count = schedule.order().len();
        let mut reach = vec![vec![false; count]; count];
        for pass in schedule.order() {
            let mut before = deps.predecessors(*pass).collect::<Vec<_>>();
            before.extend(schedule.previous_on_queue(*pass));
            let mut row = vec![false; count];
            for earlier in before {
                row[earlier.index()] = true;
                for (index, reachable) in reach[earlier.index()].iter().enumerate() {
                    row[index] |= *reachable;
                }
            }
            reach[pass.index()] = row;
        }
        Self {
            reach,
        }
    }

    fn precedes(&self, a: PassId, b: PassId) -> bool {
        self.reach[b.index()][a.index()]
    }
}

/// Every user of `earlier` happens before every user of `later`.
fn can_follow(order: &HappensBefore, lifetimes: &LifetimeAnalysis, earlier: ResourceId, later: ResourceId) -> bool {
    let (Some(earlier), Some(later)) = (lifetimes.get(earlier), lifetimes.get(later)) else {
        return false;
    };
    earlier
        .users
        .iter()
        .all(|a| later.users.iter().all(|b| a != b && order.precedes(*a, *b)))
}

/// Collect the resources that may be aliased.
pub fn candidates(
    graph: &FrameGraph,
    lifetimes: &LifetimeAnalysis,
    config: &AliasingConfig,
    requirements: &dyn Fn(&ResourceDesc) -> MemoryRequirements,
) -> Vec<AliasCandidate> {
    lifetimes
        .used()
        .filter_map(|lifetime| {
            let node = &graph.resources()[lifetime.resource.index()];
            if node.is_imported() {
                return None;
            }
            if node.buffer_desc().map_or(false, |desc| desc.memory != MemoryUsage::GpuOnly) {
                return None;
            }
            let requirements = requirements(&node.desc);
            if requirements.size < config.min_size {
                return None;
            }
            Some(AliasCandidate {
                resource: lifetime.resource,
                kind: node.memory_kind(),
                requirements,
                lifetime: lifetime.lifetime,
            })
        })
        .collect()
}

/// Assign candidates to alias groups.
pub fn assign(
    mut candidates: Vec<AliasCandidate>,
    lifetimes: &LifetimeAnalysis,
    deps: &DependencyGraph,
    schedule: &QueueSchedule,
) -> MemoryAliasing {
    candidates.sort_by(|a, b| {
        a.lifetime
            .first
            .cmp(&b.lifetime.first)
            .then(b.requirements.size.cmp(&a.requirements.size))
            .then(a.resource.cmp(&b.resource))
    });

    let order = HappensBefore::new(deps, schedule);
    let mut result = MemoryAliasing {
        stats: AliasingStats {
            candidates: candidates.len(),
            ..Default::default()
        },
        ..Default::default()
    };

    for candidate in candidates {
        result.stats.bytes_before += candidate.requirements.size;
        let existing = result.groups.iter().position(|group| {
            group.fits(candidate.kind, &candidate.requirements)
                && group.last().map_or(false, |last| {
                    last.lifetime.last < candidate.lifetime.first
                        && can_follow(&order, lifetimes, last.resource, candidate.resource)
                })
        });
        let index = match existing {
            Some(index) => index,
            None => {
                result.groups.push(AliasGroup::new(candidate.kind, candidate.requirements));
                result.groups.len() - 1
            }
        };
        result.groups[index].insert(AliasMember {
            resource: candidate.resource,
            lifetime: candidate.lifetime,
        });
        result.assignment.insert(candidate.resource, index);
    }

    result.stats.groups = result.groups.len();
    result.stats.bytes_after = result.groups.iter().map(|group| group.size).sum();
    debug!(
        "Aliased {} resources into {} memory blocks ({} -> {} bytes)",
        result.stats.candidates, result.stats.groups, result.stats.bytes_before, result.stats.bytes_after
    );
    result
}

/// Run the aliasing phase. With aliasing disabled, every resource gets its own memory.
pub fn analyze(
    graph: &FrameGraph,
    lifetimes: &LifetimeAnalysis,
    deps: &DependencyGraph,
    schedule: &QueueSchedule,
    config: &AliasingConfig,
    requirements: &dyn Fn(&ResourceDesc) -> MemoryRequirements,
) -> MemoryAliasing {
    if !config.enabled {
        return MemoryAliasing::default();
    }
    let candidates = candidates(graph, lifetimes, config, requirements);
    assign(candidates, lifetimes, deps, schedule)
}
