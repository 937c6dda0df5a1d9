//! Pass info analysis: normalizes the declared accesses of every pass.
//!
//! After this phase each pass touches each resource at most once, with a single required state and a merged
//! access kind. A pass declaring the same resource in two different states is rejected, as there is no single
//! state the resource could be transitioned to before the pass.

use std::collections::HashMap;

use anyhow::Result;
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::core::error::Error;
use crate::core::queue::QueueAffinity;
use crate::graph::pass::{Access, PassId};
use crate::graph::resource::ResourceId;
use crate::graph::FrameGraph;
use crate::resource::state::ResourceState;

/// Normalized information about one pass.
#[derive(Debug, Clone)]
pub struct PassInfo {
    pub id: PassId,
    pub name: String,
    /// Accesses sorted by resource, one per resource.
    pub accesses: Vec<Access>,
    pub affinity: QueueAffinity,
    pub color: Option<[f32; 4]>,
}

/// Output of the pass info phase, indexed by pass.
#[derive(Debug, Clone, Default)]
pub struct PassInfoAnalysis {
    pub passes: Vec<PassInfo>,
}

impl PassInfo {
    pub fn access(&self, resource: ResourceId) -> Option<&Access> {
        self.accesses
            .binary_search_by_key(&resource, |access| access.resource)
            .ok()
            .map(|index| &self.accesses[index])
    }

    pub fn reads(&self) -> impl Iterator<Item = &Access> {
        self.accesses.iter().filter(|access| access.kind.is_read())
    }

    pub fn writes(&self) -> impl Iterator<Item = &Access> {
        self.accesses.iter().filter(|access| access.kind.is_write())
    }
}

impl PassInfoAnalysis {
    pub fn get(&self, pass: PassId) -> &PassInfo {
        &self.passes[pass.index()]
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

fn normalize(resources: &[&str], name: &str, declared: &[Access]) -> Result<Vec<Access>> {
    let mut merged: HashMap<_, Access> = HashMap::with_capacity(declared.len());
    for access in declared {
        let resource = resources
            .get(access.resource.index())
            .ok_or_else(|| Error::InvalidResource(access.resource.to_string()))?
            .to_string();
        let invalid = access.state == ResourceState::Undefined
            || (access.kind.is_write() && !access.state.is_writable())
            || (access.kind.is_read() && access.state.is_write_only());
        if invalid {
            return Err(Error::InvalidState {
                pass: name.to_string(),
                resource: resource.clone(),
                state: access.state.to_string(),
            }
            .into());
        }
        match merged.get_mut(&access.resource) {
            Some(existing) if existing.state != access.state => {
                return Err(Error::ConflictingAccess {
                    pass: name.to_string(),
                    resource: resource.clone(),
                }
                .into());
            }
            Some(existing) => existing.kind = existing.kind.merge(access.kind),
            None => {
                merged.insert(access.resource, *access);
            }
        }
    }
    let mut accesses = merged.into_values().collect::<Vec<_>>();
    accesses.sort_by_key(|access| access.resource);
    Ok(accesses)
}

/// Run the pass info analysis.
pub fn analyze(graph: &FrameGraph) -> Result<PassInfoAnalysis> {
    let resources = graph.resources().iter().map(|resource| resource.name.as_str()).collect::<Vec<_>>();
    let inputs = graph
        .pass_ids()
        .zip(graph.passes())
        .map(|(id, pass)| (id, pass.name(), pass.accesses(), pass.affinity(), pass.color()))
        .collect::<Vec<_>>();

    #[cfg(feature = "rayon")]
    let iter = inputs.par_iter();
    #[cfg(not(feature = "rayon"))]
    let iter = inputs.iter();

    let passes = iter
        .map(|(id, name, declared, affinity, color)| {
            Ok(PassInfo {
                id: *id,
                name: name.to_string(),
                accesses: normalize(&resources, name, declared)?,
                affinity: *affinity,
                color: *color,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    for pass in &passes {
        trace!(
            "Pass `{}`: {} reads, {} writes",
            pass.name,
            pass.reads().count(),
            pass.writes().count()
        );
    }
    Ok(PassInfoAnalysis {
        passes,
    })
}
