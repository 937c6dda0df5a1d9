//! The frame graph is the declarative description of one frame: the logical resources it uses and the passes
//! that read and write them. It is consumed by [`Backend::execute`](crate::Backend::execute), which compiles it
//! into a schedule over the hardware queues, inserts barriers and queue synchronization, realizes the resources
//! from the pools and submits the recorded commands.
//!
//! Graphs are rebuilt every frame. Handles returned by a graph carry its frame index and are rejected by any
//! other graph.
//!
//! For defining passes, see the [`pass`] module documentation.

use anyhow::Result;

use crate::core::error::Error;
use crate::device::{BufferDesc, BufferHandle, NativeResource, ResourceDesc, TextureDesc, TextureHandle};
use crate::graph::command::{Command, CommandList};
use crate::graph::pass::{Pass, PassId};
use crate::graph::resource::{ImportedResource, ResourceId, ResourceNode};
use crate::resource::state::{ResourceState, ResourceTags};

pub mod command;
pub mod pass;
pub mod resource;

/// The passes and resources of one frame.
#[derive(Debug)]
pub struct FrameGraph<'cb> {
    frame_index: u64,
    resources: Vec<ResourceNode>,
    passes: Vec<Pass<'cb>>,
    dependencies: Vec<(PassId, PassId)>,
}

impl<'cb> FrameGraph<'cb> {
    /// Create an empty graph for the given frame index.
    pub fn new(frame_index: u64) -> Self {
        Self {
            frame_index,
            resources: vec![],
            passes: vec![],
            dependencies: vec![],
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    fn add_resource(&mut self, node: ResourceNode) -> ResourceId {
        self.resources.push(node);
        ResourceId {
            index: (self.resources.len() - 1) as u32,
            frame: self.frame_index,
        }
    }

    /// Declare a transient buffer. Its memory comes from the backend pools and is only valid during this frame.
    pub fn create_buffer(&mut self, name: impl Into<String>, desc: BufferDesc) -> ResourceId {
        self.create_buffer_with_tags(name, desc, ResourceTags::DEFAULT)
    }

    pub fn create_buffer_with_tags(&mut self, name: impl Into<String>, desc: BufferDesc, tags: ResourceTags) -> ResourceId {
        self.add_resource(ResourceNode::transient(name, ResourceDesc::Buffer(desc), tags))
    }

    /// Declare a transient texture.
    pub fn create_texture(&mut self, name: impl Into<String>, desc: TextureDesc) -> ResourceId {
        self.create_texture_with_tags(name, desc, ResourceTags::DEFAULT)
    }

    pub fn create_texture_with_tags(&mut self, name: impl Into<String>, desc: TextureDesc, tags: ResourceTags) -> ResourceId {
        self.add_resource(ResourceNode::transient(name, ResourceDesc::Texture(desc), tags))
    }

    /// Use a buffer owned outside of the graph.
    pub fn import_buffer(
        &mut self,
        name: impl Into<String>,
        buffer: BufferHandle,
        desc: BufferDesc,
        initial_state: ResourceState,
        final_state: Option<ResourceState>,
    ) -> ResourceId {
        self.add_resource(ResourceNode {
            name: name.into(),
            desc: ResourceDesc::Buffer(desc),
            tags: ResourceTags::INVALID,
            imported: Some(ImportedResource {
                native: NativeResource::Buffer(buffer),
                initial_state,
                final_state,
            }),
        })
    }

    /// Use a texture owned outside of the graph, for example a swapchain image.
    pub fn import_texture(
        &mut self,
        name: impl Into<String>,
        texture: TextureHandle,
        desc: TextureDesc,
        initial_state: ResourceState,
        final_state: Option<ResourceState>,
    ) -> ResourceId {
        self.add_resource(ResourceNode {
            name: name.into(),
            desc: ResourceDesc::Texture(desc),
            tags: ResourceTags::INVALID,
            imported: Some(ImportedResource {
                native: NativeResource::Texture(texture),
                initial_state,
                final_state,
            }),
        })
    }

    fn check_resource(&self, resource: ResourceId) -> Result<()> {
        if resource.frame != self.frame_index {
            return Err(Error::StaleHandle.into());
        }
        if resource.index() >= self.resources.len() {
            return Err(Error::InvalidResource(resource.to_string()).into());
        }
        Ok(())
    }

    fn check_pass(&self, pass: PassId) -> Result<()> {
        if pass.frame != self.frame_index {
            return Err(Error::StaleHandle.into());
        }
        if pass.index() >= self.passes.len() {
            return Err(Error::InvalidPass(pass.index()).into());
        }
        Ok(())
    }

    /// Add a pass to the graph. Passes are kept in declaration order, which is used to order accesses to the
    /// same resource.
    pub fn add_pass(&mut self, pass: Pass<'cb>) -> Result<PassId> {
        for access in &pass.accesses {
            self.check_resource(access.resource)?;
        }
        for after in &pass.after {
            self.check_pass(*after)?;
        }
        let id = PassId::new(self.passes.len(), self.frame_index);
        self.dependencies.extend(pass.after.iter().map(|after| (*after, id)));
        trace!("Added pass `{}` as {}", pass.name, id);
        self.passes.push(pass);
        Ok(id)
    }

    /// Force `after` to execute after `before`, even if they share no resources.
    pub fn add_dependency(&mut self, before: PassId, after: PassId) -> Result<()> {
        self.check_pass(before)?;
        self.check_pass(after)?;
        self.dependencies.push((before, after));
        Ok(())
    }

    pub fn resource(&self, resource: ResourceId) -> Result<&ResourceNode> {
        self.check_resource(resource)?;
        Ok(&self.resources[resource.index()])
    }

    pub fn pass(&self, pass: PassId) -> Result<&Pass<'cb>> {
        self.check_pass(pass)?;
        Ok(&self.passes[pass.index()])
    }

    pub fn resources(&self) -> &[ResourceNode] {
        &self.resources
    }

    pub fn passes(&self) -> &[Pass<'cb>] {
        &self.passes
    }

    /// Explicit ordering constraints, as `(before, after)` pairs.
    pub fn dependencies(&self) -> &[(PassId, PassId)] {
        &self.dependencies
    }

    pub fn pass_ids(&self) -> impl Iterator<Item = PassId> + '_ {
        (0..self.passes.len()).map(|index| PassId::new(index, self.frame_index))
    }

    pub fn resource_ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        (0..self.resources.len()).map(|index| ResourceId {
            index: index as u32,
            frame: self.frame_index,
        })
    }

    /// Run every pass recorder and collect the recorded commands, indexed by pass.
    /// Recorders are consumed, so this can only be done once.
    pub fn record(&mut self) -> Result<Vec<Vec<Command>>> {
        self.passes
            .iter_mut()
            .map(|pass| {
                let mut list = CommandList::new(pass.name.clone(), pass.accesses.iter().map(|access| access.resource));
                if let Some(recorder) = pass.recorder.take() {
                    recorder(&mut list)?;
                }
                Ok(list.into_commands())
            })
            .collect()
    }
}
