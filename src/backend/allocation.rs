//! Realizes the logical resources of a compiled frame as native objects.
//!
//! Imported resources are used as is. Resources in a shared alias group are created as placed resources on a
//! memory block from the memory pool, and are owned by the frame executor until its next reset. Every other
//! transient resource comes from the buffer or texture pool and goes back into it once the frame is submitted.

use anyhow::Result;

use crate::backend::executor::FrameExecutor;
use crate::core::error::Error;
use crate::device::{
    BufferDesc, BufferHandle, Device, MemoryDesc, MemoryHandle, NativeResource, Placement, ResourceDesc, TextureDesc,
    TextureHandle,
};
use crate::graph::resource::ResourceId;
use crate::graph::FrameGraph;
use crate::phases::CompiledFrame;
use crate::resource::state::{AllocationMark, ResourceTags};
use crate::resource::ResourcePools;

#[derive(Debug, Copy, Clone)]
enum Pooled {
    Buffer(BufferDesc, BufferHandle),
    Texture(TextureDesc, TextureHandle),
    Memory(MemoryDesc, MemoryHandle),
}

/// Native objects backing the resources of one frame.
#[derive(Debug, Default)]
pub struct FrameResources {
    natives: Vec<Option<NativeResource>>,
    descs: Vec<ResourceDesc>,
    pooled: Vec<(Option<ResourceId>, Pooled, ResourceTags)>,
}

impl FrameResources {
    /// The native object of a resource.
    pub fn native(&self, resource: ResourceId) -> Result<NativeResource> {
        self.natives
            .get(resource.index())
            .copied()
            .flatten()
            .ok_or_else(|| Error::InvalidResource(resource.to_string()).into())
    }

    pub fn desc(&self, resource: ResourceId) -> Result<&ResourceDesc> {
        self.descs
            .get(resource.index())
            .ok_or_else(|| Error::InvalidResource(resource.to_string()).into())
    }

    pub fn buffer(&self, resource: ResourceId) -> Result<BufferHandle> {
        match self.native(resource)? {
            NativeResource::Buffer(buffer) => Ok(buffer),
            NativeResource::Texture(_) => Err(Error::InvalidResource(format!("{resource} is not a buffer")).into()),
        }
    }

    pub fn texture(&self, resource: ResourceId) -> Result<TextureHandle> {
        match self.native(resource)? {
            NativeResource::Texture(texture) => Ok(texture),
            NativeResource::Buffer(_) => Err(Error::InvalidResource(format!("{resource} is not a texture")).into()),
        }
    }

    /// Give every pooled object back to its pool, marked with the frame that used it last. Placed resources
    /// stay with the executor.
    pub fn release(self, compiled: &CompiledFrame, pools: &ResourcePools) -> Result<()> {
        for (resource, pooled, tags) in self.pooled {
            let mark = AllocationMark::new(compiled.frame_index, tags);
            let state = resource
                .map(|resource| compiled.barriers.final_state(resource))
                .unwrap_or_default();
            match pooled {
                Pooled::Buffer(desc, buffer) => pools.buffers.deallocate(&desc, buffer, state, mark)?,
                Pooled::Texture(desc, texture) => pools.textures.deallocate(&desc, texture, state, mark)?,
                Pooled::Memory(desc, memory) => pools.memory.deallocate(&desc, memory, state, mark)?,
            }
        }
        Ok(())
    }
}

/// Create or fetch the native objects for every resource used in the frame.
///
/// Pooled objects are only reused if they were last used in `latest_finished` or earlier. On failure, every
/// object fetched so far goes back to its pool.
pub fn allocate(
    graph: &FrameGraph,
    compiled: &CompiledFrame,
    device: &dyn Device,
    pools: &ResourcePools,
    executor: &mut FrameExecutor,
    latest_finished: Option<u64>,
) -> Result<FrameResources> {
    let mut resources = FrameResources {
        natives: vec![None; graph.resources().len()],
        descs: graph.resources().iter().map(|node| node.desc).collect(),
        pooled: vec![],
    };
    if let Err(err) = realize(graph, compiled, device, pools, executor, latest_finished, &mut resources) {
        resources.release(compiled, pools)?;
        return Err(err);
    }
    Ok(resources)
}

fn realize(
    graph: &FrameGraph,
    compiled: &CompiledFrame,
    device: &dyn Device,
    pools: &ResourcePools,
    executor: &mut FrameExecutor,
    latest_finished: Option<u64>,
    resources: &mut FrameResources,
) -> Result<()> {
    let frame_index = compiled.frame_index;
    let mut blocks: Vec<Option<MemoryHandle>> = vec![None; compiled.aliasing.groups.len()];
    for lifetime in compiled.lifetimes.used() {
        let resource = lifetime.resource;
        let node = &graph.resources()[resource.index()];
        let mark = AllocationMark::new(frame_index, node.tags);

        if let Some(imported) = &node.imported {
            resources.natives[resource.index()] = Some(imported.native);
            continue;
        }

        if let Some((index, group)) = compiled.aliasing.group_of(resource).filter(|(_, group)| group.is_shared()) {
            let memory = match blocks[index] {
                Some(memory) => memory,
                None => {
                    let desc = MemoryDesc {
                        size: group.size,
                        alignment: group.alignment,
                        kind: group.kind,
                    };
                    let (memory, _) = pools.memory.allocate(&desc, mark, latest_finished)?;
                    resources.pooled.push((None, Pooled::Memory(desc, memory), ResourceTags::DEFAULT));
                    blocks[index] = Some(memory);
                    memory
                }
            };
            let placement = Placement {
                memory,
                offset: 0,
            };
            let native = match &node.desc {
                ResourceDesc::Buffer(desc) => NativeResource::Buffer(device.create_buffer(desc, Some(placement))?),
                ResourceDesc::Texture(desc) => NativeResource::Texture(device.create_texture(desc, Some(placement))?),
            };
            trace!("Placed `{}` in alias group {index}", node.name);
            executor.own_placed(native);
            resources.natives[resource.index()] = Some(native);
            continue;
        }

        let native = match &node.desc {
            ResourceDesc::Buffer(desc) => {
                let (buffer, state) = pools.buffers.allocate(desc, mark, latest_finished)?;
                trace!("`{}` uses pooled buffer {:?}, last left in {}", node.name, buffer, state);
                resources.pooled.push((Some(resource), Pooled::Buffer(*desc, buffer), node.tags));
                NativeResource::Buffer(buffer)
            }
            ResourceDesc::Texture(desc) => {
                let (texture, state) = pools.textures.allocate(desc, mark, latest_finished)?;
                trace!("`{}` uses pooled texture {:?}, last left in {}", node.name, texture, state);
                resources.pooled.push((Some(resource), Pooled::Texture(*desc, texture), node.tags));
                NativeResource::Texture(texture)
            }
        };
        resources.natives[resource.index()] = Some(native);
    }
    Ok(())
}
