use std::fmt::{Display, Formatter};

use crate::device::{BufferDesc, MemoryKind, NativeResource, ResourceDesc, TextureDesc};
use crate::resource::state::{ResourceState, ResourceTags};

/// Handle to a logical resource in a [`FrameGraph`](crate::graph::FrameGraph). Handles are only valid in the
/// graph of the frame that created them.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceId {
    pub(crate) index: u32,
    pub(crate) frame: u64,
}

/// Type of a resource in the frame graph.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub enum ResourceType {
    #[default]
    Texture,
    Buffer,
}

/// A resource owned outside of the graph, with the state it is in when the frame starts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImportedResource {
    pub native: NativeResource,
    pub initial_state: ResourceState,
    /// State to leave the resource in at the end of the frame. `None` leaves it in its last used state.
    pub final_state: Option<ResourceState>,
}

/// A logical resource declared in the frame graph.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub name: String,
    pub desc: ResourceDesc,
    pub tags: ResourceTags,
    pub imported: Option<ImportedResource>,
}

impl ResourceId {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Frame index of the graph this handle belongs to.
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "resource#{}", self.index)
    }
}

impl ResourceNode {
    pub fn transient(name: impl Into<String>, desc: ResourceDesc, tags: ResourceTags) -> Self {
        Self {
            name: name.into(),
            desc,
            tags,
            imported: None,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self.desc {
            ResourceDesc::Buffer(_) => ResourceType::Buffer,
            ResourceDesc::Texture(_) => ResourceType::Texture,
        }
    }

    pub fn is_imported(&self) -> bool {
        self.imported.is_some()
    }

    /// The kind of memory block that can back this resource.
    pub fn memory_kind(&self) -> MemoryKind {
        match self.desc {
            ResourceDesc::Buffer(_) => MemoryKind::Buffers,
            ResourceDesc::Texture(_) => MemoryKind::Textures,
        }
    }

    pub fn buffer_desc(&self) -> Option<&BufferDesc> {
        match &self.desc {
            ResourceDesc::Buffer(desc) => Some(desc),
            ResourceDesc::Texture(_) => None,
        }
    }

    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        match &self.desc {
            ResourceDesc::Texture(desc) => Some(desc),
            ResourceDesc::Buffer(_) => None,
        }
    }

    /// The state of the resource at the start of the frame.
    pub fn initial_state(&self) -> ResourceState {
        self.imported
            .map(|imported| imported.initial_state)
            .unwrap_or(ResourceState::Undefined)
    }
}
