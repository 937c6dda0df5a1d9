//! Resource states, tags and allocation marks.

use std::fmt::{Display, Formatter};
use std::ops::{BitAnd, BitOr, BitOrAssign};

use ash::vk;

use crate::core::queue::QueueType;

/// The state a resource must be in for an access. Every state maps onto access flags, pipeline stages and,
/// for textures, an image layout.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub enum ResourceState {
    /// Contents are undefined. Only valid as the source of a transition.
    #[default]
    Undefined,
    /// General state, usable for anything but slow.
    Common,
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    IndirectArgument,
    /// Sampled or read from a shader.
    ShaderResource,
    /// Read and written from a shader.
    UnorderedAccess,
    RenderTarget,
    DepthWrite,
    DepthRead,
    CopySource,
    CopyDest,
    /// Read back by the host.
    HostRead,
    Present,
}

impl ResourceState {
    /// Whether accesses in this state may write to the resource.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ResourceState::Common
                | ResourceState::UnorderedAccess
                | ResourceState::RenderTarget
                | ResourceState::DepthWrite
                | ResourceState::CopyDest
        )
    }

    /// Whether this state can only be used to write.
    pub fn is_write_only(&self) -> bool {
        matches!(self, ResourceState::RenderTarget | ResourceState::CopyDest)
    }

    /// Whether a queue of the given type can access a resource in this state.
    pub fn supported_on(&self, queue_type: QueueType) -> bool {
        match queue_type {
            QueueType::Graphics => true,
            QueueType::Compute => !matches!(
                self,
                ResourceState::VertexBuffer
                    | ResourceState::IndexBuffer
                    | ResourceState::RenderTarget
                    | ResourceState::DepthWrite
                    | ResourceState::DepthRead
                    | ResourceState::Present
            ),
            QueueType::Copy => matches!(
                self,
                ResourceState::Undefined | ResourceState::Common | ResourceState::CopySource | ResourceState::CopyDest
            ),
        }
    }

    /// Get the access flags for this state.
    pub fn access(&self) -> vk::AccessFlags2 {
        match self {
            ResourceState::Undefined => vk::AccessFlags2::NONE,
            ResourceState::Common => vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            ResourceState::VertexBuffer => vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
            ResourceState::IndexBuffer => vk::AccessFlags2::INDEX_READ,
            ResourceState::ConstantBuffer => vk::AccessFlags2::UNIFORM_READ,
            ResourceState::IndirectArgument => vk::AccessFlags2::INDIRECT_COMMAND_READ,
            ResourceState::ShaderResource => vk::AccessFlags2::SHADER_READ,
            ResourceState::UnorderedAccess => vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
            ResourceState::RenderTarget => {
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            }
            ResourceState::DepthWrite => {
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            ResourceState::DepthRead => vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            ResourceState::CopySource => vk::AccessFlags2::TRANSFER_READ,
            ResourceState::CopyDest => vk::AccessFlags2::TRANSFER_WRITE,
            ResourceState::HostRead => vk::AccessFlags2::HOST_READ,
            ResourceState::Present => vk::AccessFlags2::NONE,
        }
    }

    /// Get the pipeline stages that access a resource in this state on a queue of the given type.
    pub fn stages(&self, queue_type: QueueType) -> vk::PipelineStageFlags2 {
        let shader_stages = match queue_type {
            QueueType::Graphics => {
                vk::PipelineStageFlags2::VERTEX_SHADER
                    | vk::PipelineStageFlags2::FRAGMENT_SHADER
                    | vk::PipelineStageFlags2::COMPUTE_SHADER
            }
            QueueType::Compute => vk::PipelineStageFlags2::COMPUTE_SHADER,
            QueueType::Copy => vk::PipelineStageFlags2::NONE,
        };
        match self {
            ResourceState::Undefined => vk::PipelineStageFlags2::TOP_OF_PIPE,
            ResourceState::Common => vk::PipelineStageFlags2::ALL_COMMANDS,
            ResourceState::VertexBuffer => vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            ResourceState::IndexBuffer => vk::PipelineStageFlags2::INDEX_INPUT,
            ResourceState::ConstantBuffer | ResourceState::ShaderResource | ResourceState::UnorderedAccess => {
                shader_stages
            }
            ResourceState::IndirectArgument => vk::PipelineStageFlags2::DRAW_INDIRECT,
            ResourceState::RenderTarget => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ResourceState::DepthWrite | ResourceState::DepthRead => {
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
            }
            ResourceState::CopySource | ResourceState::CopyDest => vk::PipelineStageFlags2::COPY,
            ResourceState::HostRead => vk::PipelineStageFlags2::HOST,
            ResourceState::Present => vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        }
    }

    /// Get the image layout a texture must be in for this state.
    pub fn layout(&self) -> vk::ImageLayout {
        match self {
            ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
            ResourceState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ResourceState::DepthWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ResourceState::DepthRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            _ => vk::ImageLayout::GENERAL,
        }
    }
}

impl Display for ResourceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Tag bits attached to pooled objects, used for selective garbage collection.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct ResourceTags(u32);

impl ResourceTags {
    pub const INVALID: Self = Self(0x00);
    pub const DEFAULT: Self = Self(0x01);
    /// Resources that are written by the host every frame.
    pub const DYNAMIC: Self = Self(0x02);

    pub const fn from_raw(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn as_raw(&self) -> u32 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether at least one tag bit is shared with `other`.
    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether these tags pass a garbage collection filter: at least one tag of `with` is set,
    /// and none of `without`.
    pub const fn matches(&self, with: Self, without: Self) -> bool {
        self.intersects(with) && !self.intersects(without)
    }
}

impl BitOr for ResourceTags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ResourceTags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl BitAnd for ResourceTags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

/// Stamps when and why a pooled object was last used.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct AllocationMark {
    pub frame_index: u64,
    pub tags: ResourceTags,
}

impl AllocationMark {
    pub fn new(frame_index: u64, tags: ResourceTags) -> Self {
        Self {
            frame_index,
            tags,
        }
    }
}
