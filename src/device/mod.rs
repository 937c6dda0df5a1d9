//! Interface to the native graphics device.
//!
//! The backend never talks to a graphics API directly. Every native object is created, recorded into and submitted
//! through the [`Device`] trait, and referred to by an opaque integer handle. This keeps the compile phases
//! and the executors testable without a GPU: [`HeadlessDevice`] implements the trait in software, simulating
//! fences and timeline semaphores and recording every command it receives.

use std::fmt::Debug;
use std::time::Duration;

use anyhow::Result;
use ash::vk;

use crate::core::queue::{QueueId, QueueInfo};

pub mod headless;

pub use headless::HeadlessDevice;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub fn as_raw(&self) -> u64 {
                self.0
            }
        }
    };
}

native_handle!(
    /// Native buffer object.
    BufferHandle
);
native_handle!(
    /// Native texture object.
    TextureHandle
);
native_handle!(TextureViewHandle);
native_handle!(BufferViewHandle);
native_handle!(
    /// Backing device memory that placed resources can be bound to.
    MemoryHandle
);
native_handle!(
    /// Native descriptor set / bind group.
    BindTableHandle
);
native_handle!(CommandPoolHandle);
native_handle!(CommandBufferHandle);
native_handle!(FenceHandle);
native_handle!(
    /// Timeline semaphore.
    SemaphoreHandle
);

/// Identifies a pipeline object owned by the caller.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct PipelineId(pub u64);

/// Identifies the layout of a bind table. Bind tables are pooled per layout.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BindLayoutId(pub u64);

/// Where the memory of a resource lives.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub enum MemoryUsage {
    #[default]
    GpuOnly,
    /// Host visible, written by the host.
    CpuToGpu,
    /// Host visible, read by the host.
    GpuToCpu,
}

/// Creation descriptor of a buffer.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
}

/// Creation descriptor of a texture.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
}

/// Creation descriptor of a texture view.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TextureViewDesc {
    pub texture: TextureHandle,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

/// Creation descriptor of a typed buffer view.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct BufferViewDesc {
    pub buffer: BufferHandle,
    pub format: vk::Format,
    pub offset: u64,
    pub size: u64,
}

/// Either kind of resource descriptor.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum ResourceDesc {
    Buffer(BufferDesc),
    Texture(TextureDesc),
}

/// Size and alignment of the memory a resource needs.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
}

/// Which kind of resources a memory block may back.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum MemoryKind {
    Buffers,
    Textures,
}

/// Creation descriptor of a device memory block.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct MemoryDesc {
    pub size: u64,
    pub alignment: u64,
    pub kind: MemoryKind,
}

/// Binds a resource at an offset of an existing memory block instead of giving it dedicated memory.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Placement {
    pub memory: MemoryHandle,
    pub offset: u64,
}

/// A native resource of either kind.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum NativeResource {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

/// A pipeline barrier on a single native resource. Translates directly to a `VkBufferMemoryBarrier2` or a
/// `VkImageMemoryBarrier2`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NativeBarrier {
    pub resource: NativeResource,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    /// Previous contents may be discarded.
    pub discard: bool,
}

/// A resource written into a bind table slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BoundResource {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    BufferView(BufferViewHandle),
    TextureView(TextureViewHandle),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BindingWrite {
    pub slot: u32,
    pub resource: BoundResource,
}

/// A command recorded into a native command buffer, with every resource resolved to its native handle.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCommand {
    BeginRendering {
        colors: Vec<TextureViewHandle>,
        depth: Option<TextureViewHandle>,
        clear: Option<[f32; 4]>,
        extent: vk::Extent2D,
    },
    EndRendering,
    BindPipeline(PipelineId),
    BindTable {
        set: u32,
        table: BindTableHandle,
    },
    Draw {
        vertices: u32,
        instances: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_buffer: BufferHandle,
        indices: u32,
        instances: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: BufferHandle,
        dst: TextureHandle,
        offset: u64,
        mip: u32,
    },
    CopyTexture {
        src: TextureHandle,
        dst: TextureHandle,
    },
    FillBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        value: u32,
    },
    BeginLabel {
        name: String,
        color: [f32; 4],
    },
    EndLabel,
}

/// A timeline semaphore wait or signal operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    pub semaphore: SemaphoreHandle,
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

/// One queue submission.
#[derive(Debug, Default, Clone)]
pub struct SubmitInfo {
    pub command_buffers: Vec<CommandBufferHandle>,
    pub waits: Vec<SemaphoreSubmit>,
    pub signals: Vec<SemaphoreSubmit>,
    pub fence: Option<FenceHandle>,
}

/// The native graphics device. Implementations wrap a real graphics API, see [`HeadlessDevice`] for a
/// software implementation.
///
/// Freeing an object that is still referenced by pending GPU work is undefined behaviour on a real device.
/// The backend guarantees it never does so.
pub trait Device: Send + Sync + Debug {
    fn create_buffer(&self, desc: &BufferDesc, placement: Option<Placement>) -> Result<BufferHandle>;
    fn free_buffer(&self, buffer: BufferHandle);
    fn create_texture(&self, desc: &TextureDesc, placement: Option<Placement>) -> Result<TextureHandle>;
    fn free_texture(&self, texture: TextureHandle);
    fn create_texture_view(&self, desc: &TextureViewDesc) -> Result<TextureViewHandle>;
    fn free_texture_view(&self, view: TextureViewHandle);
    fn create_buffer_view(&self, desc: &BufferViewDesc) -> Result<BufferViewHandle>;
    fn free_buffer_view(&self, view: BufferViewHandle);

    /// Query how much memory a resource created with this descriptor needs.
    fn memory_requirements(&self, desc: &ResourceDesc) -> MemoryRequirements;
    fn allocate_memory(&self, desc: &MemoryDesc) -> Result<MemoryHandle>;
    fn free_memory(&self, memory: MemoryHandle);

    fn create_bind_table(&self, layout: BindLayoutId) -> Result<BindTableHandle>;
    fn update_bind_table(&self, table: BindTableHandle, writes: &[BindingWrite]) -> Result<()>;
    fn free_bind_table(&self, table: BindTableHandle);

    fn create_command_pool(&self, queue: &QueueInfo) -> Result<CommandPoolHandle>;
    /// Resets every command buffer allocated from this pool.
    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<()>;
    fn free_command_pool(&self, pool: CommandPoolHandle);
    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> Result<CommandBufferHandle>;
    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()>;
    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()>;
    /// Record one batched barrier command.
    fn cmd_pipeline_barrier(&self, cmd: CommandBufferHandle, barriers: &[NativeBarrier]);
    fn cmd_execute(&self, cmd: CommandBufferHandle, command: &NativeCommand);

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle>;
    /// Wait until the fence is signaled. Returns `false` if the timeout expired first.
    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<bool>;
    /// Whether the fence is currently signaled, without blocking.
    fn fence_status(&self, fence: FenceHandle) -> Result<bool>;
    fn reset_fence(&self, fence: FenceHandle) -> Result<()>;
    fn free_fence(&self, fence: FenceHandle);

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<SemaphoreHandle>;
    /// Current value of a timeline semaphore.
    fn semaphore_counter_value(&self, semaphore: SemaphoreHandle) -> Result<u64>;
    fn free_semaphore(&self, semaphore: SemaphoreHandle);

    fn submit(&self, queue: QueueId, info: &SubmitInfo) -> Result<()>;

    /// Read back `out.len()` words from a host visible buffer.
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, out: &mut [u32]) -> Result<()>;
    fn is_lost(&self) -> bool;
    fn wait_idle(&self) -> Result<()>;
}

impl TextureDesc {
    /// A single-mip 2D texture.
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    /// Image aspect implied by the texture format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        match self.format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
                vk::ImageAspectFlags::DEPTH
            }
            vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

impl BufferDesc {
    pub fn new(size: u64, usage: vk::BufferUsageFlags, memory: MemoryUsage) -> Self {
        Self {
            size,
            usage,
            memory,
        }
    }
}

impl TextureViewDesc {
    /// A view over every mip and layer of the texture.
    pub fn full(texture: TextureHandle, desc: &TextureDesc) -> Self {
        Self {
            texture,
            format: desc.format,
            aspect: desc.aspect(),
            base_mip: 0,
            mip_count: desc.mip_levels,
            base_layer: 0,
            layer_count: desc.array_layers,
        }
    }
}

impl NativeResource {
    pub fn as_raw(&self) -> u64 {
        match self {
            NativeResource::Buffer(buffer) => buffer.as_raw(),
            NativeResource::Texture(texture) => texture.as_raw(),
        }
    }
}
