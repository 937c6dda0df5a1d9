//! Re-exports most commonly used types in the library

pub use ash::vk;

pub use crate::core::error::Error;
pub use crate::core::queue::{QueueAffinity, QueueId, QueueInfo, QueueType, PRIMARY_QUEUE};
pub use crate::core::settings::{BackendBuilder, BackendSettings, MAX_FRAMES_IN_FLIGHT};

pub use crate::device::headless::{ObjectKind, RecordedCommand, SubmissionRecord};
pub use crate::device::{
    BindLayoutId, BufferDesc, BufferHandle, BufferViewDesc, Device, HeadlessDevice, MemoryKind, MemoryRequirements,
    MemoryUsage, NativeResource, PipelineId, ResourceDesc, TextureDesc, TextureHandle, TextureViewDesc,
};

pub use crate::graph::command::{Binding, BindingView, Command, CommandList};
pub use crate::graph::pass::{AccessKind, Pass, PassBuilder, PassId};
pub use crate::graph::resource::{ResourceId, ResourceType};
pub use crate::graph::FrameGraph;

pub use crate::phases::aliasing::AliasingConfig;
pub use crate::phases::barrier::{Barrier, BarrierKind};
pub use crate::phases::graphviz::GraphViz;
pub use crate::phases::schedule::ReorderConfig;
pub use crate::phases::{CompileOptions, CompiledFrame};

pub use crate::resource::state::{AllocationMark, ResourceState, ResourceTags};
pub use crate::resource::ResourcePools;

pub use crate::backend::executor::{ExecutorState, FrameExecutor};
pub use crate::backend::future::FrameFuture;
pub use crate::backend::profiler::Profiler;
pub use crate::backend::Backend;
