//! This module mainly exposes the [`PassBuilder`] struct, used for correctly defining passes in a
//! [`FrameGraph`](crate::graph::FrameGraph).
//!
//! Each pass must declare every resource it reads or writes, together with the state the resource has to be in
//! for that access. Optionally it specifies a queue affinity, explicit ordering constraints and a recorder closure
//! that is called when the frame is compiled. Additionally, a color can be given to each pass which will show up in
//! graphics debuggers if the `debug-markers` feature is enabled.
//!
//! # Example
//!
//! A compute pass producing a buffer, and a graphics pass consuming it.
//! ```
//! use render_backend::prelude::*;
//!
//! let mut graph = FrameGraph::new(0);
//! let particles = graph.create_buffer("particles", BufferDesc::new(4096, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryUsage::GpuOnly));
//! let target = graph.create_texture("target", TextureDesc::new_2d(64, 64, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT));
//!
//! let simulate = PassBuilder::compute("simulate")
//!     .write(particles, ResourceState::UnorderedAccess)
//!     .record(move |cmd| {
//!         cmd.dispatch(64, 1, 1)?;
//!         Ok(())
//!     })
//!     .build();
//! let draw = PassBuilder::graphics("draw")
//!     .read(particles, ResourceState::VertexBuffer)
//!     .write(target, ResourceState::RenderTarget)
//!     .color([0.0, 1.0, 0.0, 1.0])
//!     .record(move |cmd| {
//!         cmd.begin_rendering(&[target], None, Some([0.0; 4]))?
//!            .draw(4096, 1, 0, 0)?
//!            .end_rendering()?;
//!         Ok(())
//!     })
//!     .build();
//! graph.add_pass(simulate)?;
//! graph.add_pass(draw)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::fmt::{Display, Formatter};

use anyhow::Result;

use crate::core::queue::QueueAffinity;
use crate::graph::command::CommandList;
use crate::graph::resource::ResourceId;
use crate::resource::state::ResourceState;

/// Handle to a pass in a [`FrameGraph`](crate::graph::FrameGraph).
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PassId {
    pub(crate) index: u32,
    pub(crate) frame: u64,
}

/// How a pass accesses a resource.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
}

/// One declared resource access.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Access {
    pub resource: ResourceId,
    pub state: ResourceState,
    pub kind: AccessKind,
}

/// Records the commands of a pass.
pub type BoxedRecorder<'cb> = Box<dyn FnOnce(&mut CommandList) -> Result<()> + 'cb>;

/// Represents one pass in a frame graph. You can obtain one using a [`PassBuilder`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Pass<'cb> {
    pub(crate) name: String,
    pub(crate) color: Option<[f32; 4]>,
    pub(crate) accesses: Vec<Access>,
    pub(crate) affinity: QueueAffinity,
    pub(crate) after: Vec<PassId>,
    #[derivative(Debug = "ignore")]
    pub(crate) recorder: Option<BoxedRecorder<'cb>>,
}

/// Used to create [`Pass`] objects correctly.
pub struct PassBuilder<'cb> {
    inner: Pass<'cb>,
}

impl PassId {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn new(index: usize, frame: u64) -> Self {
        Self {
            index: index as u32,
            frame,
        }
    }
}

impl Display for PassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pass#{}", self.index)
    }
}

impl AccessKind {
    pub fn is_read(&self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::ReadWrite)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, AccessKind::Write | AccessKind::ReadWrite)
    }

    /// Combine two accesses to the same resource.
    pub fn merge(self, other: AccessKind) -> AccessKind {
        if self == other {
            self
        } else {
            AccessKind::ReadWrite
        }
    }
}

impl<'cb> Pass<'cb> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    pub fn affinity(&self) -> QueueAffinity {
        self.affinity
    }

    pub fn color(&self) -> Option<[f32; 4]> {
        self.color
    }
}

impl<'cb> PassBuilder<'cb> {
    /// Create a new pass with no queue preference. It will run on the primary graphics queue.
    pub fn new(name: impl Into<String>) -> Self {
        PassBuilder {
            inner: Pass {
                name: name.into(),
                color: None,
                accesses: vec![],
                affinity: QueueAffinity::Any,
                after: vec![],
                recorder: None,
            },
        }
    }

    /// Create a new pass that must run on a graphics queue.
    pub fn graphics(name: impl Into<String>) -> Self {
        Self::new(name).affinity(QueueAffinity::Graphics)
    }

    /// Create a new pass that prefers an async compute queue.
    pub fn compute(name: impl Into<String>) -> Self {
        Self::new(name).affinity(QueueAffinity::Compute)
    }

    /// Create a new pass that prefers a dedicated copy queue.
    pub fn copy(name: impl Into<String>) -> Self {
        Self::new(name).affinity(QueueAffinity::Copy)
    }

    pub fn affinity(mut self, affinity: QueueAffinity) -> Self {
        self.inner.affinity = affinity;
        self
    }

    /// Set the color of this pass. This can show up in graphics debuggers like RenderDoc.
    pub fn color(mut self, color: [f32; 4]) -> Self {
        self.inner.color = Some(color);
        self
    }

    /// Declare a read of a resource in the given state.
    pub fn read(mut self, resource: ResourceId, state: ResourceState) -> Self {
        self.inner.accesses.push(Access {
            resource,
            state,
            kind: AccessKind::Read,
        });
        self
    }

    /// Declare a write of a resource in the given state.
    pub fn write(mut self, resource: ResourceId, state: ResourceState) -> Self {
        self.inner.accesses.push(Access {
            resource,
            state,
            kind: AccessKind::Write,
        });
        self
    }

    /// Declare a read-modify-write of a resource in the given state.
    pub fn read_write(mut self, resource: ResourceId, state: ResourceState) -> Self {
        self.inner.accesses.push(Access {
            resource,
            state,
            kind: AccessKind::ReadWrite,
        });
        self
    }

    /// This pass must execute after `pass`, even if they share no resources.
    pub fn after(mut self, pass: PassId) -> Self {
        self.inner.after.push(pass);
        self
    }

    /// Set the function that records this pass' commands.
    pub fn record(mut self, recorder: impl FnOnce(&mut CommandList) -> Result<()> + 'cb) -> Self {
        self.inner.recorder = Some(Box::new(recorder));
        self
    }

    /// Obtain a built [`Pass`] object.
    pub fn build(self) -> Pass<'cb> {
        self.inner
    }
}
