//! Commands recorded by passes.
//!
//! A pass recorder does not talk to a command buffer. It fills a [`CommandList`] with [`Command`]s that refer to
//! logical resources, and the frame executor replays that list onto native command buffers once every resource
//! has been resolved. Every command is checked against the resources the pass declared.

use std::collections::HashSet;

use anyhow::Result;
use ash::vk;

use crate::core::error::Error;
use crate::device::{BindLayoutId, PipelineId};
use crate::graph::resource::ResourceId;

/// Which part of a resource a binding refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindingView {
    /// The whole buffer, or every mip and layer of a texture.
    Whole,
    BufferRange {
        offset: u64,
        size: u64,
    },
    /// A typed view of a buffer range.
    TypedBuffer {
        format: vk::Format,
        offset: u64,
        size: u64,
    },
    TextureRange {
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
    },
}

/// A resource written into a bind table slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Binding {
    pub slot: u32,
    pub resource: ResourceId,
    pub view: BindingView,
}

/// A single recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRendering {
        colors: Vec<ResourceId>,
        depth: Option<ResourceId>,
        clear: Option<[f32; 4]>,
    },
    EndRendering,
    BindPipeline(PipelineId),
    BindResources {
        set: u32,
        layout: BindLayoutId,
        bindings: Vec<Binding>,
    },
    Draw {
        vertices: u32,
        instances: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_buffer: ResourceId,
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
        src: ResourceId,
        dst: ResourceId,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: ResourceId,
        dst: ResourceId,
        offset: u64,
        mip: u32,
    },
    CopyTexture {
        src: ResourceId,
        dst: ResourceId,
    },
    FillBuffer {
        buffer: ResourceId,
        offset: u64,
        size: u64,
        value: u32,
    },
    /// Insert a debug label.
    Label(String),
}

/// List of commands recorded by one pass.
#[derive(Debug)]
pub struct CommandList {
    pass: String,
    declared: HashSet<ResourceId>,
    commands: Vec<Command>,
}

impl Command {
    /// Every resource this command refers to.
    pub fn resources(&self) -> Vec<ResourceId> {
        match self {
            Command::BeginRendering {
                colors,
                depth,
                ..
            } => colors.iter().copied().chain(depth.iter().copied()).collect(),
            Command::BindResources {
                bindings,
                ..
            } => bindings.iter().map(|binding| binding.resource).collect(),
            Command::DrawIndexed {
                index_buffer,
                ..
            } => vec![*index_buffer],
            Command::CopyBuffer {
                src,
                dst,
                ..
            }
            | Command::CopyBufferToTexture {
                src,
                dst,
                ..
            }
            | Command::CopyTexture {
                src,
                dst,
            } => vec![*src, *dst],
            Command::FillBuffer {
                buffer,
                ..
            } => vec![*buffer],
            Command::EndRendering
            | Command::BindPipeline(_)
            | Command::Draw {
                ..
            }
            | Command::Dispatch {
                ..
            }
            | Command::Label(_) => vec![],
        }
    }
}

impl CommandList {
    pub(crate) fn new(pass: impl Into<String>, declared: impl IntoIterator<Item = ResourceId>) -> Self {
        Self {
            pass: pass.into(),
            declared: declared.into_iter().collect(),
            commands: vec![],
        }
    }

    /// Push a command, after checking that the pass declared every resource it uses.
    pub fn push(&mut self, command: Command) -> Result<&mut Self> {
        if let Some(resource) = command.resources().into_iter().find(|r| !self.declared.contains(r)) {
            return Err(Error::UndeclaredAccess {
                pass: self.pass.clone(),
                resource: resource.to_string(),
            }
            .into());
        }
        self.commands.push(command);
        Ok(self)
    }

    pub fn begin_rendering(&mut self, colors: &[ResourceId], depth: Option<ResourceId>, clear: Option<[f32; 4]>) -> Result<&mut Self> {
        self.push(Command::BeginRendering {
            colors: colors.to_vec(),
            depth,
            clear,
        })
    }

    pub fn end_rendering(&mut self) -> Result<&mut Self> {
        self.push(Command::EndRendering)
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineId) -> Result<&mut Self> {
        self.push(Command::BindPipeline(pipeline))
    }

    /// Bind resources to a bind table of the given layout. The executor allocates the table.
    pub fn bind_resources(&mut self, set: u32, layout: BindLayoutId, bindings: &[Binding]) -> Result<&mut Self> {
        self.push(Command::BindResources {
            set,
            layout,
            bindings: bindings.to_vec(),
        })
    }

    pub fn draw(&mut self, vertices: u32, instances: u32, first_vertex: u32, first_instance: u32) -> Result<&mut Self> {
        self.push(Command::Draw {
            vertices,
            instances,
            first_vertex,
            first_instance,
        })
    }

    pub fn draw_indexed(&mut self, index_buffer: ResourceId, indices: u32, instances: u32) -> Result<&mut Self> {
        self.push(Command::DrawIndexed {
            index_buffer,
            indices,
            instances,
            first_index: 0,
            vertex_offset: 0,
        })
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<&mut Self> {
        self.push(Command::Dispatch {
            x,
            y,
            z,
        })
    }

    pub fn copy_buffer(&mut self, src: ResourceId, dst: ResourceId, size: u64) -> Result<&mut Self> {
        self.push(Command::CopyBuffer {
            src,
            dst,
            src_offset: 0,
            dst_offset: 0,
            size,
        })
    }

    pub fn copy_buffer_to_texture(&mut self, src: ResourceId, dst: ResourceId) -> Result<&mut Self> {
        self.push(Command::CopyBufferToTexture {
            src,
            dst,
            offset: 0,
            mip: 0,
        })
    }

    pub fn copy_texture(&mut self, src: ResourceId, dst: ResourceId) -> Result<&mut Self> {
        self.push(Command::CopyTexture {
            src,
            dst,
        })
    }

    pub fn fill_buffer(&mut self, buffer: ResourceId, offset: u64, size: u64, value: u32) -> Result<&mut Self> {
        self.push(Command::FillBuffer {
            buffer,
            offset,
            size,
            value,
        })
    }

    pub fn label(&mut self, label: impl Into<String>) -> Result<&mut Self> {
        self.push(Command::Label(label.into()))
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}
