//! Replays the recorded command lists of a compiled frame onto native command buffers and submits them.
//!
//! Each [`Segment`] becomes one submission on its queue. It waits on the timeline values of its sync points,
//! and signals its own queue's timeline once its last pass completes. A final submission on the primary queue
//! waits for every other queue, transitions imported resources into their final state and signals the frame
//! fence.

use anyhow::Result;
use ash::vk;

use crate::backend::allocation::FrameResources;
use crate::backend::executor::FrameExecutor;
use crate::backend::profiler::Profiler;
use crate::core::error::Error;
use crate::core::queue::{QueueId, PRIMARY_QUEUE};
use crate::device::{
    BindingWrite, BoundResource, BufferViewDesc, CommandBufferHandle, Device, NativeBarrier, NativeCommand,
    ResourceDesc, SemaphoreHandle, SemaphoreSubmit, SubmitInfo, TextureViewDesc, TextureViewHandle,
};
use crate::graph::command::{Binding, BindingView, Command};
use crate::graph::resource::ResourceId;
use crate::phases::barrier::Barrier;
use crate::phases::sync::Segment;
use crate::phases::CompiledFrame;
use crate::resource::ResourcePools;

const LABEL_COLOR: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

/// One timeline semaphore per queue, with the value each queue reached at the end of the last submitted frame.
#[derive(Debug, Clone)]
pub(crate) struct Timelines {
    pub semaphores: Vec<SemaphoreHandle>,
    pub values: Vec<u64>,
}

struct Replay<'a, 'p> {
    device: &'a dyn Device,
    compiled: &'a CompiledFrame,
    resources: &'a FrameResources,
    pools: &'a ResourcePools,
    executor: &'a mut FrameExecutor,
    profiler: Option<&'p mut dyn Profiler>,
}

impl Timelines {
    fn wait(&self, queue: QueueId, value: u64) -> SemaphoreSubmit {
        SemaphoreSubmit {
            semaphore: self.semaphores[queue.index()],
            value,
            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        }
    }
}

impl<'a, 'p> Replay<'a, 'p> {
    fn natives(&self, barriers: &[Barrier]) -> Result<Vec<NativeBarrier>> {
        barriers
            .iter()
            .map(|barrier| {
                let queue_type = self.compiled.schedule.queue_type(barrier.queue);
                Ok(barrier.to_native(self.resources.native(barrier.resource)?, queue_type))
            })
            .collect()
    }

    fn texture_view(&self, resource: ResourceId, range: Option<BindingView>) -> Result<TextureViewHandle> {
        let texture = self.resources.texture(resource)?;
        let ResourceDesc::Texture(desc) = self.resources.desc(resource)? else {
            return Err(Error::InvalidResource(format!("{resource} is not a texture")).into());
        };
        let mut view = TextureViewDesc::full(texture, desc);
        if let Some(BindingView::TextureRange {
            base_mip,
            mip_count,
            base_layer,
            layer_count,
        }) = range
        {
            view.base_mip = base_mip;
            view.mip_count = mip_count;
            view.base_layer = base_layer;
            view.layer_count = layer_count;
        }
        self.pools.texture_views.allocate(&view, self.compiled.frame_index)
    }

    fn extent(&self, resource: ResourceId) -> Result<vk::Extent2D> {
        match self.resources.desc(resource)? {
            ResourceDesc::Texture(desc) => Ok(desc.extent()),
            ResourceDesc::Buffer(_) => Err(Error::InvalidResource(format!("{resource} is not a texture")).into()),
        }
    }

    fn binding(&self, binding: &Binding) -> Result<BindingWrite> {
        let resource = match (self.resources.desc(binding.resource)?, binding.view) {
            (ResourceDesc::Buffer(desc), BindingView::Whole) => BoundResource::Buffer {
                buffer: self.resources.buffer(binding.resource)?,
                offset: 0,
                size: desc.size,
            },
            (
                ResourceDesc::Buffer(_),
                BindingView::BufferRange {
                    offset,
                    size,
                },
            ) => BoundResource::Buffer {
                buffer: self.resources.buffer(binding.resource)?,
                offset,
                size,
            },
            (
                ResourceDesc::Buffer(_),
                BindingView::TypedBuffer {
                    format,
                    offset,
                    size,
                },
            ) => {
                let desc = BufferViewDesc {
                    buffer: self.resources.buffer(binding.resource)?,
                    format,
                    offset,
                    size,
                };
                BoundResource::BufferView(self.pools.buffer_views.allocate(&desc, self.compiled.frame_index)?)
            }
            (ResourceDesc::Texture(_), BindingView::Whole | BindingView::TextureRange { .. }) => {
                BoundResource::TextureView(self.texture_view(binding.resource, Some(binding.view))?)
            }
            _ => {
                return Err(Error::InvalidResource(format!(
                    "binding {:?} does not match the type of {}",
                    binding.view, binding.resource
                ))
                .into())
            }
        };
        Ok(BindingWrite {
            slot: binding.slot,
            resource,
        })
    }

    /// Translate a recorded command into native commands, resolving every resource.
    fn resolve(&mut self, command: &Command) -> Result<Vec<NativeCommand>> {
        let native = match command {
            Command::BeginRendering {
                colors,
                depth,
                clear,
            } => {
                let extent = match colors.first().or(depth.as_ref()) {
                    Some(resource) => self.extent(*resource)?,
                    None => vk::Extent2D::default(),
                };
                NativeCommand::BeginRendering {
                    colors: colors
                        .iter()
                        .map(|color| self.texture_view(*color, None))
                        .collect::<Result<Vec<_>>>()?,
                    depth: depth.map(|depth| self.texture_view(depth, None)).transpose()?,
                    clear: *clear,
                    extent,
                }
            }
            Command::EndRendering => NativeCommand::EndRendering,
            Command::BindPipeline(pipeline) => NativeCommand::BindPipeline(*pipeline),
            Command::BindResources {
                set,
                layout,
                bindings,
            } => {
                let writes = bindings
                    .iter()
                    .map(|binding| self.binding(binding))
                    .collect::<Result<Vec<_>>>()?;
                let table = self.executor.bind_table(*layout)?;
                self.device.update_bind_table(table, &writes)?;
                NativeCommand::BindTable {
                    set: *set,
                    table,
                }
            }
            Command::Draw {
                vertices,
                instances,
                first_vertex,
                first_instance,
            } => NativeCommand::Draw {
                vertices: *vertices,
                instances: *instances,
                first_vertex: *first_vertex,
                first_instance: *first_instance,
            },
            Command::DrawIndexed {
                index_buffer,
                indices,
                instances,
                first_index,
                vertex_offset,
            } => NativeCommand::DrawIndexed {
                index_buffer: self.resources.buffer(*index_buffer)?,
                indices: *indices,
                instances: *instances,
                first_index: *first_index,
                vertex_offset: *vertex_offset,
            },
            Command::Dispatch {
                x,
                y,
                z,
            } => NativeCommand::Dispatch {
                x: *x,
                y: *y,
                z: *z,
            },
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => NativeCommand::CopyBuffer {
                src: self.resources.buffer(*src)?,
                dst: self.resources.buffer(*dst)?,
                src_offset: *src_offset,
                dst_offset: *dst_offset,
                size: *size,
            },
            Command::CopyBufferToTexture {
                src,
                dst,
                offset,
                mip,
            } => NativeCommand::CopyBufferToTexture {
                src: self.resources.buffer(*src)?,
                dst: self.resources.texture(*dst)?,
                offset: *offset,
                mip: *mip,
            },
            Command::CopyTexture {
                src,
                dst,
            } => NativeCommand::CopyTexture {
                src: self.resources.texture(*src)?,
                dst: self.resources.texture(*dst)?,
            },
            Command::FillBuffer {
                buffer,
                offset,
                size,
                value,
            } => NativeCommand::FillBuffer {
                buffer: self.resources.buffer(*buffer)?,
                offset: *offset,
                size: *size,
                value: *value,
            },
            Command::Label(name) => {
                return Ok(vec![
                    NativeCommand::BeginLabel {
                        name: name.clone(),
                        color: LABEL_COLOR,
                    },
                    NativeCommand::EndLabel,
                ])
            }
        };
        Ok(vec![native])
    }

    fn record_segment(&mut self, segment: &Segment, commands: &mut [Vec<Command>]) -> Result<CommandBufferHandle> {
        let compiled = self.compiled;
        let cmd = self.executor.command_buffer(segment.queue)?;
        for pass in &segment.passes {
            let info = compiled.info.get(*pass);
            if let Some(profiler) = self.profiler.as_deref_mut() {
                profiler.on_pass_begin(&info.name, segment.queue);
            }
            #[cfg(feature = "debug-markers")]
            self.device.cmd_execute(
                cmd,
                &NativeCommand::BeginLabel {
                    name: info.name.clone(),
                    color: info.color.unwrap_or(LABEL_COLOR),
                },
            );
            self.executor.write_marker(cmd, format!("Pass Begin: {}", info.name));

            let barriers = self.natives(compiled.barriers.before_pass(*pass))?;
            if !barriers.is_empty() {
                self.device.cmd_pipeline_barrier(cmd, &barriers);
            }
            for command in std::mem::take(&mut commands[pass.index()]) {
                for native in self.resolve(&command)? {
                    self.device.cmd_execute(cmd, &native);
                }
            }

            self.executor.write_marker(cmd, format!("Pass End: {}", info.name));
            #[cfg(feature = "debug-markers")]
            self.device.cmd_execute(cmd, &NativeCommand::EndLabel);
            if let Some(profiler) = self.profiler.as_deref_mut() {
                profiler.on_pass_end(&info.name, segment.queue);
            }
        }
        self.device.end_command_buffer(cmd)?;
        Ok(cmd)
    }
}

/// Record and submit every segment of a frame, then commit the executor. Advances the timelines.
#[allow(clippy::too_many_arguments)]
pub(crate) fn submit_frame(
    device: &dyn Device,
    compiled: &CompiledFrame,
    mut commands: Vec<Vec<Command>>,
    resources: &FrameResources,
    pools: &ResourcePools,
    executor: &mut FrameExecutor,
    timelines: &mut Timelines,
    profiler: Option<&mut dyn Profiler>,
) -> Result<()> {
    let schedule = &compiled.schedule;
    let base = timelines.values.clone();
    let mut replay = Replay {
        device,
        compiled,
        resources,
        pools,
        executor,
        profiler,
    };

    let mut started = vec![false; base.len()];
    for segment in compiled.sync.segments(schedule) {
        let cmd = replay.record_segment(&segment, &mut commands)?;
        let mut waits = segment
            .waits
            .iter()
            .map(|index| {
                let point = &compiled.sync.points()[*index];
                timelines.wait(point.source, base[point.source.index()] + point.value)
            })
            .collect::<Vec<_>>();
        // Other queues start after the previous frame completed on the primary queue.
        if segment.queue != PRIMARY_QUEUE && !started[segment.queue.index()] && base[PRIMARY_QUEUE.index()] > 0 {
            waits.push(timelines.wait(PRIMARY_QUEUE, base[PRIMARY_QUEUE.index()]));
        }
        started[segment.queue.index()] = true;

        let info = SubmitInfo {
            command_buffers: vec![cmd],
            waits,
            signals: vec![timelines.wait(segment.queue, base[segment.queue.index()] + segment.signal)],
            fence: None,
        };
        if let Some(profiler) = replay.profiler.as_deref_mut() {
            profiler.on_submit_begin(&segment);
        }
        device.submit(segment.queue, &info)?;
        if let Some(profiler) = replay.profiler.as_deref_mut() {
            profiler.on_submit_end(&segment);
        }
        trace!(
            "Submitted {} passes on {}, signaling {}",
            segment.passes.len(),
            segment.queue,
            info.signals[0].value
        );
    }

    let epilogue = replay.natives(compiled.barriers.epilogue())?;
    let cmd = if epilogue.is_empty() {
        None
    } else {
        let cmd = replay.executor.command_buffer(PRIMARY_QUEUE)?;
        device.cmd_pipeline_barrier(cmd, &epilogue);
        device.end_command_buffer(cmd)?;
        Some(cmd)
    };

    let mut values = base.clone();
    let mut waits = vec![];
    for queue in schedule.queues() {
        values[queue.id.index()] += schedule.sequence(queue.id).len() as u64;
        if queue.id != PRIMARY_QUEUE && values[queue.id.index()] > base[queue.id.index()] {
            waits.push(timelines.wait(queue.id, values[queue.id.index()]));
        }
    }
    values[PRIMARY_QUEUE.index()] += 1;
    let signals = vec![timelines.wait(PRIMARY_QUEUE, values[PRIMARY_QUEUE.index()])];
    replay.executor.commit(cmd, waits, signals)?;
    timelines.values = values;
    Ok(())
}
