//! The backend runs frame graphs on the device.
//!
//! For every frame, [`Backend::execute`] compiles the graph, waits until the executor slot of the frame is free,
//! realizes the graph's resources from the shared pools, replays every pass onto native command buffers and
//! submits them to their queues. Frame `n` runs on executor `n % frames_in_flight`, so the CPU can run at most
//! `frames_in_flight` frames ahead of the GPU.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use render_backend::prelude::*;
//!
//! let device = Arc::new(HeadlessDevice::new());
//! let mut backend = Backend::new(device, BackendBuilder::new().compute_queues(1).build())?;
//!
//! let mut graph = backend.new_frame();
//! let data = graph.create_buffer("data", BufferDesc::new(4096, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryUsage::GpuOnly));
//! let fill = PassBuilder::compute("fill")
//!     .write(data, ResourceState::CopyDest)
//!     .record(move |cmd| {
//!         cmd.fill_buffer(data, 0, 4096, 0)?;
//!         Ok(())
//!     })
//!     .build();
//! graph.add_pass(fill)?;
//! let frame = backend.execute(graph, None)?;
//! backend.wait_frame(frame)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::sync::Arc;

use anyhow::Result;

use crate::backend::executor::FrameExecutor;
use crate::backend::future::FrameFuture;
use crate::backend::profiler::Profiler;
use crate::backend::replay::Timelines;
use crate::core::error::Error;
use crate::core::queue::QueueInfo;
use crate::core::settings::BackendSettings;
use crate::device::{Device, ResourceDesc};
use crate::graph::command::Command;
use crate::graph::FrameGraph;
use crate::phases::aliasing::AliasingConfig;
use crate::phases::schedule::ReorderConfig;
use crate::phases::{CompileOptions, CompiledFrame};
use crate::resource::state::ResourceTags;
use crate::resource::ResourcePools;

pub mod allocation;
pub mod executor;
pub mod future;
pub mod profiler;
pub(crate) mod replay;

/// Executes frame graphs. See the [module level documentation](crate::backend).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Backend {
    #[derivative(Debug = "ignore")]
    device: Arc<dyn Device>,
    settings: BackendSettings,
    queues: Vec<QueueInfo>,
    pools: Arc<ResourcePools>,
    executors: Vec<FrameExecutor>,
    timelines: Timelines,
    frame_index: u64,
    #[derivative(Debug = "ignore")]
    last_compiled: Option<CompiledFrame>,
}

impl Backend {
    /// Create a backend with one executor per frame in flight and one timeline semaphore per queue.
    pub fn new(device: Arc<dyn Device>, settings: BackendSettings) -> Result<Self> {
        let queues = settings.queues();
        for queue in &queues {
            info!("Using {} as {} queue #{}", queue.id, queue.queue_type, queue.type_index);
        }
        let executors = (0..settings.frames_in_flight)
            .map(|slot| FrameExecutor::initialize(device.clone(), slot, &queues, &settings))
            .collect::<Result<Vec<_>>>()?;
        let semaphores = queues
            .iter()
            .map(|_| device.create_timeline_semaphore(0))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "Created render backend with {} frames in flight, aliasing {}",
            settings.frames_in_flight,
            if settings.aliasing { "enabled" } else { "disabled" }
        );
        Ok(Self {
            pools: ResourcePools::new(device.clone()),
            timelines: Timelines {
                values: vec![0; semaphores.len()],
                semaphores,
            },
            device,
            settings,
            queues,
            executors,
            frame_index: 0,
            last_compiled: None,
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    pub fn queues(&self) -> &[QueueInfo] {
        &self.queues
    }

    /// The pools frame resources are allocated from. They can be shared with other systems.
    pub fn pools(&self) -> &Arc<ResourcePools> {
        &self.pools
    }

    pub fn executors(&self) -> &[FrameExecutor] {
        &self.executors
    }

    /// Index of the next frame to be executed.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// The compiled form of the last executed frame.
    pub fn last_compiled(&self) -> Option<&CompiledFrame> {
        self.last_compiled.as_ref()
    }

    /// Create an empty graph for the next frame.
    pub fn new_frame<'cb>(&self) -> FrameGraph<'cb> {
        FrameGraph::new(self.frame_index)
    }

    /// Run the compile phases on a graph without executing it.
    pub fn compile(&self, graph: &FrameGraph) -> Result<CompiledFrame> {
        let device = self.device.clone();
        let requirements = move |desc: &ResourceDesc| device.memory_requirements(desc);
        let options = CompileOptions {
            aliasing: AliasingConfig {
                enabled: self.settings.aliasing,
                min_size: self.settings.min_alias_size,
            },
            reorder: self.settings.reorder.then(ReorderConfig::default),
        };
        crate::phases::compile(graph, &self.queues, &options, &requirements)
    }

    /// Compile and execute a frame graph. Returns the index of the executed frame.
    ///
    /// Blocks if the executor slot of this frame is still in use by the GPU.
    ///
    /// # Errors
    /// - Any compile error of the graph. Nothing is submitted in that case.
    /// - [`Error::StaleHandle`] if the graph was not created for the next frame.
    /// - [`Error::FenceTimeout`] if the executor slot did not become free in time.
    /// - [`Error::DeviceLost`] if the device was lost. The crash marker traces of every executor are logged.
    pub fn execute(&mut self, mut graph: FrameGraph, mut profiler: Option<&mut dyn Profiler>) -> Result<u64> {
        if self.device.is_lost() {
            self.print_error_traces()?;
            return Err(Error::DeviceLost.into());
        }
        if graph.frame_index() != self.frame_index {
            return Err(Error::StaleHandle.into());
        }
        let frame = self.frame_index;

        if let Some(profiler) = profiler.as_deref_mut() {
            profiler.on_compile_begin(frame);
        }
        let compiled = self.compile(&graph).map_err(|err| {
            error!("Frame {frame} failed to compile: {err}");
            err
        })?;
        if let Some(profiler) = profiler.as_deref_mut() {
            profiler.on_compile_end(&compiled);
        }
        let commands = graph.record()?;

        let slot = (frame % self.executors.len() as u64) as usize;
        self.executors[slot].wait(self.settings.fence_timeout)?;
        let latest_finished = self.get_latest_finished_frame()?;
        self.executors[slot].reset_begin(frame, &self.pools)?;
        // The frame index is used up from here on, even if submission fails.
        self.frame_index += 1;

        if let Err(err) = self.submit(slot, &graph, &compiled, commands, latest_finished, profiler) {
            self.executors[slot].abort()?;
            for (value, semaphore) in self.timelines.values.iter_mut().zip(&self.timelines.semaphores) {
                *value = self.device.semaphore_counter_value(*semaphore)?;
            }
            if self.device.is_lost() {
                self.print_error_traces()?;
                return Err(Error::DeviceLost.into());
            }
            return Err(err);
        }

        debug!(
            "Executed frame {frame}: {} passes, {} sync points, {} barriers",
            compiled.info.len(),
            compiled.sync.len(),
            compiled.barriers.len()
        );
        self.last_compiled = Some(compiled);
        Ok(frame)
    }

    fn submit(
        &mut self,
        slot: usize,
        graph: &FrameGraph,
        compiled: &CompiledFrame,
        commands: Vec<Vec<Command>>,
        latest_finished: Option<u64>,
        profiler: Option<&mut dyn Profiler>,
    ) -> Result<()> {
        let executor = &mut self.executors[slot];
        let resources =
            allocation::allocate(graph, compiled, self.device.as_ref(), &self.pools, executor, latest_finished)?;
        let result = replay::submit_frame(
            self.device.as_ref(),
            compiled,
            commands,
            &resources,
            &self.pools,
            executor,
            &mut self.timelines,
            profiler,
        );
        resources.release(compiled, &self.pools)?;
        result
    }

    /// Block until the executor slot of `frame` is free, that is until the GPU finished the last frame
    /// submitted on slot `frame % frames_in_flight`.
    pub fn wait_frame(&mut self, frame: u64) -> Result<()> {
        let slot = (frame % self.executors.len() as u64) as usize;
        match self.executors[slot].wait(self.settings.fence_timeout) {
            Err(err) if self.device.is_lost() => {
                self.print_error_traces()?;
                Err(err.context(Error::DeviceLost))
            }
            result => result,
        }
    }

    /// A future that resolves once the executor slot of `frame` is free. See [`Backend::wait_frame`].
    pub fn frame_future(&self, frame: u64) -> FrameFuture {
        let executor = &self.executors[(frame % self.executors.len() as u64) as usize];
        FrameFuture::new(self.device.clone(), executor.fence(), frame, executor.current_frame())
    }

    /// The latest frame the GPU is known to have finished, if any.
    pub fn get_latest_finished_frame(&self) -> Result<Option<u64>> {
        let in_flight = self.executors.len() as u64;
        let mut latest = None;
        for executor in &self.executors {
            let Some(frame) = executor.frame_index() else {
                continue;
            };
            // An executor is only reused once its previous frame finished.
            let finished = if executor.is_finished()? {
                Some(frame)
            } else {
                frame.checked_sub(in_flight)
            };
            latest = latest.max(finished);
        }
        Ok(latest)
    }

    /// Clamp a garbage collection cutoff, so that no object a frame in flight may use is freed.
    fn clamp_critical_frame(&self, critical_frame: u64) -> Result<u64> {
        let finished = self.get_latest_finished_frame()?.map_or(0, |frame| frame + 1);
        let limit = finished.min(self.frame_index.saturating_sub(self.executors.len() as u64));
        if critical_frame > limit {
            warn!("Garbage collection up to frame {critical_frame} requested, but frames from {limit} may still be in use");
            return Ok(limit);
        }
        Ok(critical_frame)
    }

    /// Destroy pooled textures and buffers last used before `critical_frame` whose tags pass the filters,
    /// together with unused memory blocks and views. Returns the amount of objects destroyed.
    pub fn collect_garbage(
        &self,
        critical_frame: u64,
        texture_with: ResourceTags,
        texture_without: ResourceTags,
        buffer_with: ResourceTags,
        buffer_without: ResourceTags,
    ) -> Result<usize> {
        let critical_frame = self.clamp_critical_frame(critical_frame)?;
        let freed = self.collect_textures(critical_frame, texture_with, texture_without)?
            + self.collect_buffers(critical_frame, buffer_with, buffer_without)?
            + self.pools.memory.collect_garbage(critical_frame, ResourceTags::DEFAULT, ResourceTags::INVALID)?
            + self.collect_view_garbage(critical_frame)?;
        debug!("Collected {freed} pooled objects up to frame {critical_frame}");
        Ok(freed)
    }

    /// Destroy pooled textures last used before `critical_frame` whose tags pass the filter, and their views.
    pub fn collect_texture_garbage(&self, critical_frame: u64, with: ResourceTags, without: ResourceTags) -> Result<usize> {
        let critical_frame = self.clamp_critical_frame(critical_frame)?;
        self.collect_textures(critical_frame, with, without)
    }

    /// Destroy pooled buffers last used before `critical_frame` whose tags pass the filter, and their views.
    pub fn collect_buffer_garbage(&self, critical_frame: u64, with: ResourceTags, without: ResourceTags) -> Result<usize> {
        let critical_frame = self.clamp_critical_frame(critical_frame)?;
        self.collect_buffers(critical_frame, with, without)
    }

    /// Destroy views that were not used since `critical_frame`.
    pub fn collect_view_garbage(&self, critical_frame: u64) -> Result<usize> {
        let critical_frame = self.clamp_critical_frame(critical_frame)?;
        Ok(self.pools.texture_views.collect_garbage(critical_frame)?
            + self.pools.buffer_views.collect_garbage(critical_frame)?)
    }

    fn collect_textures(&self, critical_frame: u64, with: ResourceTags, without: ResourceTags) -> Result<usize> {
        let views = &self.pools.texture_views;
        self.pools.textures.collect_garbage_with(critical_frame, with, without, |texture| {
            if let Err(err) = views.erase(*texture) {
                error!("Failed to erase views of {texture:?}: {err}");
            }
        })
    }

    fn collect_buffers(&self, critical_frame: u64, with: ResourceTags, without: ResourceTags) -> Result<usize> {
        let views = &self.pools.buffer_views;
        self.pools.buffers.collect_garbage_with(critical_frame, with, without, |buffer| {
            if let Err(err) = views.erase(*buffer) {
                error!("Failed to erase views of {buffer:?}: {err}");
            }
        })
    }

    /// Read back the crash markers of every executor and log the passes the GPU did not finish.
    pub fn print_error_traces(&self) -> Result<Vec<String>> {
        error!("Device lost, printing crash marker traces");
        let mut missed = vec![];
        for executor in &self.executors {
            missed.extend(executor.print_error_trace()?);
        }
        Ok(missed)
    }

    /// Wait for all frames, then destroy every executor, pooled object and semaphore.
    /// Called automatically when the backend is dropped.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.executors.is_empty() {
            return Ok(());
        }
        info!("Shutting down render backend after {} frames", self.frame_index);
        for executor in self.executors.drain(..) {
            executor.finalize(&self.pools, self.settings.fence_timeout)?;
        }
        let freed = self.pools.clear()?;
        debug!("Destroyed {freed} pooled objects");
        for semaphore in self.timelines.semaphores.drain(..) {
            self.device.free_semaphore(semaphore);
        }
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("Error shutting down render backend: {err}");
        }
    }
}
