//! Frame executors. The backend owns one per frame in flight, and frame `n` always runs on executor
//! `n % frames_in_flight`.
//!
//! An executor owns everything the GPU may still be reading while its frame is in flight: the command pools of
//! every queue, a fence, the bind tables handed out during recording, and placed resources backing aliased
//! memory. All of it is recycled in [`FrameExecutor::reset_begin`], which may only be called once the fence of
//! the previous frame on this slot has signaled.
//!
//! # Crash markers
//!
//! When enabled, each executor owns a small host visible buffer. Before and after every pass a fill command
//! writes the executor's current marker value into the next slot of the buffer. If the device is lost, the slots
//! that never received the value tell which passes the GPU did not finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ash::vk;

use crate::core::error::Error;
use crate::core::queue::{QueueId, QueueInfo, PRIMARY_QUEUE};
use crate::core::settings::BackendSettings;
use crate::device::{
    BindLayoutId, BindTableHandle, BufferDesc, BufferHandle, CommandBufferHandle, CommandPoolHandle, Device,
    FenceHandle, MemoryUsage, NativeCommand, NativeResource, SemaphoreSubmit, SubmitInfo,
};
use crate::resource::bind_table::BindTablePool;
use crate::resource::ResourcePools;

/// Lifecycle of a frame executor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutorState {
    /// No work in flight, ready to record.
    Idle,
    /// Between [`FrameExecutor::reset_begin`] and [`FrameExecutor::commit`].
    Recording,
    /// Submitted, the fence signals when the GPU is done.
    Committed,
}

#[derive(Debug)]
struct QueueContext {
    queue: QueueInfo,
    pool: CommandPoolHandle,
    buffers: Vec<CommandBufferHandle>,
    used: usize,
}

#[derive(Debug)]
struct CrashMarkers {
    buffer: BufferHandle,
    capacity: u32,
    written: u32,
    valid: u32,
    messages: Vec<String>,
}

/// Owns the per-slot state of one frame in flight.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct FrameExecutor {
    #[derivative(Debug = "ignore")]
    device: Arc<dyn Device>,
    slot: usize,
    state: ExecutorState,
    frame_index: Option<u64>,
    current_frame: Arc<AtomicU64>,
    fence: FenceHandle,
    queues: Vec<QueueContext>,
    bind_tables: BindTablePool,
    placed: Vec<NativeResource>,
    markers: Option<CrashMarkers>,
}

impl ExecutorState {
    fn name(&self) -> &'static str {
        match self {
            ExecutorState::Idle => "Idle",
            ExecutorState::Recording => "Recording",
            ExecutorState::Committed => "Committed",
        }
    }
}

impl FrameExecutor {
    /// Create the executor for a slot, with a command pool for every queue and a signaled fence.
    pub fn initialize(device: Arc<dyn Device>, slot: usize, queues: &[QueueInfo], settings: &BackendSettings) -> Result<Self> {
        let queues = queues
            .iter()
            .map(|queue| {
                Ok(QueueContext {
                    queue: *queue,
                    pool: device.create_command_pool(queue)?,
                    buffers: vec![],
                    used: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let markers = if settings.crash_markers {
            let desc = BufferDesc::new(
                settings.marker_capacity as u64 * 4,
                vk::BufferUsageFlags::TRANSFER_DST,
                MemoryUsage::GpuToCpu,
            );
            Some(CrashMarkers {
                buffer: device.create_buffer(&desc, None)?,
                capacity: settings.marker_capacity,
                written: 0,
                valid: 0,
                messages: vec![String::new(); settings.marker_capacity as usize],
            })
        } else {
            None
        };
        let fence = device.create_fence(true)?;
        trace!("Initialized frame executor {slot}");
        Ok(Self {
            bind_tables: BindTablePool::new(device.clone()),
            device,
            slot,
            state: ExecutorState::Idle,
            frame_index: None,
            current_frame: Arc::new(AtomicU64::new(0)),
            fence,
            queues,
            placed: vec![],
            markers,
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// The frame this executor last started recording.
    pub fn frame_index(&self) -> Option<u64> {
        self.frame_index
    }

    pub fn fence(&self) -> FenceHandle {
        self.fence
    }

    pub(crate) fn current_frame(&self) -> Arc<AtomicU64> {
        self.current_frame.clone()
    }

    fn expect_state(&self, expected: ExecutorState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidExecutorState(self.state.name(), expected.name()).into());
        }
        Ok(())
    }

    /// Recycle everything the previous frame on this slot used and start recording `frame_index`.
    /// The executor must be idle, see [`FrameExecutor::wait`].
    pub fn reset_begin(&mut self, frame_index: u64, pools: &ResourcePools) -> Result<()> {
        self.expect_state(ExecutorState::Idle)?;
        for context in &mut self.queues {
            self.device.reset_command_pool(context.pool)?;
            context.used = 0;
        }
        self.bind_tables.reset();
        self.free_placed(pools)?;
        if let Some(markers) = &mut self.markers {
            markers.written = 0;
            markers.valid = markers.valid.wrapping_add(1).max(1);
        }
        self.frame_index = Some(frame_index);
        self.current_frame.store(frame_index, Ordering::Release);
        self.state = ExecutorState::Recording;
        trace!("Executor {} recording frame {frame_index}", self.slot);
        Ok(())
    }

    fn free_placed(&mut self, pools: &ResourcePools) -> Result<()> {
        for resource in self.placed.drain(..) {
            match resource {
                NativeResource::Buffer(buffer) => {
                    pools.buffer_views.erase(buffer)?;
                    self.device.free_buffer(buffer);
                }
                NativeResource::Texture(texture) => {
                    pools.texture_views.erase(texture)?;
                    self.device.free_texture(texture);
                }
            }
        }
        Ok(())
    }

    /// Get a command buffer of a queue in the recording state. Command buffers are reused across frames.
    pub fn command_buffer(&mut self, queue: QueueId) -> Result<CommandBufferHandle> {
        self.expect_state(ExecutorState::Recording)?;
        let context = self
            .queues
            .get_mut(queue.index())
            .ok_or(Error::NoCapableQueue)?;
        if context.used == context.buffers.len() {
            let cmd = self.device.allocate_command_buffer(context.pool)?;
            context.buffers.push(cmd);
        }
        let cmd = context.buffers[context.used];
        context.used += 1;
        self.device.begin_command_buffer(cmd)?;
        Ok(cmd)
    }

    /// Get a bind table that stays valid until this executor is reset.
    pub fn bind_table(&mut self, layout: BindLayoutId) -> Result<BindTableHandle> {
        self.bind_tables.pop(layout)
    }

    /// Take ownership of a placed resource. It is destroyed the next time this executor is reset.
    pub fn own_placed(&mut self, resource: NativeResource) {
        self.placed.push(resource);
    }

    /// Record a crash marker write. Does nothing if crash markers are disabled.
    pub fn write_marker(&mut self, cmd: CommandBufferHandle, message: impl Into<String>) {
        let Some(markers) = &mut self.markers else {
            return;
        };
        let slot = markers.written % markers.capacity;
        self.device.cmd_execute(
            cmd,
            &NativeCommand::FillBuffer {
                buffer: markers.buffer,
                offset: slot as u64 * 4,
                size: 4,
                value: markers.valid,
            },
        );
        markers.messages[slot as usize] = message.into();
        markers.written += 1;
    }

    /// Submit the final submission of the frame on the primary queue. It waits for every other queue, records
    /// the end of frame barriers in `cmd` and signals the fence.
    pub fn commit(&mut self, cmd: Option<CommandBufferHandle>, waits: Vec<SemaphoreSubmit>, signals: Vec<SemaphoreSubmit>) -> Result<()> {
        self.expect_state(ExecutorState::Recording)?;
        self.device.reset_fence(self.fence)?;
        let info = SubmitInfo {
            command_buffers: cmd.into_iter().collect(),
            waits,
            signals,
            fence: Some(self.fence),
        };
        self.device.submit(PRIMARY_QUEUE, &info)?;
        self.state = ExecutorState::Committed;
        Ok(())
    }

    /// Whether the GPU finished the last frame of this executor.
    pub fn is_finished(&self) -> Result<bool> {
        match self.state {
            ExecutorState::Idle => Ok(true),
            ExecutorState::Recording => Ok(false),
            ExecutorState::Committed => self.device.fence_status(self.fence),
        }
    }

    /// Block until the GPU finished the last frame of this executor.
    ///
    /// # Errors
    /// - [`Error::FenceTimeout`] if the fence did not signal within `timeout`. The GPU is considered hung.
    /// - [`Error::InvalidExecutorState`] if the executor is still recording.
    pub fn wait(&mut self, timeout: Duration) -> Result<()> {
        match self.state {
            ExecutorState::Idle => Ok(()),
            ExecutorState::Recording => Err(Error::InvalidExecutorState(self.state.name(), "Committed").into()),
            ExecutorState::Committed => {
                if !self.device.wait_fence(self.fence, timeout)? {
                    let frame = self.frame_index.unwrap_or_default();
                    error!("Frame {frame} did not finish within {timeout:?}");
                    return Err(Error::FenceTimeout {
                        frame,
                    }
                    .into());
                }
                self.state = ExecutorState::Idle;
                Ok(())
            }
        }
    }

    /// Give up on the frame being recorded. Waits for the device to go idle, since some of its work may
    /// already have been submitted.
    pub fn abort(&mut self) -> Result<()> {
        if self.state == ExecutorState::Idle {
            return Ok(());
        }
        warn!("Aborting frame {:?} on executor {}", self.frame_index, self.slot);
        self.device.wait_idle()?;
        for context in &mut self.queues {
            self.device.reset_command_pool(context.pool)?;
            context.used = 0;
        }
        self.state = ExecutorState::Idle;
        Ok(())
    }

    /// Read back the crash markers and report every marker the GPU did not reach, oldest first.
    pub fn print_error_trace(&self) -> Result<Vec<String>> {
        let Some(markers) = &self.markers else {
            return Ok(vec![]);
        };
        let count = markers.written.min(markers.capacity);
        let mut values = vec![0u32; markers.capacity as usize];
        self.device.read_buffer(markers.buffer, 0, &mut values)?;

        let first = markers.written - count;
        let missed = (first..markers.written)
            .map(|index| (index % markers.capacity) as usize)
            .filter(|slot| values[*slot] != markers.valid)
            .map(|slot| markers.messages[slot].clone())
            .collect::<Vec<_>>();
        if !missed.is_empty() {
            error!(
                "Frame {:?} on executor {}: the GPU did not reach {} of {} markers",
                self.frame_index,
                self.slot,
                missed.len(),
                count
            );
            for message in &missed {
                error!("  not reached: {message}");
            }
        }
        Ok(missed)
    }

    /// Wait for the executor's work and destroy every object it owns.
    pub fn finalize(mut self, pools: &ResourcePools, timeout: Duration) -> Result<()> {
        if self.state == ExecutorState::Committed {
            self.wait(timeout)?;
        }
        self.free_placed(pools)?;
        self.bind_tables.destroy();
        for context in self.queues.drain(..) {
            trace!("Freeing command pool of {} on executor {}", context.queue.id, self.slot);
            self.device.free_command_pool(context.pool);
        }
        if let Some(markers) = self.markers.take() {
            self.device.free_buffer(markers.buffer);
        }
        self.device.free_fence(self.fence);
        Ok(())
    }
}
