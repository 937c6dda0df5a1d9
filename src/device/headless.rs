//! Software implementation of [`Device`].
//!
//! The headless device allocates no GPU memory and records every command it receives. Submissions execute
//! either immediately, or when the owner calls [`HeadlessDevice::complete_next`], which makes it possible to
//! observe frames in flight and fence backpressure. Fill commands on host visible buffers are applied on
//! execution, so crash markers can be read back as on a real device.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use ash::vk;

use crate::core::error::Error;
use crate::core::queue::{QueueId, QueueInfo};
use crate::device::*;

/// Kind of native object, used for bookkeeping.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum ObjectKind {
    Buffer,
    Texture,
    TextureView,
    BufferView,
    Memory,
    BindTable,
    CommandPool,
    CommandBuffer,
    Fence,
    Semaphore,
}

/// A command as it was recorded into a command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Barrier(Vec<NativeBarrier>),
    Command(NativeCommand),
}

/// A submission as it was received by the device, with a snapshot of the recorded commands.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub queue: QueueId,
    pub info: SubmitInfo,
    pub commands: Vec<RecordedCommand>,
}

#[derive(Debug)]
struct CommandBufferState {
    recording: bool,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    next_handle: u64,
    live: HashMap<u64, ObjectKind>,
    created: HashMap<ObjectKind, u64>,
    host_memory: HashMap<BufferHandle, Vec<u32>>,
    placements: HashMap<u64, Placement>,
    pools: HashMap<CommandPoolHandle, Vec<CommandBufferHandle>>,
    command_buffers: HashMap<CommandBufferHandle, CommandBufferState>,
    fences: HashMap<FenceHandle, bool>,
    semaphores: HashMap<SemaphoreHandle, u64>,
    submissions: Vec<SubmissionRecord>,
    pending: VecDeque<usize>,
    manual: bool,
    lost: bool,
    fills_until_lost: Option<usize>,
    unsatisfied_waits: Vec<(usize, SemaphoreSubmit)>,
    freed_while_bound: Vec<MemoryHandle>,
}

/// A [`Device`] that runs entirely on the CPU.
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
    signal: Condvar,
}

impl HeadlessState {
    fn create(&mut self, kind: ObjectKind) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle, kind);
        *self.created.entry(kind).or_default() += 1;
        self.next_handle
    }

    fn free(&mut self, handle: u64, kind: ObjectKind) {
        match self.live.remove(&handle) {
            Some(live) if live == kind => {}
            Some(live) => error!("headless device: freed {handle} as {kind:?}, but it is a {live:?}"),
            None => error!("headless device: double free of {kind:?} {handle}"),
        }
        self.placements.remove(&handle);
    }

    fn execute(&mut self, index: usize) {
        if self.lost {
            return;
        }
        let submission = self.submissions[index].clone();
        for wait in &submission.info.waits {
            let value = self.semaphores.get(&wait.semaphore).copied().unwrap_or_default();
            if value < wait.value {
                warn!("headless device: submission {index} waits on value {} but semaphore is at {value}", wait.value);
                self.unsatisfied_waits.push((index, *wait));
            }
        }

        for command in &submission.commands {
            let RecordedCommand::Command(NativeCommand::FillBuffer {
                buffer,
                offset,
                size,
                value,
            }) = command
            else {
                continue;
            };
            match self.fills_until_lost {
                Some(0) => {
                    self.lost = true;
                    self.fills_until_lost = None;
                }
                Some(remaining) => self.fills_until_lost = Some(remaining - 1),
                None => {}
            }
            if self.lost {
                return;
            }
            if let Some(memory) = self.host_memory.get_mut(buffer) {
                let first = (*offset / 4) as usize;
                let count = if *size == vk::WHOLE_SIZE { memory.len() } else { (*size / 4) as usize };
                for word in memory.iter_mut().skip(first).take(count) {
                    *word = *value;
                }
            }
        }

        for signal in &submission.info.signals {
            let current = self.semaphores.entry(signal.semaphore).or_default();
            *current = (*current).max(signal.value);
        }
        if let Some(fence) = submission.info.fence {
            self.fences.insert(fence, true);
        }
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<HeadlessState>> {
        Ok(self.state.lock().map_err(|_| Error::PoisonError)?)
    }

    fn with<R>(&self, f: impl FnOnce(&mut HeadlessState) -> R) -> Option<R> {
        match self.state.lock() {
            Ok(mut state) => Some(f(&mut state)),
            Err(_) => {
                error!("headless device: state lock poisoned");
                None
            }
        }
    }

    /// When enabled, submissions are queued and only execute through [`HeadlessDevice::complete_next`]
    /// or [`HeadlessDevice::complete_all`].
    pub fn set_manual_completion(&self, manual: bool) {
        self.with(|state| state.manual = manual);
        if !manual {
            self.complete_all();
        }
    }

    /// Execute the oldest pending submission. Returns `false` if nothing was pending.
    pub fn complete_next(&self) -> bool {
        let done = self
            .with(|state| match state.pending.pop_front() {
                Some(index) => {
                    state.execute(index);
                    true
                }
                None => false,
            })
            .unwrap_or(false);
        self.signal.notify_all();
        done
    }

    /// Execute every pending submission.
    pub fn complete_all(&self) {
        while self.complete_next() {}
    }

    pub fn pending_submissions(&self) -> usize {
        self.with(|state| state.pending.len()).unwrap_or_default()
    }

    /// Simulates a GPU crash: the device is lost while executing the fill command after the next `fills`
    /// fill commands.
    pub fn lose_device_after_fills(&self, fills: usize) {
        self.with(|state| state.fills_until_lost = Some(fills));
    }

    pub fn set_lost(&self, lost: bool) {
        self.with(|state| state.lost = lost);
        self.signal.notify_all();
    }

    /// Every submission received so far.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.with(|state| state.submissions.clone()).unwrap_or_default()
    }

    /// Semaphore waits that were not satisfied when their submission executed.
    pub fn unsatisfied_waits(&self) -> Vec<(usize, SemaphoreSubmit)> {
        self.with(|state| state.unsatisfied_waits.clone()).unwrap_or_default()
    }

    pub fn live_objects(&self, kind: ObjectKind) -> usize {
        self.with(|state| state.live.values().filter(|live| **live == kind).count())
            .unwrap_or_default()
    }

    pub fn created_objects(&self, kind: ObjectKind) -> u64 {
        self.with(|state| state.created.get(&kind).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn is_alive(&self, handle: u64) -> bool {
        self.with(|state| state.live.contains_key(&handle)).unwrap_or_default()
    }

    /// Memory blocks that were freed while placed resources were still bound to them.
    pub fn memory_freed_while_bound(&self) -> Vec<MemoryHandle> {
        self.with(|state| state.freed_while_bound.clone()).unwrap_or_default()
    }

    /// Memory placement of a placed buffer or texture.
    pub fn placement(&self, handle: u64) -> Option<Placement> {
        self.with(|state| state.placements.get(&handle).copied()).flatten()
    }

    pub fn semaphore_value(&self, semaphore: SemaphoreHandle) -> u64 {
        self.with(|state| state.semaphores.get(&semaphore).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Bytes per texel of the formats the headless device knows about. Unknown formats count as 4 bytes.
fn texel_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => 4,
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

impl Device for HeadlessDevice {
    fn create_buffer(&self, desc: &BufferDesc, placement: Option<Placement>) -> Result<BufferHandle> {
        let mut state = self.lock()?;
        let handle = state.create(ObjectKind::Buffer);
        if desc.memory != MemoryUsage::GpuOnly {
            state.host_memory.insert(BufferHandle(handle), vec![0; ((desc.size + 3) / 4) as usize]);
        }
        if let Some(placement) = placement {
            state.placements.insert(handle, placement);
        }
        Ok(BufferHandle(handle))
    }

    fn free_buffer(&self, buffer: BufferHandle) {
        self.with(|state| {
            state.host_memory.remove(&buffer);
            state.free(buffer.0, ObjectKind::Buffer)
        });
    }

    fn create_texture(&self, _desc: &TextureDesc, placement: Option<Placement>) -> Result<TextureHandle> {
        let mut state = self.lock()?;
        let handle = state.create(ObjectKind::Texture);
        if let Some(placement) = placement {
            state.placements.insert(handle, placement);
        }
        Ok(TextureHandle(handle))
    }

    fn free_texture(&self, texture: TextureHandle) {
        self.with(|state| state.free(texture.0, ObjectKind::Texture));
    }

    fn create_texture_view(&self, _desc: &TextureViewDesc) -> Result<TextureViewHandle> {
        Ok(TextureViewHandle(self.lock()?.create(ObjectKind::TextureView)))
    }

    fn free_texture_view(&self, view: TextureViewHandle) {
        self.with(|state| state.free(view.0, ObjectKind::TextureView));
    }

    fn create_buffer_view(&self, _desc: &BufferViewDesc) -> Result<BufferViewHandle> {
        Ok(BufferViewHandle(self.lock()?.create(ObjectKind::BufferView)))
    }

    fn free_buffer_view(&self, view: BufferViewHandle) {
        self.with(|state| state.free(view.0, ObjectKind::BufferView));
    }

    fn memory_requirements(&self, desc: &ResourceDesc) -> MemoryRequirements {
        match desc {
            ResourceDesc::Buffer(buffer) => MemoryRequirements {
                size: align_up(buffer.size.max(1), 256),
                alignment: 256,
            },
            ResourceDesc::Texture(texture) => {
                let texels = texture.width as u64 * texture.height as u64 * texture.depth.max(1) as u64;
                let mut size = texels * texel_size(texture.format) * texture.array_layers.max(1) as u64;
                size *= texture.samples.as_raw().max(1) as u64;
                if texture.mip_levels > 1 {
                    size = size * 4 / 3;
                }
                MemoryRequirements {
                    size: align_up(size.max(1), 4096),
                    alignment: 4096,
                }
            }
        }
    }

    fn allocate_memory(&self, _desc: &MemoryDesc) -> Result<MemoryHandle> {
        Ok(MemoryHandle(self.lock()?.create(ObjectKind::Memory)))
    }

    fn free_memory(&self, memory: MemoryHandle) {
        self.with(|state| {
            let bound = state.placements.values().filter(|placement| placement.memory == memory).count();
            if bound > 0 {
                error!("headless device: freed {memory:?} while {bound} placed resources are bound to it");
                state.freed_while_bound.push(memory);
            }
            state.free(memory.0, ObjectKind::Memory)
        });
    }

    fn create_bind_table(&self, _layout: BindLayoutId) -> Result<BindTableHandle> {
        Ok(BindTableHandle(self.lock()?.create(ObjectKind::BindTable)))
    }

    fn update_bind_table(&self, table: BindTableHandle, _writes: &[BindingWrite]) -> Result<()> {
        let state = self.lock()?;
        if !state.live.contains_key(&table.0) {
            return Err(Error::DeviceError(format!("bind table {} does not exist", table.0)).into());
        }
        Ok(())
    }

    fn free_bind_table(&self, table: BindTableHandle) {
        self.with(|state| state.free(table.0, ObjectKind::BindTable));
    }

    fn create_command_pool(&self, _queue: &QueueInfo) -> Result<CommandPoolHandle> {
        let mut state = self.lock()?;
        let pool = CommandPoolHandle(state.create(ObjectKind::CommandPool));
        state.pools.insert(pool, vec![]);
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<()> {
        let mut state = self.lock()?;
        let buffers = state.pools.get(&pool).cloned().unwrap_or_default();
        for cmd in buffers {
            if let Some(cmd) = state.command_buffers.get_mut(&cmd) {
                cmd.recording = false;
                cmd.commands.clear();
            }
        }
        Ok(())
    }

    fn free_command_pool(&self, pool: CommandPoolHandle) {
        self.with(|state| {
            for cmd in state.pools.remove(&pool).unwrap_or_default() {
                state.command_buffers.remove(&cmd);
                state.free(cmd.0, ObjectKind::CommandBuffer);
            }
            state.free(pool.0, ObjectKind::CommandPool);
        });
    }

    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> Result<CommandBufferHandle> {
        let mut state = self.lock()?;
        let cmd = CommandBufferHandle(state.create(ObjectKind::CommandBuffer));
        state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| Error::DeviceError(format!("command pool {} does not exist", pool.0)))?
            .push(cmd);
        state.command_buffers.insert(
            cmd,
            CommandBufferState {
                recording: false,
                commands: vec![],
            },
        );
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut state = self.lock()?;
        let cmd = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| Error::DeviceError(format!("command buffer {} does not exist", cmd.0)))?;
        cmd.recording = true;
        cmd.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut state = self.lock()?;
        let cmd = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| Error::DeviceError(format!("command buffer {} does not exist", cmd.0)))?;
        if !cmd.recording {
            return Err(Error::DeviceError("command buffer is not recording".to_string()).into());
        }
        cmd.recording = false;
        Ok(())
    }

    fn cmd_pipeline_barrier(&self, cmd: CommandBufferHandle, barriers: &[NativeBarrier]) {
        self.with(|state| match state.command_buffers.get_mut(&cmd) {
            Some(cmd) if cmd.recording => cmd.commands.push(RecordedCommand::Barrier(barriers.to_vec())),
            _ => error!("headless device: barrier recorded outside of a recording command buffer"),
        });
    }

    fn cmd_execute(&self, cmd: CommandBufferHandle, command: &NativeCommand) {
        self.with(|state| match state.command_buffers.get_mut(&cmd) {
            Some(cmd) if cmd.recording => cmd.commands.push(RecordedCommand::Command(command.clone())),
            _ => error!("headless device: command recorded outside of a recording command buffer"),
        });
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle> {
        let mut state = self.lock()?;
        let fence = FenceHandle(state.create(ObjectKind::Fence));
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            match state.fences.get(&fence) {
                Some(true) => return Ok(true),
                Some(false) if state.lost => return Err(Error::DeviceLost.into()),
                Some(false) => {}
                None => return Err(Error::DeviceError(format!("fence {} does not exist", fence.0)).into()),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .signal
                .wait_timeout(state, deadline - now)
                .map_err(|_| Error::PoisonError)?
                .0;
        }
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<bool> {
        let state = self.lock()?;
        state
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| Error::DeviceError(format!("fence {} does not exist", fence.0)).into())
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        self.lock()?.fences.insert(fence, false);
        Ok(())
    }

    fn free_fence(&self, fence: FenceHandle) {
        self.with(|state| {
            state.fences.remove(&fence);
            state.free(fence.0, ObjectKind::Fence)
        });
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<SemaphoreHandle> {
        let mut state = self.lock()?;
        let semaphore = SemaphoreHandle(state.create(ObjectKind::Semaphore));
        state.semaphores.insert(semaphore, initial_value);
        Ok(semaphore)
    }

    fn semaphore_counter_value(&self, semaphore: SemaphoreHandle) -> Result<u64> {
        let state = self.lock()?;
        state
            .semaphores
            .get(&semaphore)
            .copied()
            .ok_or_else(|| Error::DeviceError(format!("semaphore {} does not exist", semaphore.0)).into())
    }

    fn free_semaphore(&self, semaphore: SemaphoreHandle) {
        self.with(|state| {
            state.semaphores.remove(&semaphore);
            state.free(semaphore.0, ObjectKind::Semaphore)
        });
    }

    fn submit(&self, queue: QueueId, info: &SubmitInfo) -> Result<()> {
        let mut state = self.lock()?;
        if state.lost {
            return Err(Error::DeviceLost.into());
        }
        let mut commands = vec![];
        for cmd in &info.command_buffers {
            let recorded = state
                .command_buffers
                .get(cmd)
                .ok_or_else(|| Error::DeviceError(format!("command buffer {} does not exist", cmd.0)))?;
            if recorded.recording {
                return Err(Error::DeviceError("submitted a command buffer that is still recording".to_string()).into());
            }
            commands.extend(recorded.commands.iter().cloned());
        }
        if let Some(fence) = info.fence {
            state.fences.insert(fence, false);
        }
        state.submissions.push(SubmissionRecord {
            queue,
            info: info.clone(),
            commands,
        });
        let index = state.submissions.len() - 1;
        if state.manual {
            state.pending.push_back(index);
        } else {
            state.execute(index);
            drop(state);
            self.signal.notify_all();
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, out: &mut [u32]) -> Result<()> {
        let state = self.lock()?;
        let memory = state
            .host_memory
            .get(&buffer)
            .ok_or_else(|| Error::DeviceError(format!("buffer {} is not host visible", buffer.0)))?;
        let first = (offset / 4) as usize;
        for (i, word) in out.iter_mut().enumerate() {
            *word = memory.get(first + i).copied().unwrap_or_default();
        }
        Ok(())
    }

    fn is_lost(&self) -> bool {
        self.with(|state| state.lost).unwrap_or(true)
    }

    fn wait_idle(&self) -> Result<()> {
        let pending = self.lock()?.pending.len();
        if pending > 0 {
            debug!("headless device: draining {pending} pending submissions on wait_idle");
            self.complete_all();
        }
        Ok(())
    }
}
