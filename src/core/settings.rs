//! Backend configuration.

use std::time::Duration;

use crate::core::queue::{queue_layout, QueueInfo};

/// The default number of frames that can be in flight on the GPU at the same time.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Settings used to create a [`Backend`](crate::Backend).
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Number of frame executors. The CPU can never run more than this many frames ahead of the GPU.
    pub frames_in_flight: usize,
    /// Number of async compute queues. Compute passes fall back to the graphics queue if this is zero.
    pub compute_queues: u32,
    /// Number of dedicated copy queues. Copy passes fall back to the graphics queue if this is zero.
    pub copy_queues: u32,
    /// Whether transient resources with disjoint lifetimes may share memory.
    pub aliasing: bool,
    /// Resources smaller than this are never aliased.
    pub min_alias_size: u64,
    /// Whether passes of a queue may be reordered so that passes sharing resources run back to back.
    /// When disabled, passes keep their declaration order wherever dependencies allow it.
    pub reorder: bool,
    /// How long [`Backend::wait_frame`](crate::Backend::wait_frame) may block before the GPU is considered hung.
    pub fence_timeout: Duration,
    /// Whether crash markers are written into the command stream.
    pub crash_markers: bool,
    /// Number of crash marker slots per frame executor.
    pub marker_capacity: u32,
}

/// The backend builder is a convenience struct to easily create [`BackendSettings`].
///
/// For information about each of the fields, see [`BackendSettings`].
/// # Example
/// ```
/// # use render_backend::prelude::*;
/// let settings = BackendBuilder::new()
///     .frames_in_flight(3)
///     .compute_queues(1)
///     .aliasing(true)
///     .build();
/// ```
pub struct BackendBuilder {
    inner: BackendSettings,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            compute_queues: 0,
            copy_queues: 0,
            aliasing: true,
            min_alias_size: 1024,
            reorder: false,
            fence_timeout: Duration::from_secs(10),
            crash_markers: true,
            marker_capacity: 1024,
        }
    }
}

impl BackendSettings {
    /// The logical queues described by these settings.
    pub fn queues(&self) -> Vec<QueueInfo> {
        queue_layout(self.compute_queues, self.copy_queues)
    }
}

impl BackendBuilder {
    /// Create a new backend builder with default settings.
    pub fn new() -> Self {
        BackendBuilder {
            inner: BackendSettings::default(),
        }
    }

    /// Sets the number of frames in flight. At least one frame is always allowed.
    pub fn frames_in_flight(mut self, count: usize) -> Self {
        self.inner.frames_in_flight = count.max(1);
        self
    }

    pub fn compute_queues(mut self, count: u32) -> Self {
        self.inner.compute_queues = count;
        self
    }

    pub fn copy_queues(mut self, count: u32) -> Self {
        self.inner.copy_queues = count;
        self
    }

    /// Enable or disable memory aliasing of transient resources.
    pub fn aliasing(mut self, enabled: bool) -> Self {
        self.inner.aliasing = enabled;
        self
    }

    pub fn min_alias_size(mut self, size: u64) -> Self {
        self.inner.min_alias_size = size;
        self
    }

    pub fn reorder_passes(mut self, enabled: bool) -> Self {
        self.inner.reorder = enabled;
        self
    }

    pub fn fence_timeout(mut self, timeout: Duration) -> Self {
        self.inner.fence_timeout = timeout;
        self
    }

    /// Enable or disable crash markers, and set the amount of marker slots per frame.
    pub fn crash_markers(mut self, enabled: bool, capacity: u32) -> Self {
        self.inner.crash_markers = enabled;
        self.inner.marker_capacity = capacity.max(1);
        self
    }

    /// Build the resulting backend settings.
    pub fn build(self) -> BackendSettings {
        self.inner
    }
}

impl Default for BackendBuilder {
    fn default() -> Self {
        Self::new()
    }
}
