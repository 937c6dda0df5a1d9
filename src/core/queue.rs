//! Queue descriptions used by the scheduler and the executors.

use std::fmt::{Display, Formatter};

use ash::vk;

/// Abstraction over hardware queue capabilities. Note that the native device may multiplex several
/// logical queues onto the same hardware queue.
#[derive(Copy, Clone, Default, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum QueueType {
    #[default]
    Graphics = vk::QueueFlags::GRAPHICS.as_raw() as isize,
    Compute = vk::QueueFlags::COMPUTE.as_raw() as isize,
    Copy = vk::QueueFlags::TRANSFER.as_raw() as isize,
}

/// Queue preference of a pass.
#[derive(Copy, Clone, Default, Debug, Hash, Eq, PartialEq)]
pub enum QueueAffinity {
    /// No preference, runs on the primary graphics queue.
    #[default]
    Any,
    Graphics,
    /// Prefer an async compute queue.
    Compute,
    /// Prefer a dedicated copy queue.
    Copy,
}

/// Index of a logical queue in the backend queue list.
#[derive(Copy, Clone, Default, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct QueueId(pub u32);

/// The primary graphics queue. It always exists.
pub const PRIMARY_QUEUE: QueueId = QueueId(0);

/// Stores information about one logical queue of the backend.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueInfo {
    /// Index of this queue.
    pub id: QueueId,
    /// Functionality this queue provides.
    pub queue_type: QueueType,
    /// Index of the queue among the queues of the same type.
    pub type_index: u32,
}

impl QueueId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for QueueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue#{}", self.0)
    }
}

impl QueueType {
    /// Capabilities of this queue type.
    pub fn flags(&self) -> vk::QueueFlags {
        vk::QueueFlags::from_raw(*self as u32)
    }
}

impl Display for QueueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueType::Graphics => write!(f, "graphics"),
            QueueType::Compute => write!(f, "compute"),
            QueueType::Copy => write!(f, "copy"),
        }
    }
}

/// Builds the queue list, graphics first, then compute queues, then copy queues.
pub fn queue_layout(compute_queues: u32, copy_queues: u32) -> Vec<QueueInfo> {
    let mut queues = vec![QueueInfo {
        id: PRIMARY_QUEUE,
        queue_type: QueueType::Graphics,
        type_index: 0,
    }];
    for (queue_type, count) in [(QueueType::Compute, compute_queues), (QueueType::Copy, copy_queues)] {
        for type_index in 0..count {
            queues.push(QueueInfo {
                id: QueueId(queues.len() as u32),
                queue_type,
                type_index,
            });
        }
    }
    queues
}
