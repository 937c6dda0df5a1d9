//! Exposes the backend error type

use std::sync::PoisonError;

use thiserror::Error;

/// Error type that the render backend can return.
#[derive(Error, Debug)]
pub enum Error {
    /// The pass dependency graph contains a cycle and is impossible to schedule.
    #[error("Pass graph contains a cycle.")]
    GraphHasCycle,
    /// A dependency cycle spans more than one queue. Submitting this would deadlock the GPU.
    #[error("Cross-queue dependency cycle between passes {passes:?}.")]
    CrossQueueCycle {
        /// Names of the passes taking part in the cycle.
        passes: Vec<String>,
    },
    /// A pass uses the same resource in two different states.
    /// This is impossible to resolve in an unambiguous way.
    #[error("Pass `{pass}` uses resource `{resource}` in conflicting states.")]
    ConflictingAccess {
        /// Name of the offending pass.
        pass: String,
        /// Name of the resource.
        resource: String,
    },
    /// A pass declares an access in a state that cannot serve it, for example a write in a read-only state.
    #[error("Pass `{pass}` accesses resource `{resource}` in invalid state {state}.")]
    InvalidState {
        /// Name of the offending pass.
        pass: String,
        /// Name of the resource.
        resource: String,
        /// The requested state.
        state: String,
    },
    /// A pass recorded a command on a resource it did not declare.
    #[error("Pass `{pass}` records a command on undeclared resource `{resource}`.")]
    UndeclaredAccess {
        /// Name of the offending pass.
        pass: String,
        /// Name of the resource.
        resource: String,
    },
    /// A resource handle does not refer to a resource in this graph.
    #[error("Invalid resource `{0}`.")]
    InvalidResource(String),
    /// A pass handle does not refer to a pass in this graph.
    #[error("Invalid pass index `{0}`.")]
    InvalidPass(usize),
    /// A handle from an older graph or a recycled arena slot was used.
    #[error("Stale handle used.")]
    StaleHandle,
    /// No queue was found that can execute the requested work.
    #[error("No queue found for requested queue type.")]
    NoCapableQueue,
    /// Waiting on a frame fence timed out. This generally means the GPU hung.
    #[error("Timed out waiting for frame {frame} to finish.")]
    FenceTimeout {
        /// Frame index that was waited on.
        frame: u64,
    },
    /// The native device was lost.
    #[error("Device lost.")]
    DeviceLost,
    /// A frame executor was driven out of order.
    #[error("Frame executor is in state {0}, expected {1}.")]
    InvalidExecutorState(&'static str, &'static str),
    /// Error reported by the native device.
    #[error("Device error: `{0}`")]
    DeviceError(String),
    /// Poisoned lock
    #[error("Poisoned lock")]
    PoisonError,
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::PoisonError
    }
}
