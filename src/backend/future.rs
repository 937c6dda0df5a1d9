use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;

use crate::core::error::Error;
use crate::device::{Device, FenceHandle};

/// Resolves to the frame index once the GPU finished that frame.
/// Obtained through [`Backend::frame_future`](crate::Backend::frame_future).
/// # Example
/// ```
/// # use std::sync::Arc;
/// # use render_backend::prelude::*;
/// use futures::executor::block_on;
///
/// let mut backend = Backend::new(Arc::new(HeadlessDevice::new()), BackendSettings::default())?;
/// let frame = backend.execute(backend.new_frame(), None)?;
/// assert_eq!(block_on(backend.frame_future(frame))?, frame);
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Derivative)]
#[derivative(Debug)]
pub struct FrameFuture {
    #[derivative(Debug = "ignore")]
    device: Arc<dyn Device>,
    fence: FenceHandle,
    frame: u64,
    slot_frame: Arc<AtomicU64>,
}

impl FrameFuture {
    pub(crate) fn new(device: Arc<dyn Device>, fence: FenceHandle, frame: u64, slot_frame: Arc<AtomicU64>) -> Self {
        Self {
            device,
            fence,
            frame,
            slot_frame,
        }
    }

    fn is_finished(&self) -> Result<bool> {
        // Once the slot moved on to a later frame, this frame finished before it was reset.
        let current = self.slot_frame.load(Ordering::Acquire);
        if current > self.frame {
            return Ok(true);
        }
        self.device.fence_status(self.fence)
    }
}

// Note that the future implementation works by periodically polling the fence.
impl std::future::Future for FrameFuture {
    type Output = Result<u64>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.device.is_lost() {
            return Poll::Ready(Err(Error::DeviceLost.into()));
        }
        match self.is_finished() {
            Ok(true) => Poll::Ready(Ok(self.frame)),
            Ok(false) => {
                let waker = ctx.waker().clone();
                std::thread::spawn(move || {
                    // We will try to poll every millisecond.
                    std::thread::sleep(Duration::from_millis(1));
                    waker.wake();
                });
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}
