//! Hooks for measuring frame execution. Every hook has an empty default implementation, so a profiler only
//! implements the events it is interested in.

use crate::core::queue::QueueId;
use crate::phases::sync::Segment;
use crate::phases::CompiledFrame;

/// Receives events while [`Backend::execute`](crate::Backend::execute) runs.
pub trait Profiler {
    /// Called before the compile phases run.
    fn on_compile_begin(&mut self, _frame_index: u64) {}

    /// Called with the result of the compile phases.
    fn on_compile_end(&mut self, _frame: &CompiledFrame) {}

    /// Called before the commands of a pass are recorded.
    fn on_pass_begin(&mut self, _pass: &str, _queue: QueueId) {}

    /// Called after the commands of a pass are recorded.
    fn on_pass_end(&mut self, _pass: &str, _queue: QueueId) {}

    /// Called before a segment is submitted.
    fn on_submit_begin(&mut self, _segment: &Segment) {}

    /// Called after a segment is submitted.
    fn on_submit_end(&mut self, _segment: &Segment) {}
}
