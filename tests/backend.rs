use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::executor::block_on;

use render_backend::prelude::*;

mod framework;

/// P0 writes R0 on graphics, P1 reads it on compute, P2 writes it again on graphics.
fn scenario<'cb>(backend: &Backend) -> Result<FrameGraph<'cb>> {
    let mut graph = backend.new_frame();
    let r = graph.create_buffer("R0", framework::storage_buffer(64 * 1024));
    graph.add_pass(
        PassBuilder::graphics("P0")
            .write(r, ResourceState::CopyDest)
            .record(move |cmd| {
                cmd.fill_buffer(r, 0, vk::WHOLE_SIZE, 0)?;
                Ok(())
            })
            .build(),
    )?;
    graph.add_pass(
        PassBuilder::compute("P1")
            .read(r, ResourceState::ShaderResource)
            .record(move |cmd| {
                cmd.dispatch(64, 1, 1)?;
                Ok(())
            })
            .build(),
    )?;
    graph.add_pass(PassBuilder::graphics("P2").write(r, ResourceState::UnorderedAccess).build())?;
    Ok(graph)
}

/// Three passes on the primary queue that record nothing.
fn empty_passes<'cb>(backend: &Backend) -> Result<FrameGraph<'cb>> {
    let mut graph = backend.new_frame();
    let r = graph.create_buffer("r", framework::storage_buffer(4096));
    graph.add_pass(PassBuilder::graphics("P0").write(r, ResourceState::UnorderedAccess).build())?;
    graph.add_pass(PassBuilder::graphics("P1").read(r, ResourceState::ShaderResource).build())?;
    graph.add_pass(PassBuilder::graphics("P2").write(r, ResourceState::UnorderedAccess).build())?;
    Ok(graph)
}

fn error_of(err: &anyhow::Error) -> &Error {
    err.downcast_ref::<Error>().expect("expected a backend error")
}

#[test]
fn three_frames_in_flight() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| builder.frames_in_flight(2).compute_queues(1))?;
    for expected in 0..3 {
        let graph = scenario(&ctx.backend)?;
        let frame = ctx.backend.execute(graph, None)?;
        assert_eq!(frame, expected);

        let compiled = ctx.backend.last_compiled().expect("no compiled frame");
        assert_eq!(compiled.sync.points().iter().filter(|p| p.consumer.index() == 1).count(), 1);
    }
    assert_eq!(ctx.backend.frame_index(), 3);

    // Three segments and the final submission per frame.
    let submissions = ctx.device.submissions();
    assert_eq!(submissions.len(), 12);
    assert!(ctx.device.unsatisfied_waits().is_empty());
    // The primary queue signals two passes and the final submission per frame.
    let last = submissions.last().expect("no submissions");
    assert_eq!(last.queue, PRIMARY_QUEUE);
    assert_eq!(last.info.signals[0].value, 9);
    assert!(last.info.fence.is_some());

    // The compute submission of every frame waits on the primary queue.
    for submission in submissions.iter().filter(|submission| submission.queue != PRIMARY_QUEUE) {
        assert!(!submission.info.waits.is_empty());
    }

    ctx.backend.wait_frame(2)?;
    assert_eq!(ctx.backend.get_latest_finished_frame()?, Some(2));
    Ok(())
}

#[test]
fn barriers_are_recorded_before_passes() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| builder.compute_queues(1))?;
    let graph = scenario(&ctx.backend)?;
    ctx.backend.execute(graph, None)?;

    let submissions = ctx.device.submissions();
    let compute = submissions
        .iter()
        .find(|submission| submission.queue != PRIMARY_QUEUE)
        .expect("no compute submission");
    let barrier = compute
        .commands
        .iter()
        .find_map(|command| match command {
            RecordedCommand::Barrier(barriers) => Some(barriers.clone()),
            _ => None,
        })
        .expect("no barrier before P1");
    assert_eq!(barrier.len(), 1);
    assert!(barrier[0].src_access.is_empty());
    assert_eq!(barrier[0].dst_access, vk::AccessFlags2::SHADER_READ);
    Ok(())
}

#[test]
fn execute_blocks_on_busy_slot() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| builder.frames_in_flight(2))?;
    ctx.device.set_manual_completion(true);

    let graph = empty_passes(&ctx.backend)?;
    ctx.backend.execute(graph, None)?;
    let graph = empty_passes(&ctx.backend)?;
    ctx.backend.execute(graph, None)?;
    assert_eq!(ctx.backend.get_latest_finished_frame()?, None);
    assert_eq!(ctx.device.pending_submissions(), 4);

    let device = ctx.device.clone();
    let start = Instant::now();
    let gpu = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        device.complete_all();
    });
    // Frame 2 runs on the slot of frame 0, which only becomes free once the GPU thread completes it.
    ctx.backend.wait_frame(2)?;
    assert!(start.elapsed() >= Duration::from_millis(40));
    gpu.join().expect("GPU thread panicked");

    assert_eq!(ctx.backend.get_latest_finished_frame()?, Some(1));
    let graph = empty_passes(&ctx.backend)?;
    assert_eq!(ctx.backend.execute(graph, None)?, 2);
    ctx.device.complete_all();
    Ok(())
}

#[test]
fn fence_timeout_is_reported() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| {
        builder.frames_in_flight(1).fence_timeout(Duration::from_millis(10))
    })?;
    ctx.device.set_manual_completion(true);

    let graph = empty_passes(&ctx.backend)?;
    ctx.backend.execute(graph, None)?;
    let graph = empty_passes(&ctx.backend)?;
    let err = ctx.backend.execute(graph, None).unwrap_err();
    assert!(matches!(error_of(&err), Error::FenceTimeout { frame: 0 }));
    assert_eq!(ctx.backend.frame_index(), 1);

    ctx.device.complete_all();
    let graph = empty_passes(&ctx.backend)?;
    assert_eq!(ctx.backend.execute(graph, None)?, 1);
    Ok(())
}

#[test]
fn frame_future_resolves() -> Result<()> {
    let mut ctx = framework::make_context()?;
    ctx.device.set_manual_completion(true);
    let graph = empty_passes(&ctx.backend)?;
    let frame = ctx.backend.execute(graph, None)?;

    let future = ctx.backend.frame_future(frame);
    let device = ctx.device.clone();
    let gpu = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        device.complete_all();
    });
    assert_eq!(block_on(future)?, frame);
    gpu.join().expect("GPU thread panicked");
    Ok(())
}

#[test]
fn device_loss_reports_unreached_markers() -> Result<()> {
    let mut ctx = framework::make_context()?;
    // The device is lost at the fourth marker: P1 starts, but never finishes.
    ctx.device.lose_device_after_fills(3);
    let graph = empty_passes(&ctx.backend)?;
    let err = ctx.backend.execute(graph, None).unwrap_err();
    assert!(matches!(error_of(&err), Error::DeviceLost));

    let missed = ctx.backend.print_error_traces()?;
    assert_eq!(missed, vec!["Pass End: P1", "Pass Begin: P2", "Pass End: P2"]);

    // Nothing can be executed on a lost device.
    let graph = empty_passes(&ctx.backend)?;
    let err = ctx.backend.execute(graph, None).unwrap_err();
    assert!(matches!(error_of(&err), Error::DeviceLost));
    Ok(())
}

#[test]
fn compile_errors_submit_nothing() -> Result<()> {
    let mut ctx = framework::make_context()?;
    let mut graph = ctx.backend.new_frame();
    let r = graph.create_buffer("r", framework::storage_buffer(4096));
    let first = graph.add_pass(PassBuilder::graphics("first").write(r, ResourceState::UnorderedAccess).build())?;
    let second = graph.add_pass(PassBuilder::graphics("second").read(r, ResourceState::ShaderResource).build())?;
    graph.add_dependency(second, first)?;

    let err = ctx.backend.execute(graph, None).unwrap_err();
    assert!(matches!(error_of(&err), Error::GraphHasCycle));
    assert!(ctx.device.submissions().is_empty());
    assert_eq!(ctx.backend.frame_index(), 0);

    let stale = FrameGraph::new(5);
    let err = ctx.backend.execute(stale, None).unwrap_err();
    assert!(matches!(error_of(&err), Error::StaleHandle));
    Ok(())
}

#[test]
fn pooled_resources_are_reused_across_frames() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| builder.frames_in_flight(2))?;
    for _ in 0..4 {
        let graph = empty_passes(&ctx.backend)?;
        ctx.backend.execute(graph, None)?;
    }
    // Frame 0 creates the buffer, and every later frame finds it retired.
    let markers = ctx.backend.settings().frames_in_flight as u64;
    assert_eq!(ctx.device.created_objects(ObjectKind::Buffer), 1 + markers);
    assert_eq!(ctx.backend.pools().buffers.len(), 1);
    Ok(())
}

#[test]
fn garbage_collection_is_clamped() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| builder.frames_in_flight(2))?;
    for _ in 0..4 {
        let graph = empty_passes(&ctx.backend)?;
        ctx.backend.execute(graph, None)?;
    }
    // The pooled buffer was last used in frame 3, which is still within the frames in flight.
    let freed = ctx.backend.collect_garbage(
        100,
        ResourceTags::DEFAULT,
        ResourceTags::INVALID,
        ResourceTags::DEFAULT,
        ResourceTags::INVALID,
    )?;
    assert_eq!(freed, 0);
    assert_eq!(ctx.backend.pools().buffers.len(), 1);

    for _ in 0..3 {
        let graph = ctx.backend.new_frame();
        ctx.backend.execute(graph, None)?;
    }
    let freed = ctx.backend.collect_buffer_garbage(100, ResourceTags::DEFAULT, ResourceTags::INVALID)?;
    assert_eq!(freed, 1);
    assert!(ctx.backend.pools().buffers.is_empty());
    Ok(())
}

#[test]
fn texture_collection_erases_views() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| builder.frames_in_flight(2))?;
    let mut graph = ctx.backend.new_frame();
    let target = graph.create_texture("target", framework::color_target(8, 8));
    graph.add_pass(
        PassBuilder::graphics("draw")
            .write(target, ResourceState::RenderTarget)
            .record(move |cmd| {
                cmd.begin_rendering(&[target], None, None)?;
                cmd.draw(3, 1, 0, 0)?;
                cmd.end_rendering()?;
                Ok(())
            })
            .build(),
    )?;
    ctx.backend.execute(graph, None)?;
    assert_eq!(ctx.backend.pools().textures.len(), 1);
    assert_eq!(ctx.backend.pools().texture_views.len(), 1);

    for _ in 0..3 {
        let graph = ctx.backend.new_frame();
        ctx.backend.execute(graph, None)?;
    }
    let freed = ctx.backend.collect_texture_garbage(100, ResourceTags::DEFAULT, ResourceTags::INVALID)?;
    assert_eq!(freed, 1);
    assert!(ctx.backend.pools().textures.is_empty());
    assert!(ctx.backend.pools().texture_views.is_empty());
    assert_eq!(ctx.device.live_objects(ObjectKind::Texture), 0);
    assert_eq!(ctx.device.live_objects(ObjectKind::TextureView), 0);
    Ok(())
}

#[test]
fn dynamic_resources_survive_collection() -> Result<()> {
    let mut ctx = framework::make_context()?;
    let mut graph = ctx.backend.new_frame();
    let constants = graph.create_buffer_with_tags("constants", framework::storage_buffer(4096), ResourceTags::DYNAMIC);
    graph.add_pass(PassBuilder::graphics("write").write(constants, ResourceState::UnorderedAccess).build())?;
    ctx.backend.execute(graph, None)?;
    for _ in 0..4 {
        let graph = ctx.backend.new_frame();
        ctx.backend.execute(graph, None)?;
    }

    let freed = ctx
        .backend
        .collect_buffer_garbage(100, ResourceTags::DEFAULT, ResourceTags::DYNAMIC)?;
    assert_eq!(freed, 0);
    let freed = ctx
        .backend
        .collect_buffer_garbage(100, ResourceTags::DYNAMIC, ResourceTags::INVALID)?;
    assert_eq!(freed, 1);
    Ok(())
}

#[derive(Default)]
struct CountingProfiler {
    compiles: usize,
    passes: Vec<String>,
    submits: usize,
}

impl Profiler for CountingProfiler {
    fn on_compile_end(&mut self, _frame: &CompiledFrame) {
        self.compiles += 1;
    }

    fn on_pass_begin(&mut self, pass: &str, _queue: QueueId) {
        self.passes.push(pass.to_string());
    }

    fn on_submit_end(&mut self, _segment: &render_backend::phases::sync::Segment) {
        self.submits += 1;
    }
}

#[test]
fn profiler_hooks() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| builder.compute_queues(1))?;
    let mut profiler = CountingProfiler::default();
    let graph = scenario(&ctx.backend)?;
    ctx.backend.execute(graph, Some(&mut profiler))?;
    assert_eq!(profiler.compiles, 1);
    assert_eq!(profiler.passes, vec!["P0", "P1", "P2"]);
    assert_eq!(profiler.submits, 3);
    Ok(())
}

#[test]
fn rendering_uses_pooled_views() -> Result<()> {
    let mut ctx = framework::make_context()?;
    for _ in 0..3 {
        let mut graph = ctx.backend.new_frame();
        let color = graph.create_texture("color", framework::color_target(256, 256));
        let output = graph.create_texture("output", framework::color_target(256, 256));
        graph.add_pass(
            PassBuilder::graphics("draw")
                .write(color, ResourceState::RenderTarget)
                .record(move |cmd| {
                    cmd.begin_rendering(&[color], None, Some([0.0; 4]))?;
                    cmd.draw(3, 1, 0, 0)?;
                    cmd.end_rendering()?;
                    Ok(())
                })
                .build(),
        )?;
        graph.add_pass(
            PassBuilder::graphics("post")
                .read(color, ResourceState::ShaderResource)
                .write(output, ResourceState::RenderTarget)
                .record(move |cmd| {
                    cmd.begin_rendering(&[output], None, None)?;
                    cmd.bind_resources(
                        0,
                        BindLayoutId(1),
                        &[Binding {
                            slot: 0,
                            resource: color,
                            view: BindingView::Whole,
                        }],
                    )?;
                    cmd.draw(3, 1, 0, 0)?;
                    cmd.end_rendering()?;
                    Ok(())
                })
                .build(),
        )?;
        ctx.backend.execute(graph, None)?;
    }
    // One view per texture, reused by every frame.
    assert_eq!(ctx.device.created_objects(ObjectKind::TextureView), 2);
    // Bind tables belong to the executors and are recycled once a slot is reused.
    let executors = ctx.backend.settings().frames_in_flight as u64;
    assert_eq!(ctx.device.created_objects(ObjectKind::BindTable), executors);
    Ok(())
}

#[test]
fn shutdown_destroys_everything() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| builder.compute_queues(1).copy_queues(1))?;
    for _ in 0..3 {
        let graph = scenario(&ctx.backend)?;
        ctx.backend.execute(graph, None)?;
    }
    let device: Arc<HeadlessDevice> = ctx.device.clone();
    ctx.backend.shutdown()?;
    for kind in [
        ObjectKind::Buffer,
        ObjectKind::Texture,
        ObjectKind::TextureView,
        ObjectKind::BufferView,
        ObjectKind::Memory,
        ObjectKind::BindTable,
        ObjectKind::CommandPool,
        ObjectKind::CommandBuffer,
        ObjectKind::Fence,
        ObjectKind::Semaphore,
    ] {
        assert_eq!(device.live_objects(kind), 0, "{kind:?} objects leaked");
    }
    // Shutting down twice, or dropping afterwards, does nothing.
    ctx.backend.shutdown()?;
    Ok(())
}
