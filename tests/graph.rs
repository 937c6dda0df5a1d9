use anyhow::Result;

use render_backend::prelude::*;
use render_backend::phases::lifetime::Lifetime;
use render_backend::phases::sync;

mod framework;

/// P0 writes R on graphics, P1 reads it on compute, P2 writes it again on graphics.
fn cross_queue_graph<'cb>() -> Result<(FrameGraph<'cb>, ResourceId, [PassId; 3])> {
    let mut graph = FrameGraph::new(0);
    let r = graph.create_buffer("R0", framework::storage_buffer(64 * 1024));
    let p0 = graph.add_pass(PassBuilder::graphics("P0").write(r, ResourceState::UnorderedAccess).build())?;
    let p1 = graph.add_pass(PassBuilder::compute("P1").read(r, ResourceState::ShaderResource).build())?;
    let p2 = graph.add_pass(PassBuilder::graphics("P2").write(r, ResourceState::UnorderedAccess).build())?;
    Ok((graph, r, [p0, p1, p2]))
}

fn error_of(err: &anyhow::Error) -> &Error {
    err.downcast_ref::<Error>().expect("expected a backend error")
}

#[test]
fn dependency_edges_follow_hazards() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let r = graph.create_buffer("r", framework::storage_buffer(4096));
    let p0 = graph.add_pass(PassBuilder::compute("write").write(r, ResourceState::UnorderedAccess).build())?;
    let p1 = graph.add_pass(PassBuilder::compute("read a").read(r, ResourceState::ShaderResource).build())?;
    let p2 = graph.add_pass(PassBuilder::compute("read b").read(r, ResourceState::ShaderResource).build())?;
    let p3 = graph.add_pass(PassBuilder::compute("overwrite").write(r, ResourceState::UnorderedAccess).build())?;

    let compiled = framework::compile(&graph, 0, 0)?;
    let deps = &compiled.dependencies;
    assert!(deps.edge(p0, p1).is_some());
    assert!(deps.edge(p0, p2).is_some());
    // Reads in the same state do not depend on each other.
    assert!(deps.edge(p1, p2).is_none());
    assert!(deps.edge(p2, p1).is_none());
    assert!(deps.edge(p1, p3).is_some());
    assert!(deps.edge(p2, p3).is_some());
    assert_eq!(deps.edge(p1, p3).map(|edge| edge.resources.clone()), Some(vec![r]));
    assert_eq!(compiled.schedule.order(), &[p0, p1, p2, p3]);
    Ok(())
}

#[test]
fn queue_assignment() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let data = graph.create_buffer("data", framework::storage_buffer(4096));
    let vertices = graph.create_buffer("vertices", framework::storage_buffer(4096));
    let upload = graph.add_pass(PassBuilder::copy("upload").write(data, ResourceState::CopyDest).build())?;
    let simulate = graph.add_pass(PassBuilder::compute("simulate").read_write(data, ResourceState::UnorderedAccess).build())?;
    // Vertex buffer access is not possible on a compute queue.
    let skin = graph.add_pass(
        PassBuilder::compute("skin")
            .read(vertices, ResourceState::VertexBuffer)
            .build(),
    )?;
    let any = graph.add_pass(PassBuilder::new("any").read(data, ResourceState::ShaderResource).build())?;

    let compiled = framework::compile(&graph, 1, 1)?;
    let schedule = &compiled.schedule;
    assert_eq!(schedule.queue_type_of(upload), QueueType::Copy);
    assert_eq!(schedule.queue_type_of(simulate), QueueType::Compute);
    assert_eq!(schedule.queue_of(skin), PRIMARY_QUEUE);
    assert_eq!(schedule.queue_of(any), PRIMARY_QUEUE);

    // Without async queues, everything runs on the primary queue.
    let compiled = framework::compile(&graph, 0, 0)?;
    assert!(graph.pass_ids().all(|pass| compiled.schedule.queue_of(pass) == PRIMARY_QUEUE));
    assert!(compiled.sync.is_empty());
    Ok(())
}

#[test]
fn cross_queue_sync_and_barriers() -> Result<()> {
    framework::init_logger();
    let (graph, r, [p0, p1, p2]) = cross_queue_graph()?;
    let compiled = framework::compile(&graph, 1, 0)?;

    assert_eq!(compiled.schedule.queue_type_of(p0), QueueType::Graphics);
    assert_eq!(compiled.schedule.queue_type_of(p1), QueueType::Compute);
    assert_eq!(compiled.schedule.queue_type_of(p2), QueueType::Graphics);

    // Exactly one sync point orders P0 before P1, and one orders P1 before P2.
    let points = compiled.sync.points();
    assert_eq!(points.iter().filter(|point| point.producer == p0 && point.consumer == p1).count(), 1);
    assert_eq!(points.len(), 2);
    let point = compiled.sync.enforced_by(p0, p1).expect("P0 -> P1 is not synchronized");
    assert_eq!(point.source, PRIMARY_QUEUE);
    assert_eq!(point.value, 1);
    assert!(compiled.sync.enforced_by(p1, p2).is_some());
    assert!(compiled
        .sync
        .find_unsynchronized(&compiled.dependencies, &compiled.schedule)
        .is_empty());

    let before_p1 = compiled.barriers.before_pass(p1);
    assert_eq!(before_p1.len(), 1);
    assert_eq!(before_p1[0].resource, r);
    assert_eq!(before_p1[0].before, ResourceState::UnorderedAccess);
    assert_eq!(before_p1[0].after, ResourceState::ShaderResource);
    assert!(before_p1[0].cross_queue);

    let before_p2 = compiled.barriers.before_pass(p2);
    assert_eq!(before_p2.len(), 1);
    assert_eq!(before_p2[0].before, ResourceState::ShaderResource);
    assert_eq!(before_p2[0].after, ResourceState::UnorderedAccess);

    // First use of a transient resource discards its contents.
    let before_p0 = compiled.barriers.before_pass(p0);
    assert_eq!(before_p0[0].before, ResourceState::Undefined);
    Ok(())
}

#[test]
fn removed_sync_point_is_detected() -> Result<()> {
    framework::init_logger();
    let (graph, _, [p0, p1, p2]) = cross_queue_graph()?;
    let compiled = framework::compile(&graph, 1, 0)?;
    let edges = sync::cross_queue_edges(&compiled.dependencies, &compiled.schedule);
    assert_eq!(edges, vec![(p0, p1), (p1, p2)]);

    for index in 0..compiled.sync.len() {
        let removed = compiled.sync.points()[index];
        let broken = compiled.sync.without_point(index);
        let races = broken.find_unsynchronized(&compiled.dependencies, &compiled.schedule);
        assert_eq!(races, vec![(removed.producer, removed.consumer)]);
    }
    Ok(())
}

#[test]
fn redundant_waits_are_elided() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let a = graph.create_buffer("a", framework::storage_buffer(4096));
    let b = graph.create_buffer("b", framework::storage_buffer(4096));
    let produce_a = graph.add_pass(PassBuilder::compute("produce a").write(a, ResourceState::UnorderedAccess).build())?;
    let produce_b = graph.add_pass(PassBuilder::compute("produce b").write(b, ResourceState::UnorderedAccess).build())?;
    let consume_b = graph.add_pass(PassBuilder::graphics("consume b").read(b, ResourceState::ShaderResource).build())?;
    let consume_a = graph.add_pass(PassBuilder::graphics("consume a").read(a, ResourceState::ShaderResource).build())?;

    let compiled = framework::compile(&graph, 1, 0)?;
    // Waiting for `produce b` also covers `produce a`, which ran earlier on the same queue.
    assert_eq!(compiled.sync.len(), 1);
    let point = compiled.sync.enforced_by(produce_b, consume_b).expect("missing sync point");
    assert_eq!(compiled.sync.enforced_by(produce_a, consume_a), Some(point));
    assert!(compiled
        .sync
        .find_unsynchronized(&compiled.dependencies, &compiled.schedule)
        .is_empty());
    Ok(())
}

#[test]
fn segments_split_at_sync_points() -> Result<()> {
    framework::init_logger();
    let (graph, _, [p0, p1, p2]) = cross_queue_graph()?;
    let compiled = framework::compile(&graph, 1, 0)?;
    let segments = compiled.sync.segments(&compiled.schedule);
    assert_eq!(segments.len(), 3);
    assert_eq!(segments[0].passes, vec![p0]);
    assert_eq!(segments[1].passes, vec![p1]);
    assert_eq!(segments[1].waits.len(), 1);
    assert_eq!(segments[2].passes, vec![p2]);
    assert_eq!(segments[2].signal, 2);
    Ok(())
}

#[test]
fn cycles_are_rejected() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let r = graph.create_buffer("r", framework::storage_buffer(4096));
    let first = graph.add_pass(PassBuilder::graphics("first").write(r, ResourceState::UnorderedAccess).build())?;
    let second = graph.add_pass(PassBuilder::graphics("second").read(r, ResourceState::ShaderResource).build())?;
    graph.add_dependency(second, first)?;
    let err = framework::compile(&graph, 0, 0).unwrap_err();
    assert!(matches!(error_of(&err), Error::GraphHasCycle));

    let mut graph = FrameGraph::new(0);
    let r = graph.create_buffer("r", framework::storage_buffer(4096));
    let first = graph.add_pass(PassBuilder::graphics("first").write(r, ResourceState::UnorderedAccess).build())?;
    let second = graph.add_pass(PassBuilder::compute("second").read(r, ResourceState::ShaderResource).build())?;
    graph.add_dependency(second, first)?;
    let err = framework::compile(&graph, 1, 0).unwrap_err();
    match error_of(&err) {
        Error::CrossQueueCycle {
            passes,
        } => {
            assert!(passes.contains(&"first".to_string()));
            assert!(passes.contains(&"second".to_string()));
        }
        other => panic!("expected a cross-queue cycle, got {other}"),
    }
    Ok(())
}

#[test]
fn invalid_accesses_are_rejected() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let r = graph.create_buffer("r", framework::storage_buffer(4096));
    graph.add_pass(
        PassBuilder::compute("conflict")
            .read(r, ResourceState::ShaderResource)
            .write(r, ResourceState::UnorderedAccess)
            .build(),
    )?;
    let err = framework::compile(&graph, 0, 0).unwrap_err();
    assert!(matches!(error_of(&err), Error::ConflictingAccess { .. }));

    let mut graph = FrameGraph::new(0);
    let r = graph.create_buffer("r", framework::storage_buffer(4096));
    graph.add_pass(PassBuilder::compute("bad write").write(r, ResourceState::ShaderResource).build())?;
    let err = framework::compile(&graph, 0, 0).unwrap_err();
    assert!(matches!(error_of(&err), Error::InvalidState { .. }));
    Ok(())
}

#[test]
fn stale_handles_are_rejected() -> Result<()> {
    framework::init_logger();
    let mut old = FrameGraph::new(0);
    let r = old.create_buffer("r", framework::storage_buffer(4096));

    let mut graph = FrameGraph::new(1);
    let err = graph
        .add_pass(PassBuilder::compute("uses old").read(r, ResourceState::ShaderResource).build())
        .unwrap_err();
    assert!(matches!(error_of(&err), Error::StaleHandle));
    assert!(graph.resource(r).is_err());
    Ok(())
}

#[test]
fn imported_resources_reach_final_state() -> Result<()> {
    framework::init_logger();
    let desc = framework::color_target(800, 600);
    let mut graph = FrameGraph::new(0);
    let swapchain = graph.import_texture(
        "swapchain",
        TextureHandle(1000),
        desc,
        ResourceState::Undefined,
        Some(ResourceState::Present),
    );
    let history = graph.import_texture("history", TextureHandle(1001), desc, ResourceState::ShaderResource, None);
    let draw = graph.add_pass(
        PassBuilder::graphics("draw")
            .write(swapchain, ResourceState::RenderTarget)
            .read(history, ResourceState::ShaderResource)
            .build(),
    )?;

    let compiled = framework::compile(&graph, 0, 0)?;
    // The history texture is already in the right state.
    let barriers = compiled.barriers.before_pass(draw);
    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].resource, swapchain);

    let epilogue = compiled.barriers.epilogue();
    assert_eq!(epilogue.len(), 1);
    assert_eq!(epilogue[0].kind, BarrierKind::Final);
    assert_eq!(epilogue[0].before, ResourceState::RenderTarget);
    assert_eq!(epilogue[0].after, ResourceState::Present);
    assert_eq!(compiled.barriers.final_state(swapchain), ResourceState::Present);
    assert_eq!(compiled.barriers.final_state(history), ResourceState::ShaderResource);

    // Imported resources never alias.
    assert!(!compiled.aliasing.is_aliased(swapchain));
    Ok(())
}

#[test]
fn lifetimes_span_first_to_last_use() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let a = graph.create_buffer("a", framework::storage_buffer(4096));
    let b = graph.create_buffer("b", framework::storage_buffer(4096));
    let unused = graph.create_buffer("unused", framework::storage_buffer(4096));
    graph.add_pass(PassBuilder::compute("0").write(a, ResourceState::UnorderedAccess).build())?;
    graph.add_pass(PassBuilder::compute("1").write(b, ResourceState::UnorderedAccess).build())?;
    graph.add_pass(PassBuilder::compute("2").read(a, ResourceState::ShaderResource).build())?;

    let compiled = framework::compile(&graph, 0, 0)?;
    assert_eq!(compiled.lifetimes.get(a).map(|l| l.lifetime), Some(Lifetime::new(0, 2)));
    assert_eq!(compiled.lifetimes.get(b).map(|l| l.lifetime), Some(Lifetime::new(1, 1)));
    assert!(compiled.lifetimes.get(unused).is_none());
    Ok(())
}

#[test]
fn graphviz_export() -> Result<()> {
    framework::init_logger();
    let (graph, _, _) = cross_queue_graph()?;
    let compiled = framework::compile(&graph, 1, 0)?;
    let dot = compiled.dot()?;
    assert!(dot.contains("P0"));
    assert!(dot.contains("P1"));
    assert!(dot.contains("color=red"));
    Ok(())
}

#[test]
fn transitions_are_ordered_before_readers_on_other_queues() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let r = graph.create_texture("R", framework::color_target(64, 64));
    let p0 = graph.add_pass(PassBuilder::graphics("P0").write(r, ResourceState::RenderTarget).build())?;
    let p1 = graph.add_pass(PassBuilder::compute("P1").read(r, ResourceState::ShaderResource).build())?;
    let p2 = graph.add_pass(PassBuilder::graphics("P2").read(r, ResourceState::ShaderResource).build())?;

    let compiled = framework::compile(&graph, 1, 0)?;
    assert_eq!(compiled.schedule.queue_type_of(p1), QueueType::Compute);

    // The layout transition is recorded once, on the compute queue.
    let before_p1 = compiled.barriers.before_pass(p1);
    assert_eq!(before_p1.len(), 1);
    assert_eq!(before_p1[0].before, ResourceState::RenderTarget);
    assert_eq!(before_p1[0].after, ResourceState::ShaderResource);
    assert!(compiled.barriers.before_pass(p2).is_empty());

    // So P2 has to wait for P1, even though two reads do not conflict.
    assert!(compiled.dependencies.edge(p1, p2).is_some());
    assert!(compiled.sync.waits_of(p2).any(|point| point.producer == p1));
    assert!(compiled.sync.enforced_by(p0, p1).is_some());
    assert!(compiled
        .sync
        .find_unsynchronized(&compiled.dependencies, &compiled.schedule)
        .is_empty());
    Ok(())
}

#[test]
fn untouched_imports_need_no_reader_order() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let history = graph.import_texture(
        "history",
        TextureHandle(7),
        framework::color_target(64, 64),
        ResourceState::ShaderResource,
        None,
    );
    let p0 = graph.add_pass(PassBuilder::compute("P0").read(history, ResourceState::ShaderResource).build())?;
    let p1 = graph.add_pass(PassBuilder::graphics("P1").read(history, ResourceState::ShaderResource).build())?;

    let compiled = framework::compile(&graph, 1, 0)?;
    assert!(compiled.barriers.before_pass(p0).is_empty());
    assert!(compiled.dependencies.edge(p0, p1).is_none());
    assert!(compiled.sync.is_empty());
    Ok(())
}

#[test]
fn waits_covered_through_another_queue_are_elided() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let a = graph.create_buffer("a", framework::storage_buffer(4096));
    let b = graph.create_buffer("b", framework::storage_buffer(4096));
    let upload = graph.add_pass(PassBuilder::copy("upload").write(a, ResourceState::CopyDest).build())?;
    let simulate = graph.add_pass(
        PassBuilder::compute("simulate")
            .read(a, ResourceState::ShaderResource)
            .write(b, ResourceState::UnorderedAccess)
            .build(),
    )?;
    let draw = graph.add_pass(
        PassBuilder::graphics("draw")
            .read(a, ResourceState::ShaderResource)
            .read(b, ResourceState::ShaderResource)
            .build(),
    )?;

    let compiled = framework::compile(&graph, 1, 1)?;
    assert_eq!(compiled.schedule.queue_type_of(upload), QueueType::Copy);
    assert_eq!(compiled.schedule.queue_type_of(simulate), QueueType::Compute);
    assert_eq!(compiled.schedule.queue_type_of(draw), QueueType::Graphics);
    assert!(compiled.dependencies.edge(upload, draw).is_some());

    // `simulate` already waited for `upload`, so waiting for `simulate` covers both.
    assert_eq!(compiled.sync.len(), 2);
    let waits = compiled.sync.waits_of(draw).collect::<Vec<_>>();
    assert_eq!(waits.len(), 1);
    assert_eq!(waits[0].producer, simulate);
    assert_eq!(compiled.sync.enforced_by(upload, draw), compiled.sync.enforced_by(simulate, draw));
    assert!(compiled
        .sync
        .find_unsynchronized(&compiled.dependencies, &compiled.schedule)
        .is_empty());
    Ok(())
}

/// `x` is written and read by passes 0 and 2, `y` by passes 1 and 3.
fn interleaved_graph<'cb>() -> Result<(FrameGraph<'cb>, [ResourceId; 2], [PassId; 4])> {
    let mut graph = FrameGraph::new(0);
    let x = graph.create_buffer("x", framework::storage_buffer(4096));
    let y = graph.create_buffer("y", framework::storage_buffer(4096));
    let write_x = graph.add_pass(PassBuilder::compute("write x").write(x, ResourceState::UnorderedAccess).build())?;
    let write_y = graph.add_pass(PassBuilder::compute("write y").write(y, ResourceState::UnorderedAccess).build())?;
    let read_x = graph.add_pass(PassBuilder::compute("read x").read(x, ResourceState::ShaderResource).build())?;
    let read_y = graph.add_pass(PassBuilder::compute("read y").read(y, ResourceState::ShaderResource).build())?;
    Ok((graph, [x, y], [write_x, write_y, read_x, read_y]))
}

#[test]
fn reordering_pulls_resource_users_together() -> Result<()> {
    let (graph, [x, y], [write_x, write_y, read_x, read_y]) = interleaved_graph()?;

    // Declaration order by default.
    let compiled = framework::compile(&graph, 0, 0)?;
    assert_eq!(compiled.schedule.order(), &[write_x, write_y, read_x, read_y]);
    assert!(!compiled.aliasing.shares_memory(x, y));

    let ctx = framework::make_context_with_settings(|builder| builder.reorder_passes(true))?;
    let compiled = ctx.backend.compile(&graph)?;
    assert_eq!(compiled.schedule.order(), &[write_x, read_x, write_y, read_y]);
    assert_eq!(compiled.lifetimes.get(x).map(|l| l.lifetime), Some(Lifetime::new(0, 1)));
    assert_eq!(compiled.lifetimes.get(y).map(|l| l.lifetime), Some(Lifetime::new(2, 3)));
    assert!(compiled.aliasing.shares_memory(x, y));
    Ok(())
}

#[test]
fn reordering_respects_dependencies() -> Result<()> {
    let (mut graph, _, [write_x, write_y, read_x, read_y]) = interleaved_graph()?;
    graph.add_dependency(write_y, read_x)?;

    let ctx = framework::make_context_with_settings(|builder| builder.reorder_passes(true))?;
    let compiled = ctx.backend.compile(&graph)?;
    // `read x` may not jump over `write y`, but `read y` can still move up behind it.
    assert_eq!(compiled.schedule.order(), &[write_x, write_y, read_y, read_x]);
    Ok(())
}

#[test]
fn dependency_levels_and_critical_path() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let r = graph.create_buffer("r", framework::storage_buffer(4096));
    let other = graph.create_buffer("other", framework::storage_buffer(4096));
    let p0 = graph.add_pass(PassBuilder::compute("write").write(r, ResourceState::UnorderedAccess).build())?;
    let p1 = graph.add_pass(PassBuilder::compute("read a").read(r, ResourceState::ShaderResource).build())?;
    let p2 = graph.add_pass(PassBuilder::compute("read b").read(r, ResourceState::ShaderResource).build())?;
    let p3 = graph.add_pass(PassBuilder::compute("overwrite").write(r, ResourceState::UnorderedAccess).build())?;
    let lone = graph.add_pass(PassBuilder::compute("lone").write(other, ResourceState::UnorderedAccess).build())?;

    let compiled = framework::compile(&graph, 0, 0)?;
    let topology = compiled.dependencies.topology(compiled.schedule.order());
    assert_eq!(topology.levels, vec![vec![p0, lone], vec![p1, p2], vec![p3]]);
    assert_eq!(topology.critical_path, vec![p0, p1, p3]);
    Ok(())
}

#[test]
fn writes_in_the_same_state_get_a_hazard_barrier() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let r = graph.create_buffer("r", framework::storage_buffer(4096));
    graph.add_pass(PassBuilder::compute("first").write(r, ResourceState::UnorderedAccess).build())?;
    let second = graph.add_pass(PassBuilder::compute("second").write(r, ResourceState::UnorderedAccess).build())?;

    let compiled = framework::compile(&graph, 0, 0)?;
    let barriers = compiled.barriers.before_pass(second);
    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].kind, BarrierKind::Hazard);
    assert_eq!(barriers[0].before, ResourceState::UnorderedAccess);
    assert_eq!(barriers[0].after, ResourceState::UnorderedAccess);
    assert!(!barriers[0].cross_queue);
    Ok(())
}

#[test]
fn recording_undeclared_resources_fails() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let declared = graph.create_buffer("declared", framework::storage_buffer(4096));
    let other = graph.create_buffer("other", framework::storage_buffer(4096));
    graph.add_pass(
        PassBuilder::copy("clear")
            .write(declared, ResourceState::CopyDest)
            .record(move |cmd| {
                cmd.fill_buffer(declared, 0, vk::WHOLE_SIZE, 0)?;
                cmd.fill_buffer(other, 0, vk::WHOLE_SIZE, 0)?;
                Ok(())
            })
            .build(),
    )?;
    let err = graph.record().unwrap_err();
    match error_of(&err) {
        Error::UndeclaredAccess {
            pass,
            ..
        } => assert_eq!(pass, "clear"),
        other => panic!("expected an undeclared access, got {other}"),
    }
    Ok(())
}
