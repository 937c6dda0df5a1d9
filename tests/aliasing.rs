use anyhow::Result;

use render_backend::device::MemoryRequirements;
use render_backend::phases::aliasing::{AliasGroup, AliasMember};
use render_backend::phases::lifetime::Lifetime;
use render_backend::prelude::*;

mod framework;

const SIZE: u64 = 64 * 1024;

/// Six passes on one queue. `a` lives in [0, 2], `c` in [1, 4] and `b` in [3, 5].
fn overlapping_graph<'cb>() -> Result<(FrameGraph<'cb>, [ResourceId; 3])> {
    let mut graph = FrameGraph::new(0);
    let a = graph.create_buffer("R_a", framework::storage_buffer(SIZE));
    let b = graph.create_buffer("R_b", framework::storage_buffer(SIZE));
    let c = graph.create_buffer("R_c", framework::storage_buffer(SIZE));
    let write = ResourceState::UnorderedAccess;
    let read = ResourceState::ShaderResource;
    graph.add_pass(PassBuilder::compute("write a").write(a, write).build())?;
    graph.add_pass(PassBuilder::compute("write c").write(c, write).build())?;
    graph.add_pass(PassBuilder::compute("read a").read(a, read).build())?;
    graph.add_pass(PassBuilder::compute("write b").write(b, write).build())?;
    graph.add_pass(PassBuilder::compute("read c").read(c, read).build())?;
    graph.add_pass(PassBuilder::compute("read b").read(b, read).build())?;
    Ok((graph, [a, b, c]))
}

#[test]
fn disjoint_lifetimes_share_memory() -> Result<()> {
    framework::init_logger();
    let (graph, [a, b, c]) = overlapping_graph()?;
    let compiled = framework::compile(&graph, 0, 0)?;

    assert_eq!(compiled.lifetimes.get(a).map(|l| l.lifetime), Some(Lifetime::new(0, 2)));
    assert_eq!(compiled.lifetimes.get(b).map(|l| l.lifetime), Some(Lifetime::new(3, 5)));
    assert_eq!(compiled.lifetimes.get(c).map(|l| l.lifetime), Some(Lifetime::new(1, 4)));

    let aliasing = &compiled.aliasing;
    assert!(aliasing.shares_memory(a, b));
    assert!(!aliasing.shares_memory(a, c));
    assert!(!aliasing.shares_memory(b, c));
    assert_eq!(aliasing.previous_member(b), Some(a));
    assert_eq!(aliasing.stats.candidates, 3);
    assert_eq!(aliasing.stats.groups, 2);
    assert!(aliasing.stats.bytes_after < aliasing.stats.bytes_before);

    // The first use of `b` must make the writes through `a` visible before reusing the memory.
    let write_b = graph.pass_ids().nth(3).expect("missing pass");
    let barriers = compiled.barriers.before_pass(write_b);
    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].kind, BarrierKind::Aliasing);
    assert_eq!(barriers[0].before, ResourceState::Undefined);
    Ok(())
}

#[test]
fn no_group_members_overlap() -> Result<()> {
    framework::init_logger();
    let (graph, _) = overlapping_graph()?;
    let compiled = framework::compile(&graph, 0, 0)?;
    for group in &compiled.aliasing.groups {
        for (i, first) in group.members.iter().enumerate() {
            for second in &group.members[i + 1..] {
                assert!(!first.lifetime.overlaps(&second.lifetime));
            }
        }
    }
    Ok(())
}

#[test]
fn aliasing_can_be_disabled() -> Result<()> {
    framework::init_logger();
    let (graph, [a, b, _]) = overlapping_graph()?;
    let ctx = framework::make_context_with_settings(|builder| builder.aliasing(false))?;
    let compiled = ctx.backend.compile(&graph)?;
    assert!(!compiled.aliasing.shares_memory(a, b));
    assert!(compiled.aliasing.groups.is_empty());
    Ok(())
}

#[test]
fn small_resources_are_not_aliased() -> Result<()> {
    framework::init_logger();
    let mut graph = FrameGraph::new(0);
    let a = graph.create_buffer("a", framework::storage_buffer(256));
    let b = graph.create_buffer("b", framework::storage_buffer(256));
    graph.add_pass(PassBuilder::compute("a").write(a, ResourceState::UnorderedAccess).build())?;
    graph.add_pass(PassBuilder::compute("b").write(b, ResourceState::UnorderedAccess).build())?;
    let compiled = framework::compile(&graph, 0, 0)?;
    assert_eq!(compiled.aliasing.stats.candidates, 0);
    assert!(!compiled.aliasing.shares_memory(a, b));
    Ok(())
}

#[test]
fn unordered_queues_do_not_share_memory() -> Result<()> {
    framework::init_logger();
    let build = |ordered: bool| -> Result<(FrameGraph<'static>, ResourceId, ResourceId)> {
        let mut graph = FrameGraph::new(0);
        let a = graph.create_buffer("a", framework::storage_buffer(SIZE));
        let b = graph.create_buffer("b", framework::storage_buffer(SIZE));
        graph.add_pass(PassBuilder::compute("write a").write(a, ResourceState::UnorderedAccess).build())?;
        let read_a = graph.add_pass(PassBuilder::compute("read a").read(a, ResourceState::ShaderResource).build())?;
        let write_b = graph.add_pass(PassBuilder::graphics("write b").write(b, ResourceState::UnorderedAccess).build())?;
        graph.add_pass(PassBuilder::graphics("read b").read(b, ResourceState::ShaderResource).build())?;
        if ordered {
            graph.add_dependency(read_a, write_b)?;
        }
        Ok((graph, a, b))
    };

    // Both lifetimes are disjoint in the global order, but nothing orders the compute queue before the
    // graphics queue.
    let (graph, a, b) = build(false)?;
    let compiled = framework::compile(&graph, 1, 0)?;
    assert!(!compiled.lifetimes.get(a).unwrap().lifetime.overlaps(&compiled.lifetimes.get(b).unwrap().lifetime));
    assert!(!compiled.aliasing.shares_memory(a, b));

    let (graph, a, b) = build(true)?;
    let compiled = framework::compile(&graph, 1, 0)?;
    assert!(compiled.aliasing.shares_memory(a, b));
    Ok(())
}

#[test]
fn aliased_resources_are_placed_on_one_block() -> Result<()> {
    let mut ctx = framework::make_context()?;
    let (graph, _) = overlapping_graph()?;
    ctx.backend.execute(graph, None)?;

    assert_eq!(ctx.device.created_objects(ObjectKind::Memory), 1);
    // R_a and R_b are placed on the memory block, R_c comes from the buffer pool.
    assert_eq!(ctx.device.created_objects(ObjectKind::Buffer) as usize, 3 + crash_marker_buffers(&ctx));
    assert_eq!(ctx.backend.pools().buffers.len(), 1);
    assert_eq!(ctx.backend.pools().memory.len(), 1);
    Ok(())
}

#[test]
fn retired_alias_memory_is_collected() -> Result<()> {
    let mut ctx = framework::make_context_with_settings(|builder| builder.frames_in_flight(2))?;
    let (graph, _) = overlapping_graph()?;
    ctx.backend.execute(graph, None)?;
    for _ in 0..2 {
        let graph = ctx.backend.new_frame();
        ctx.backend.execute(graph, None)?;
    }

    // Frame 2 reused the executor of frame 0, which destroyed the resources placed on the block.
    let freed = ctx.backend.collect_garbage(
        100,
        ResourceTags::DEFAULT,
        ResourceTags::INVALID,
        ResourceTags::DEFAULT,
        ResourceTags::INVALID,
    )?;
    // The memory block and the pooled buffer of R_c.
    assert_eq!(freed, 2);
    assert_eq!(ctx.device.live_objects(ObjectKind::Memory), 0);
    assert!(ctx.device.memory_freed_while_bound().is_empty());
    assert_eq!(ctx.device.live_objects(ObjectKind::Buffer), crash_marker_buffers(&ctx));
    Ok(())
}

fn crash_marker_buffers(ctx: &framework::Context) -> usize {
    if ctx.backend.settings().crash_markers {
        ctx.backend.settings().frames_in_flight
    } else {
        0
    }
}

#[test]
#[should_panic]
fn overlapping_insert_panics() {
    let requirements = MemoryRequirements {
        size: SIZE,
        alignment: 256,
    };
    let mut graph = FrameGraph::new(0);
    let a = graph.create_buffer("a", framework::storage_buffer(SIZE));
    let b = graph.create_buffer("b", framework::storage_buffer(SIZE));
    let mut group = AliasGroup::new(MemoryKind::Buffers, requirements);
    group.insert(AliasMember {
        resource: a,
        lifetime: Lifetime::new(0, 2),
    });
    group.insert(AliasMember {
        resource: b,
        lifetime: Lifetime::new(2, 4),
    });
}
