use std::sync::Arc;

use anyhow::Result;

use render_backend::prelude::*;
use render_backend::resource::bind_table::BindTablePool;
use render_backend::resource::pool::{BufferPool, TexturePool};
use render_backend::resource::view::TextureViewPool;

mod framework;

fn mark(frame: u64) -> AllocationMark {
    AllocationMark::new(frame, ResourceTags::DEFAULT)
}

#[test]
fn reuse_retired_buffer() -> Result<()> {
    framework::init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let pool = BufferPool::new(device.clone());
    let desc = framework::storage_buffer(4096);

    let (buffer, state) = pool.allocate(&desc, mark(0), None)?;
    assert_eq!(state, ResourceState::Undefined);
    pool.deallocate(&desc, buffer, ResourceState::ShaderResource, mark(0))?;
    assert_eq!(pool.len(), 1);

    // Nothing is known to be retired, so the pooled buffer may still be in use.
    let (fresh, _) = pool.allocate(&desc, mark(1), None)?;
    assert_ne!(fresh, buffer);

    let (reused, state) = pool.allocate(&desc, mark(2), Some(0))?;
    assert_eq!(reused, buffer);
    assert_eq!(state, ResourceState::ShaderResource);
    assert!(pool.is_empty());
    assert_eq!(device.live_objects(ObjectKind::Buffer), 2);
    Ok(())
}

#[test]
fn no_reuse_while_in_flight() -> Result<()> {
    framework::init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let pool = BufferPool::new(device.clone());
    let desc = framework::storage_buffer(4096);

    let (buffer, _) = pool.allocate(&desc, mark(3), None)?;
    pool.deallocate(&desc, buffer, ResourceState::CopyDest, mark(3))?;

    let (other, state) = pool.allocate(&desc, mark(4), Some(2))?;
    assert_ne!(other, buffer);
    assert_eq!(state, ResourceState::Undefined);
    assert_eq!(pool.len(), 1);
    Ok(())
}

#[test]
fn no_reuse_across_descriptors() -> Result<()> {
    framework::init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let pool = BufferPool::new(device.clone());
    let small = framework::storage_buffer(1024);
    let large = framework::storage_buffer(8192);

    let (buffer, _) = pool.allocate(&small, mark(0), None)?;
    pool.deallocate(&small, buffer, ResourceState::ShaderResource, mark(0))?;
    let (other, _) = pool.allocate(&large, mark(5), Some(4))?;
    assert_ne!(other, buffer);
    assert_eq!(pool.marks(&small).len(), 1);
    assert!(pool.marks(&large).is_empty());
    Ok(())
}

#[test]
fn oldest_entry_reused_first() -> Result<()> {
    framework::init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let pool = TexturePool::new(device.clone());
    let desc = framework::color_target(64, 64);

    let (first, _) = pool.allocate(&desc, mark(0), None)?;
    let (second, _) = pool.allocate(&desc, mark(0), None)?;
    pool.deallocate(&desc, first, ResourceState::RenderTarget, mark(0))?;
    pool.deallocate(&desc, second, ResourceState::ShaderResource, mark(1))?;

    let marks = pool.marks(&desc);
    assert_eq!(marks.iter().map(|mark| mark.frame_index).collect::<Vec<_>>(), vec![0, 1]);

    let (reused, state) = pool.allocate(&desc, mark(3), Some(1))?;
    assert_eq!(reused, first);
    assert_eq!(state, ResourceState::RenderTarget);
    Ok(())
}

#[test]
fn collect_garbage_filters() -> Result<()> {
    framework::init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let pool = BufferPool::new(device.clone());
    let desc = framework::storage_buffer(4096);

    let marks = [
        AllocationMark::new(0, ResourceTags::DEFAULT),
        AllocationMark::new(1, ResourceTags::DYNAMIC),
        AllocationMark::new(1, ResourceTags::DEFAULT),
        AllocationMark::new(2, ResourceTags::DEFAULT),
    ];
    for mark in marks {
        let (buffer, _) = pool.allocate(&desc, mark, None)?;
        pool.deallocate(&desc, buffer, ResourceState::ShaderResource, mark)?;
    }
    assert_eq!(device.live_objects(ObjectKind::Buffer), 4);

    // Dynamic buffers are kept, and the cutoff is exclusive.
    let freed = pool.collect_garbage(2, ResourceTags::DEFAULT, ResourceTags::DYNAMIC)?;
    assert_eq!(freed, 2);
    assert_eq!(pool.len(), 2);
    assert_eq!(device.live_objects(ObjectKind::Buffer), 2);

    let freed = pool.collect_garbage(2, ResourceTags::DYNAMIC, ResourceTags::INVALID)?;
    assert_eq!(freed, 1);
    let remaining = pool.marks(&desc);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].frame_index, 2);

    assert_eq!(pool.clear()?, 1);
    assert_eq!(device.live_objects(ObjectKind::Buffer), 0);
    Ok(())
}

#[test]
fn collected_texture_views_are_erased() -> Result<()> {
    framework::init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let textures = TexturePool::new(device.clone());
    let views = TextureViewPool::new(device.clone());
    let desc = framework::color_target(128, 128);

    let (texture, _) = textures.allocate(&desc, mark(0), None)?;
    let view = views.allocate(&TextureViewDesc::full(texture, &desc), 0)?;
    assert_eq!(views.allocate(&TextureViewDesc::full(texture, &desc), 1)?, view);
    assert_eq!(views.len(), 1);
    textures.deallocate(&desc, texture, ResourceState::ShaderResource, mark(1))?;

    let freed = textures.collect_garbage_with(2, ResourceTags::DEFAULT, ResourceTags::INVALID, |texture| {
        views.erase(*texture).unwrap();
    })?;
    assert_eq!(freed, 1);
    assert!(views.is_empty());
    assert_eq!(device.live_objects(ObjectKind::TextureView), 0);
    assert_eq!(device.live_objects(ObjectKind::Texture), 0);
    Ok(())
}

#[test]
fn view_garbage_uses_last_use() -> Result<()> {
    framework::init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let views = TextureViewPool::new(device.clone());
    let desc = framework::color_target(16, 16);
    let texture = device.create_texture(&desc, None)?;

    let full = TextureViewDesc::full(texture, &desc);
    views.allocate(&full, 0)?;
    views.allocate(&full, 3)?;
    assert_eq!(views.collect_garbage(3)?, 0);
    assert_eq!(views.collect_garbage(4)?, 1);
    device.free_texture(texture);
    Ok(())
}

#[test]
fn bind_tables_recycled_on_reset() -> Result<()> {
    framework::init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let mut pool = BindTablePool::new(device.clone());
    let layout = BindLayoutId(7);

    let a = pool.pop(layout)?;
    let b = pool.pop(layout)?;
    assert_ne!(a, b);
    assert_eq!(pool.in_use(), 2);

    pool.reset();
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.pop(layout)?, a);
    assert_eq!(pool.capacity(), 2);

    pool.destroy();
    assert_eq!(device.live_objects(ObjectKind::BindTable), 0);
    Ok(())
}
