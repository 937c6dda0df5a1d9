#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;

use render_backend::prelude::*;

#[derive(Debug)]
pub struct Context {
    pub device: Arc<HeadlessDevice>,
    pub backend: Backend,
}

/// Initializes logging for a test binary. Safe to call from every test.
pub fn init_logger() {
    let _ = pretty_env_logger::formatted_builder().is_test(true).try_init();
}

/// Creates a headless backend with only the primary graphics queue.
pub fn make_context() -> Result<Context> {
    make_context_with_settings(|builder| builder)
}

/// Creates a headless backend with custom settings, for example extra queues.
pub fn make_context_with_settings<F: FnOnce(BackendBuilder) -> BackendBuilder>(callback: F) -> Result<Context> {
    init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let settings = callback(BackendBuilder::new()).build();
    let backend = Backend::new(device.clone(), settings)?;
    Ok(Context {
        device,
        backend,
    })
}

pub fn storage_buffer(size: u64) -> BufferDesc {
    BufferDesc::new(
        size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryUsage::GpuOnly,
    )
}

pub fn color_target(width: u32, height: u32) -> TextureDesc {
    TextureDesc::new_2d(
        width,
        height,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
    )
}

/// Compiles a graph against the queues of a backend with the given amount of compute and copy queues.
pub fn compile(graph: &FrameGraph, compute_queues: u32, copy_queues: u32) -> Result<CompiledFrame> {
    let ctx = make_context_with_settings(|builder| builder.compute_queues(compute_queues).copy_queues(copy_queues))?;
    ctx.backend.compile(graph)
}
