//! Render graph execution engine.
//!
//! A frame is described as a [`FrameGraph`](crate::graph::FrameGraph): a set of logical resources and the passes
//! that read and write them. The [`Backend`] compiles each graph into an execution plan over the hardware
//! queues, inserts every barrier and cross-queue semaphore wait the plan needs, lets transient resources with
//! disjoint lifetimes share memory, and keeps a bounded number of frames in flight on the GPU.
//!
//! To get started, the easiest way is to simply
//! ```
//! use render_backend::prelude::*;
//! ```
//!
//! # Example
//!
//! The backend runs on top of a [`Device`](crate::device::Device). The [`HeadlessDevice`](crate::device::HeadlessDevice)
//! implements it without a GPU, which is useful for tests and tooling.
//! ```
//! use std::sync::Arc;
//! use render_backend::prelude::*;
//!
//! let device = Arc::new(HeadlessDevice::new());
//! let settings = BackendBuilder::new()
//!     .frames_in_flight(2)
//!     .compute_queues(1)
//!     .build();
//! let mut backend = Backend::new(device, settings)?;
//!
//! let mut graph = backend.new_frame();
//! let desc = TextureDesc::new_2d(1920, 1080, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED);
//! let color = graph.create_texture("color", desc);
//! let render = PassBuilder::graphics("render")
//!     .write(color, ResourceState::RenderTarget)
//!     .record(move |cmd| {
//!         cmd.begin_rendering(&[color], None, Some([0.0, 0.0, 0.0, 1.0]))?;
//!         cmd.draw(3, 1, 0, 0)?;
//!         cmd.end_rendering()?;
//!         Ok(())
//!     })
//!     .build();
//! graph.add_pass(render)?;
//! let frame = backend.execute(graph, None)?;
//! backend.wait_frame(frame)?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//! For further example code, check out the following modules
//! - [`graph`] for building frame graphs and recording pass commands.
//! - [`phases`] for the compile phases and their outputs.
//! - [`backend`] for frame execution, frames in flight and garbage collection.
//! - [`resource`] for the shared resource pools.
//! - [`device`] for the native device interface.

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;

pub mod prelude;
pub use crate::prelude::*;

pub mod backend;
pub mod core;
pub mod device;
pub mod graph;
pub mod phases;
pub mod resource;

static_assertions::assert_impl_all!(resource::ResourcePools: Send, Sync);
static_assertions::assert_impl_all!(resource::pool::BufferPool: Send, Sync);
static_assertions::assert_impl_all!(resource::pool::TexturePool: Send, Sync);
static_assertions::assert_impl_all!(device::HeadlessDevice: Send, Sync);
static_assertions::assert_impl_all!(phases::CompiledFrame: Send, Sync);
