//! Pooled native resources and their states.
//!
//! The [`ResourcePools`] struct bundles every pool the backend allocates frame resources from. It is shared
//! through an [`Arc`], so other systems (for example an asset uploader) can allocate from the same pools while
//! frames are being executed.

use std::sync::Arc;

use anyhow::Result;

use crate::device::Device;
use crate::resource::pool::{BufferPool, MemoryPool, TexturePool};
use crate::resource::view::{BufferViewPool, TextureViewPool};

pub mod bind_table;
pub mod pool;
pub mod state;
pub mod view;

/// Every shared pool of the backend.
#[derive(Debug)]
pub struct ResourcePools {
    pub buffers: BufferPool,
    pub textures: TexturePool,
    /// Memory blocks backing aliased resources.
    pub memory: MemoryPool,
    pub texture_views: TextureViewPool,
    pub buffer_views: BufferViewPool,
}

impl ResourcePools {
    pub fn new(device: Arc<dyn Device>) -> Arc<Self> {
        Arc::new(Self {
            buffers: BufferPool::new(device.clone()),
            textures: TexturePool::new(device.clone()),
            memory: MemoryPool::new(device.clone()),
            texture_views: TextureViewPool::new(device.clone()),
            buffer_views: BufferViewPool::new(device),
        })
    }

    /// Destroy every pooled object. Views are destroyed first.
    pub fn clear(&self) -> Result<usize> {
        Ok(self.texture_views.clear()?
            + self.buffer_views.clear()?
            + self.textures.clear()?
            + self.buffers.clear()?
            + self.memory.clear()?)
    }
}
