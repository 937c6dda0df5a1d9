//! Texture and buffer view pools.
//!
//! Views are cached per view descriptor. Unlike resources they are never handed out exclusively: the same view
//! can be used by any number of passes, so the pool only tracks the last frame that used each view.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use anyhow::Result;

use crate::core::error::Error;
use crate::device::{
    BufferHandle, BufferViewDesc, BufferViewHandle, Device, TextureHandle, TextureViewDesc, TextureViewHandle,
};

/// A view object that can be cached in a [`ViewPool`].
pub trait PoolableView: Copy + Debug + Send + Sync + 'static {
    type Desc: Hash + Eq + Clone + Debug + Send + Sync;
    /// The resource this view is a view of.
    type Parent: Copy + Eq + Debug;

    fn parent(desc: &Self::Desc) -> Self::Parent;
    fn create(device: &dyn Device, desc: &Self::Desc) -> Result<Self>;
    fn destroy(self, device: &dyn Device);
}

#[derive(Debug)]
struct ViewEntry<V> {
    view: V,
    last_used_frame: u64,
}

/// Cache of views, keyed by view descriptor.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ViewPool<V: PoolableView> {
    #[derivative(Debug = "ignore")]
    device: Arc<dyn Device>,
    views: RwLock<HashMap<V::Desc, ViewEntry<V>>>,
}

impl<V: PoolableView> ViewPool<V> {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            views: RwLock::new(HashMap::new()),
        }
    }

    /// Get the view for this descriptor, creating it if it does not exist yet.
    pub fn allocate(&self, desc: &V::Desc, frame_index: u64) -> Result<V> {
        let mut views = self.views.write().map_err(|_| Error::PoisonError)?;
        if let Some(entry) = views.get_mut(desc) {
            entry.last_used_frame = entry.last_used_frame.max(frame_index);
            return Ok(entry.view);
        }
        let view = V::create(self.device.as_ref(), desc)?;
        #[cfg(feature = "log-objects")]
        trace!("Created new view {:?} for {:?}", view, desc);
        views.insert(
            desc.clone(),
            ViewEntry {
                view,
                last_used_frame: frame_index,
            },
        );
        Ok(view)
    }

    /// Destroy every view of a resource. Must be called before the resource itself is destroyed.
    pub fn erase(&self, parent: V::Parent) -> Result<usize> {
        self.remove_where(|desc, _| V::parent(desc) == parent)
    }

    /// Destroy every view that was not used in or after `critical_frame`.
    pub fn collect_garbage(&self, critical_frame: u64) -> Result<usize> {
        self.remove_where(|_, entry| entry.last_used_frame < critical_frame)
    }

    /// Destroy all views.
    pub fn clear(&self) -> Result<usize> {
        self.remove_where(|_, _| true)
    }

    pub fn len(&self) -> usize {
        self.views.read().map(|views| views.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, mut predicate: impl FnMut(&V::Desc, &ViewEntry<V>) -> bool) -> Result<usize> {
        let mut views = self.views.write().map_err(|_| Error::PoisonError)?;
        let mut freed = vec![];
        views.retain(|desc, entry| {
            let remove = predicate(desc, entry);
            if remove {
                freed.push(entry.view);
            }
            !remove
        });
        drop(views);
        for view in &freed {
            #[cfg(feature = "log-objects")]
            trace!("Destroying view {:?}", view);
            view.destroy(self.device.as_ref());
        }
        Ok(freed.len())
    }
}

impl PoolableView for TextureViewHandle {
    type Desc = TextureViewDesc;
    type Parent = TextureHandle;

    fn parent(desc: &Self::Desc) -> Self::Parent {
        desc.texture
    }

    fn create(device: &dyn Device, desc: &Self::Desc) -> Result<Self> {
        device.create_texture_view(desc)
    }

    fn destroy(self, device: &dyn Device) {
        device.free_texture_view(self)
    }
}

impl PoolableView for BufferViewHandle {
    type Desc = BufferViewDesc;
    type Parent = BufferHandle;

    fn parent(desc: &Self::Desc) -> Self::Parent {
        desc.buffer
    }

    fn create(device: &dyn Device, desc: &Self::Desc) -> Result<Self> {
        device.create_buffer_view(desc)
    }

    fn destroy(self, device: &dyn Device) {
        device.free_buffer_view(self)
    }
}

pub type TextureViewPool = ViewPool<TextureViewHandle>;
pub type BufferViewPool = ViewPool<BufferViewHandle>;
