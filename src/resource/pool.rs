//! Pools of native objects, keyed by their creation descriptor.
//!
//! Every pool keeps its entries in a generation-checked arena. For each descriptor, a FIFO queue of arena keys
//! holds the free entries in the order they were released. Since frames release objects in increasing frame
//! order, the front of a queue is always its oldest entry, so allocation only has to look at the front to
//! decide whether an object is retired and can be handed out again.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use slotmap::{new_key_type, SlotMap};

use crate::core::error::Error;
use crate::device::{BufferDesc, BufferHandle, Device, MemoryDesc, MemoryHandle, TextureDesc, TextureHandle};
use crate::resource::state::{AllocationMark, ResourceState, ResourceTags};

new_key_type! {
    /// Key of an entry in a pool arena.
    pub struct PoolKey;
}

/// Indicates that this native object can be pooled in a [`Pool`].
pub trait Poolable: Copy + Eq + Debug + Send + Sync + 'static {
    /// Creation descriptor. Objects created with equal descriptors are interchangeable.
    type Desc: Hash + Eq + Clone + Debug + Send + Sync;

    /// Name of the object kind, for logging.
    const KIND: &'static str;

    /// Create a new object on the device.
    fn create(device: &dyn Device, desc: &Self::Desc) -> Result<Self>;

    /// Destroy the object. The caller guarantees no GPU work references it anymore.
    fn destroy(self, device: &dyn Device);
}

#[derive(Debug)]
struct PoolEntry<P: Poolable> {
    object: P,
    desc: P::Desc,
    state: ResourceState,
    mark: AllocationMark,
}

struct PoolInner<P: Poolable> {
    entries: SlotMap<PoolKey, PoolEntry<P>>,
    free: HashMap<P::Desc, VecDeque<PoolKey>>,
}

/// Pool of native objects of one kind. The pool is internally synchronized and can be shared between threads.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Pool<P: Poolable> {
    #[derivative(Debug = "ignore")]
    device: Arc<dyn Device>,
    #[derivative(Debug = "ignore")]
    inner: RwLock<PoolInner<P>>,
}

impl<P: Poolable> PoolInner<P> {
    /// Pop the front entry for this descriptor, if it was released at or before `min_frame_index`.
    fn take_retired(&mut self, desc: &P::Desc, min_frame_index: u64) -> Option<PoolEntry<P>> {
        let queue = self.free.get_mut(desc)?;
        while let Some(key) = queue.front().copied() {
            let Some(entry) = self.entries.get(key) else {
                // Stale key, the entry was already collected.
                queue.pop_front();
                continue;
            };
            if entry.mark.frame_index > min_frame_index {
                return None;
            }
            queue.pop_front();
            return self.entries.remove(key);
        }
        None
    }
}

impl<P: Poolable> Pool<P> {
    /// Create a new, empty pool.
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            inner: RwLock::new(PoolInner {
                entries: SlotMap::with_key(),
                free: HashMap::new(),
            }),
        }
    }

    /// Get an object matching the descriptor, together with the state it was left in.
    ///
    /// A free object is reused only if it was released in a frame at or before `min_frame_index`. Pass `None`
    /// if no frame is known to be retired, this always creates a new object.
    pub fn allocate(
        &self,
        desc: &P::Desc,
        mark: AllocationMark,
        min_frame_index: Option<u64>,
    ) -> Result<(P, ResourceState)> {
        if let Some(min_frame_index) = min_frame_index {
            let mut inner = self.inner.write().map_err(|_| Error::PoisonError)?;
            if let Some(entry) = inner.take_retired(desc, min_frame_index) {
                trace!(
                    "Reusing pooled {} {:?} from frame {} for frame {}",
                    P::KIND,
                    entry.object,
                    entry.mark.frame_index,
                    mark.frame_index
                );
                return Ok((entry.object, entry.state));
            }
        }

        let object = P::create(self.device.as_ref(), desc)?;
        debug!("No retired {} in pool for {:?}, created {:?}", P::KIND, desc, object);
        #[cfg(feature = "log-objects")]
        trace!("Created new {} {:?} for frame {}", P::KIND, object, mark.frame_index);
        Ok((object, ResourceState::Undefined))
    }

    /// Release an object back into the pool. `final_state` is the state the last GPU access left it in,
    /// `mark` the frame that last used it.
    pub fn deallocate(&self, desc: &P::Desc, object: P, final_state: ResourceState, mark: AllocationMark) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::PoisonError)?;
        let key = inner.entries.insert(PoolEntry {
            object,
            desc: desc.clone(),
            state: final_state,
            mark,
        });
        inner.free.entry(desc.clone()).or_default().push_back(key);
        Ok(())
    }

    /// Destroy every free object released before `critical_frame` whose tags contain one of `with_tags` and
    /// none of `without_tags`. Returns the amount of objects destroyed.
    pub fn collect_garbage(&self, critical_frame: u64, with_tags: ResourceTags, without_tags: ResourceTags) -> Result<usize> {
        self.collect_garbage_with(critical_frame, with_tags, without_tags, |_| {})
    }

    /// Same as [`Pool::collect_garbage`], but calls `on_free` for every object right before it is destroyed.
    pub fn collect_garbage_with(
        &self,
        critical_frame: u64,
        with_tags: ResourceTags,
        without_tags: ResourceTags,
        mut on_free: impl FnMut(&P),
    ) -> Result<usize> {
        let mut inner = self.inner.write().map_err(|_| Error::PoisonError)?;
        let mut freed = vec![];
        inner.entries.retain(|_, entry| {
            let collect = entry.mark.frame_index < critical_frame && entry.mark.tags.matches(with_tags, without_tags);
            if collect {
                freed.push(entry.object);
            }
            !collect
        });
        let PoolInner {
            entries,
            free,
        } = &mut *inner;
        free.retain(|_, queue| {
            queue.retain(|key| entries.contains_key(*key));
            !queue.is_empty()
        });
        drop(inner);

        for object in &freed {
            on_free(object);
            #[cfg(feature = "log-objects")]
            trace!("Destroying pooled {} {:?}", P::KIND, object);
            object.destroy(self.device.as_ref());
        }
        Ok(freed.len())
    }

    /// Destroy every free object in the pool.
    pub fn clear(&self) -> Result<usize> {
        let mut inner = self.inner.write().map_err(|_| Error::PoisonError)?;
        let objects = inner.entries.drain().map(|(_, entry)| entry.object).collect::<Vec<_>>();
        inner.free.clear();
        drop(inner);
        for object in &objects {
            object.destroy(self.device.as_ref());
        }
        Ok(objects.len())
    }

    /// Amount of free objects in the pool.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocation marks of the free objects for a descriptor, front of the queue first.
    pub fn marks(&self, desc: &P::Desc) -> Vec<AllocationMark> {
        let Ok(inner) = self.inner.read() else {
            return vec![];
        };
        inner
            .free
            .get(desc)
            .map(|queue| {
                queue
                    .iter()
                    .filter_map(|key| inner.entries.get(*key))
                    .map(|entry| {
                        debug_assert_eq!(&entry.desc, desc);
                        entry.mark
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Poolable for BufferHandle {
    type Desc = BufferDesc;
    const KIND: &'static str = "buffer";

    fn create(device: &dyn Device, desc: &Self::Desc) -> Result<Self> {
        device.create_buffer(desc, None)
    }

    fn destroy(self, device: &dyn Device) {
        device.free_buffer(self)
    }
}

impl Poolable for TextureHandle {
    type Desc = TextureDesc;
    const KIND: &'static str = "texture";

    fn create(device: &dyn Device, desc: &Self::Desc) -> Result<Self> {
        device.create_texture(desc, None)
    }

    fn destroy(self, device: &dyn Device) {
        device.free_texture(self)
    }
}

impl Poolable for MemoryHandle {
    type Desc = MemoryDesc;
    const KIND: &'static str = "memory block";

    fn create(device: &dyn Device, desc: &Self::Desc) -> Result<Self> {
        device.allocate_memory(desc)
    }

    fn destroy(self, device: &dyn Device) {
        device.free_memory(self)
    }
}

/// Pool of buffers.
pub type BufferPool = Pool<BufferHandle>;
/// Pool of textures.
pub type TexturePool = Pool<TextureHandle>;
/// Pool of memory blocks backing aliased resources.
pub type MemoryPool = Pool<MemoryHandle>;
