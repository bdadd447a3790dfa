use std::sync::atomic::{AtomicUsize, Ordering};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use crate::pool::{try_alloc_zeroed, PoolError, PoolResult, SharedPool};

/// Smallest buffer the pool hands out
pub const MIN_CLASS_SIZE: usize = 64;

/// A bounded pool with power-of-two size classes.
///
/// Freed buffers are cached per class and reissued zeroed. The capacity
/// bounds bytes handed out, counted at class size.
pub struct BytePool {
    capacity: usize,
    reserved: AtomicUsize,
    free_lists: DashMap<usize, SegQueue<Box<[u8]>>>,
}

impl BytePool {
    /// Create a pool that hands out at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            reserved: AtomicUsize::new(0),
            free_lists: DashMap::new(),
        }
    }

    /// Size class serving a request of `size` bytes
    pub fn size_class(size: usize) -> Option<usize> {
        size.max(MIN_CLASS_SIZE).checked_next_power_of_two()
    }

    /// Number of freed buffers waiting to be reused
    pub fn cached_buffers(&self) -> usize {
        self.free_lists.iter().map(|entry| entry.value().len()).sum()
    }

    fn reserve(&self, class: usize) -> PoolResult<()> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(class).filter(|&total| total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| PoolError::Exhausted {
                requested: class,
                available: self.capacity.saturating_sub(used),
            })
    }

    fn unreserve(&self, class: usize) {
        let _ = self.reserved.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            Some(used.saturating_sub(class))
        });
    }
}

impl SharedPool for BytePool {
    fn pool_alloc(&self, size: usize) -> PoolResult<Box<[u8]>> {
        if size == 0 {
            return Err(PoolError::InvalidSize(size));
        }
        let class = Self::size_class(size).ok_or(PoolError::InvalidSize(size))?;
        self.reserve(class)?;

        let cached = self.free_lists.get(&class).and_then(|queue| queue.pop());
        if let Some(mut buffer) = cached {
            buffer.fill(0);
            return Ok(buffer);
        }

        match try_alloc_zeroed(class) {
            Ok(buffer) => Ok(buffer),
            Err(err) => {
                self.unreserve(class);
                Err(err)
            }
        }
    }

    fn pool_free(&self, buffer: Box<[u8]>) {
        let class = buffer.len();
        // Buffers that did not come from this pool are simply dropped
        if class < MIN_CLASS_SIZE || !class.is_power_of_two() {
            return;
        }
        self.unreserve(class);
        self.free_lists.entry(class).or_default().push(buffer);
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn bytes_in_use(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }
}
