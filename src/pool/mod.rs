mod byte_pool;
mod system;

pub use byte_pool::BytePool;
pub use system::SystemPool;

use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur when drawing buffers from a pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },

    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),

    #[error("Allocator refused {0} bytes")]
    AllocationFailed(usize),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Bulk allocator backing bridge regions.
///
/// Buffers returned by `pool_alloc` are at least `size` bytes long and zeroed.
/// A buffer handed back through `pool_free` may be reissued later, possibly at
/// the same address.
pub trait SharedPool: Send + Sync {
    fn pool_alloc(&self, size: usize) -> PoolResult<Box<[u8]>>;

    fn pool_free(&self, buffer: Box<[u8]>);

    /// Upper bound on bytes handed out at once
    fn capacity(&self) -> usize;

    /// Bytes currently handed out
    fn bytes_in_use(&self) -> usize;
}

/// Pick the pool for a configured size: a bounded `BytePool`, or the general
/// allocator when no pool size is configured
pub fn create_pool(shared_pool_size: usize) -> Arc<dyn SharedPool> {
    if shared_pool_size == 0 {
        Arc::new(SystemPool::new())
    } else {
        Arc::new(BytePool::new(shared_pool_size))
    }
}

/// Allocate a zeroed buffer from the general allocator, reporting failure
/// instead of aborting
pub(crate) fn try_alloc_zeroed(size: usize) -> PoolResult<Box<[u8]>> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(size)
        .map_err(|_| PoolError::AllocationFailed(size))?;
    bytes.resize(size, 0);
    Ok(bytes.into_boxed_slice())
}
