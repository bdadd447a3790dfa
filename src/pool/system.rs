use std::sync::atomic::{AtomicUsize, Ordering};
use crate::pool::{try_alloc_zeroed, PoolError, PoolResult, SharedPool};

/// Pool that forwards every request to the general allocator
pub struct SystemPool {
    in_use: AtomicUsize,
}

impl SystemPool {
    /// Create an unbounded pool
    pub fn new() -> Self {
        Self {
            in_use: AtomicUsize::new(0),
        }
    }
}

impl Default for SystemPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedPool for SystemPool {
    fn pool_alloc(&self, size: usize) -> PoolResult<Box<[u8]>> {
        if size == 0 {
            return Err(PoolError::InvalidSize(size));
        }

        let buffer = try_alloc_zeroed(size)?;
        self.in_use.fetch_add(size, Ordering::AcqRel);
        Ok(buffer)
    }

    fn pool_free(&self, buffer: Box<[u8]>) {
        let len = buffer.len();
        let _ = self.in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            Some(used.saturating_sub(len))
        });
    }

    fn capacity(&self) -> usize {
        usize::MAX
    }

    fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_pool_exact_sizes() {
        let pool = SystemPool::new();

        let a = pool.pool_alloc(3).unwrap();
        let b = pool.pool_alloc(1000).unwrap();

        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 1000);
        assert_eq!(pool.bytes_in_use(), 1003);

        pool.pool_free(a);
        assert_eq!(pool.bytes_in_use(), 1000);
        pool.pool_free(b);
        assert_eq!(pool.bytes_in_use(), 0);
    }

    #[test]
    fn test_system_pool_rejects_zero() {
        let pool = SystemPool::new();
        assert!(matches!(pool.pool_alloc(0), Err(PoolError::InvalidSize(0))));
    }
}
