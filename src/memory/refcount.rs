use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::memory::RegionHandle;

/// Per-region counts of active holders across all languages.
///
/// When both are needed, the ownership lock is taken before this one.
pub struct ReferenceCounter {
    counts: Mutex<CountTable>,
}

pub(crate) struct CountTable {
    counts: FxHashMap<RegionHandle, usize>,
}

impl CountTable {
    /// Add a holder; an unseen handle starts at 1. Returns false only when
    /// the table cannot grow.
    pub(crate) fn increment(&mut self, handle: RegionHandle) -> bool {
        if !self.counts.contains_key(&handle) && self.counts.try_reserve(1).is_err() {
            return false;
        }
        let count = self.counts.entry(handle).or_insert(0);
        *count += 1;
        trace!(%handle, count = *count, "reference acquired");
        true
    }

    /// Drop a holder and return the remaining count. Unknown handles stay at
    /// zero; an entry disappears when it reaches zero.
    pub(crate) fn decrement(&mut self, handle: RegionHandle) -> usize {
        let Some(count) = self.counts.get_mut(&handle) else {
            return 0;
        };
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.counts.remove(&handle);
        }
        trace!(%handle, count = remaining, "reference released");
        remaining
    }

    /// Make room for `additional` fresh handles
    pub(crate) fn reserve(&mut self, additional: usize) -> bool {
        self.counts.try_reserve(additional).is_ok()
    }

    pub(crate) fn get_count(&self, handle: RegionHandle) -> usize {
        self.counts.get(&handle).copied().unwrap_or(0)
    }

    pub(crate) fn forget(&mut self, handle: RegionHandle) {
        self.counts.remove(&handle);
    }

    pub(crate) fn clear(&mut self) {
        self.counts.clear();
    }
}

impl ReferenceCounter {
    /// Create a counter sized for `capacity` handles
    pub fn with_capacity(capacity: usize) -> Self {
        let mut counts = FxHashMap::default();
        counts.reserve(capacity);
        Self {
            counts: Mutex::new(CountTable { counts }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CountTable> {
        self.counts.lock()
    }

    /// Add a holder; false if the table cannot grow
    pub fn increment(&self, handle: RegionHandle) -> bool {
        self.lock().increment(handle)
    }

    /// Drop a holder and return the remaining count
    pub fn decrement(&self, handle: RegionHandle) -> usize {
        self.lock().decrement(handle)
    }

    /// Current count; zero for unseen handles
    pub fn get_count(&self, handle: RegionHandle) -> usize {
        self.lock().get_count(handle)
    }

    /// Number of handles with at least one holder
    pub fn tracked(&self) -> usize {
        self.lock().counts.len()
    }
}
