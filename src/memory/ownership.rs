use std::ptr::NonNull;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use crate::memory::{BridgeError, BridgeResult, LanguageId};
use crate::memory::region::{Permissions, RegionFlags, RegionHandle, RegionInfo, FIRST_GENERATION};
use crate::pool::SharedPool;

/// Storage behind a registered region
pub(crate) enum Backing {
    /// Buffer drawn from the shared pool; returned to it on release
    Pooled(Box<[u8]>),
    /// Memory owned by a language runtime; the bridge never frees it
    Foreign { ptr: NonNull<u8>, len: usize },
}

// Foreign memory is only touched under the registry lock, and the
// `RegionHandle::from_raw` contract keeps it valid while registered.
unsafe impl Send for Backing {}

impl Backing {
    /// # Safety
    ///
    /// `handle` must satisfy the `RegionHandle::from_raw` contract for `len` bytes.
    pub(crate) unsafe fn foreign(handle: RegionHandle, len: usize) -> Option<Self> {
        NonNull::new(handle.address() as *mut u8).map(|ptr| Backing::Foreign { ptr, len })
    }

    pub(crate) fn address(&self) -> usize {
        match self {
            Backing::Pooled(bytes) => bytes.as_ptr() as usize,
            Backing::Foreign { ptr, .. } => ptr.as_ptr() as usize,
        }
    }

    pub(crate) fn is_foreign(&self) -> bool {
        matches!(self, Backing::Foreign { .. })
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Backing::Pooled(bytes) => bytes,
            // SAFETY: guaranteed by the contract of `Backing::foreign`
            Backing::Foreign { ptr, len } => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) },
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Backing::Pooled(bytes) => bytes,
            // SAFETY: guaranteed by the contract of `Backing::foreign`
            Backing::Foreign { ptr, len } => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), *len) },
        }
    }

    /// Give pooled storage back to the pool
    pub(crate) fn release(self, pool: &dyn SharedPool) {
        if let Backing::Pooled(bytes) = self {
            pool.pool_free(bytes);
        }
    }
}

/// A registered region: its descriptor and the storage it annotates
pub(crate) struct RegionEntry {
    pub(crate) info: RegionInfo,
    pub(crate) backing: Backing,
}

impl RegionEntry {
    /// The first `info.size` bytes of the region
    pub(crate) fn content(&self) -> &[u8] {
        &self.backing.bytes()[..self.info.size]
    }

    pub(crate) fn content_mut(&mut self) -> &mut [u8] {
        let size = self.info.size;
        &mut self.backing.bytes_mut()[..size]
    }
}

/// Table guarded by the ownership lock
pub(crate) struct RegistryTable {
    entries: FxHashMap<usize, RegionEntry>,
    next_generation: u64,
    bytes_tracked: usize,
}

impl RegistryTable {
    fn with_capacity(capacity: usize) -> Self {
        let mut entries = FxHashMap::default();
        entries.reserve(capacity);
        Self {
            entries,
            next_generation: FIRST_GENERATION,
            bytes_tracked: 0,
        }
    }

    /// Make room for `additional` entries so that `add` cannot fail
    pub(crate) fn reserve(&mut self, additional: usize) -> BridgeResult<()> {
        self.entries
            .try_reserve(additional)
            .map_err(|_| BridgeError::OutOfMemory("ownership table growth failed".to_string()))
    }

    pub(crate) fn contains_address(&self, address: usize) -> bool {
        self.entries.contains_key(&address)
    }

    /// Register storage and return its freshly tagged handle.
    ///
    /// Callers check `contains_address` and call `reserve` first.
    pub(crate) fn add(&mut self, backing: Backing, size: usize, owner: LanguageId, permissions: Permissions, flags: RegionFlags) -> RegionHandle {
        let generation = self.next_generation;
        self.next_generation += 1;

        let address = backing.address();
        let handle = RegionHandle::from_parts(address, generation);
        let info = RegionInfo::new(handle, size, owner, permissions, flags);
        self.entries.insert(address, RegionEntry { info, backing });
        self.bytes_tracked += size;
        handle
    }

    /// Remove the entry the handle resolves to
    pub(crate) fn remove(&mut self, handle: RegionHandle) -> Option<RegionEntry> {
        self.find(handle)?;
        let entry = self.entries.remove(&handle.address())?;
        self.bytes_tracked -= entry.info.size;
        Some(entry)
    }

    /// Resolve a handle. Untagged handles match whatever is registered at
    /// their address; tagged handles also need the generation to match.
    pub(crate) fn find(&self, handle: RegionHandle) -> Option<&RegionEntry> {
        self.entries
            .get(&handle.address())
            .filter(|entry| !handle.is_tagged() || entry.info.handle == handle)
    }

    pub(crate) fn find_mut(&mut self, handle: RegionHandle) -> Option<&mut RegionEntry> {
        self.entries
            .get_mut(&handle.address())
            .filter(|entry| !handle.is_tagged() || entry.info.handle == handle)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &RegionEntry> {
        self.entries.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegionEntry> {
        self.entries.values_mut()
    }

    /// Remove every entry. The generation counter keeps running.
    pub(crate) fn drain(&mut self) -> Vec<RegionEntry> {
        self.bytes_tracked = 0;
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn bytes_tracked(&self) -> usize {
        self.bytes_tracked
    }
}

/// Source of truth mapping live regions to their descriptors
pub struct OwnershipRegistry {
    table: Mutex<RegistryTable>,
}

impl OwnershipRegistry {
    /// Create a registry sized for `capacity` regions
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: Mutex::new(RegistryTable::with_capacity(capacity)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryTable> {
        self.table.lock()
    }

    /// Copy of the descriptor a handle resolves to
    pub fn find(&self, handle: RegionHandle) -> Option<RegionInfo> {
        self.lock().find(handle).map(|entry| entry.info.clone())
    }

    /// Whether a handle resolves to a live region
    pub fn contains(&self, handle: RegionHandle) -> bool {
        self.lock().find(handle).is_some()
    }

    /// Number of live regions
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no region is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of descriptor sizes
    pub fn bytes_tracked(&self) -> usize {
        self.lock().bytes_tracked()
    }

    /// Descriptors owned by `language`
    pub fn owned_by(&self, language: &LanguageId) -> Vec<RegionInfo> {
        self.lock()
            .iter()
            .filter(|entry| entry.info.is_owned_by(language))
            .map(|entry| entry.info.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{SharedPool, BytePool};

    fn pooled(pool: &BytePool, size: usize) -> Backing {
        Backing::Pooled(pool.pool_alloc(size).unwrap())
    }

    fn add(table: &mut RegistryTable, backing: Backing, size: usize, owner: &str) -> RegionHandle {
        table.reserve(1).unwrap();
        table.add(backing, size, owner.into(), Permissions::READ | Permissions::WRITE, RegionFlags::AUTO_FREE)
    }

    #[test]
    fn test_registry_add_and_find() {
        let pool = BytePool::new(4096);
        let registry = OwnershipRegistry::with_capacity(4);

        let handle = add(&mut registry.lock(), pooled(&pool, 100), 100, "lang_a");
        let info = registry.find(handle).unwrap();

        assert_eq!(info.handle, handle);
        assert_eq!(info.size, 100);
        assert_eq!(info.owner.as_str(), "lang_a");
        assert_eq!(handle.generation(), FIRST_GENERATION);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.bytes_tracked(), 100);
    }

    #[test]
    fn test_registry_remove() {
        let pool = BytePool::new(4096);
        let registry = OwnershipRegistry::with_capacity(4);
        let handle = add(&mut registry.lock(), pooled(&pool, 10), 10, "lang_a");

        let entry = registry.lock().remove(handle).unwrap();
        assert_eq!(entry.info.handle, handle);
        assert!(registry.is_empty());
        assert_eq!(registry.bytes_tracked(), 0);

        // A second removal finds nothing
        assert!(registry.lock().remove(handle).is_none());
        entry.backing.release(&pool);
    }

    #[test]
    fn test_registry_generation_guards_reused_address() {
        let pool = BytePool::new(4096);
        let registry = OwnershipRegistry::with_capacity(4);

        let first = add(&mut registry.lock(), pooled(&pool, 64), 64, "lang_a");
        let entry = registry.lock().remove(first).unwrap();
        entry.backing.release(&pool);

        // The pool hands the same buffer back
        let second = add(&mut registry.lock(), pooled(&pool, 64), 64, "lang_b");
        assert_eq!(first.address(), second.address());
        assert_eq!(second.generation(), first.generation() + 1);

        assert!(registry.find(first).is_none());
        assert_eq!(registry.find(second).unwrap().owner.as_str(), "lang_b");
        assert!(registry.lock().remove(first).is_none());
    }

    #[test]
    fn test_registry_churn_keeps_bookkeeping_bounded() {
        use crate::pool::SystemPool;

        let pool = SystemPool::new();
        let registry = OwnershipRegistry::with_capacity(4);
        let mut table = registry.lock();
        let mut last = RegionHandle::null();

        for round in 0..200 {
            let handles: Vec<_> = (0..50)
                .map(|i| {
                    let size = 16 + (round * 50 + i) % 500;
                    add(&mut table, Backing::Pooled(pool.pool_alloc(size).unwrap()), size, "lang_a")
                })
                .collect();
            for handle in handles {
                table.remove(handle).unwrap().backing.release(&pool);
                last = handle;
            }
        }

        assert_eq!(table.len(), 0);
        assert!(table.entries.capacity() < 200);
        assert_eq!(last.generation(), FIRST_GENERATION + 200 * 50 - 1);
        assert_eq!(table.next_generation, FIRST_GENERATION + 200 * 50);
        assert_eq!(pool.bytes_in_use(), 0);
    }

    #[test]
    fn test_registry_untagged_handle_matches_live_entry() {
        let pool = BytePool::new(4096);
        let registry = OwnershipRegistry::with_capacity(4);
        let handle = add(&mut registry.lock(), pooled(&pool, 64), 64, "lang_a");

        let raw = unsafe { RegionHandle::from_raw(handle.address() as *const u8) };
        assert_eq!(registry.find(raw).unwrap().handle, handle);
    }

    #[test]
    fn test_registry_foreign_backing() {
        let mut bytes = vec![1u8, 2, 3, 4];
        let raw = unsafe { RegionHandle::from_raw(bytes.as_mut_ptr()) };
        let backing = unsafe { Backing::foreign(raw, bytes.len()) }.unwrap();
        assert!(backing.is_foreign());

        let registry = OwnershipRegistry::with_capacity(1);
        let handle = add(&mut registry.lock(), backing, 4, "cobol");

        let mut table = registry.lock();
        assert_eq!(table.find(handle).unwrap().content(), &[1, 2, 3, 4]);
        table.find_mut(handle).unwrap().content_mut()[0] = 9;
        drop(table);

        let entry = registry.lock().remove(handle).unwrap();
        entry.backing.release(&BytePool::new(0));
        assert_eq!(bytes[0], 9);
    }

    #[test]
    fn test_registry_foreign_null_rejected() {
        let backing = unsafe { Backing::foreign(RegionHandle::null(), 8) };
        assert!(backing.is_none());
    }

    #[test]
    fn test_registry_owned_by_and_drain() {
        let pool = BytePool::new(4096);
        let registry = OwnershipRegistry::with_capacity(4);
        {
            let mut table = registry.lock();
            add(&mut table, pooled(&pool, 8), 8, "lang_a");
            add(&mut table, pooled(&pool, 8), 8, "lang_a");
            add(&mut table, pooled(&pool, 8), 8, "lang_b");
        }

        assert_eq!(registry.owned_by(&"lang_a".into()).len(), 2);
        assert_eq!(registry.owned_by(&"lang_b".into()).len(), 1);

        let drained = registry.lock().drain();
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.bytes_tracked(), 0);
        for entry in drained {
            entry.backing.release(&pool);
        }
        assert_eq!(pool.bytes_in_use(), 0);
    }

    #[test]
    fn test_registry_concurrent_adds() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(BytePool::new(64 * 32));
        let registry = Arc::new(OwnershipRegistry::with_capacity(2));
        let mut handles = vec![];

        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let backing = pooled(&pool, 64);
                add(&mut registry.lock(), backing, 64, "lang_a")
            }));
        }

        let mut addresses: Vec<usize> = handles
            .into_iter()
            .map(|h| h.join().unwrap().address())
            .collect();
        addresses.sort();
        addresses.dedup();

        assert_eq!(addresses.len(), 32);
        assert_eq!(registry.len(), 32);
    }
}
