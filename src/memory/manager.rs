use std::sync::Arc;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use parking_lot::MutexGuard;
use tracing::{debug, info, warn};
use crate::config::BridgeConfig;
use crate::memory::{
    BridgeError, BridgeResult, CompatibilityFn, GcCallback, GcCallbackId, GcRegistry, LanguageId,
    OwnershipRegistry, Permissions, ReferenceCounter, RegionFlags, RegionHandle, RegionInfo,
    RestoreReport, ShareFlags, SnapshotId, UserData,
};
use crate::memory::ownership::{Backing, RegistryTable};
use crate::memory::snapshot::{Snapshot, SnapshotRegistry};
use crate::pool::{create_pool, PoolError, SharedPool};

/// Point-in-time counters describing a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    pub live_regions: usize,
    pub bytes_tracked: usize,
    pub referenced_regions: usize,
    pub snapshots: usize,
    pub gc_callbacks: usize,
    pub pool_capacity: usize,
    pub pool_bytes_in_use: usize,
}

/// The MemoryManager coordinates every cross-language memory operation.
///
/// Lock order is ownership registry, then reference counter, then the pool.
/// `notify_gc` takes the GC lock before the ownership registry.
pub struct MemoryManager {
    registry: OwnershipRegistry,
    counter: ReferenceCounter,
    gc: GcRegistry,
    snapshots: SnapshotRegistry,
    pool: Arc<dyn SharedPool>,
    strict_ownership: bool,
    compatibility: Option<CompatibilityFn>,
    /// Only flipped to false while the ownership lock is held
    active: AtomicBool,
}

impl From<PoolError> for BridgeError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::InvalidSize(_) => BridgeError::InvalidParameters(format!("{}", err)),
            PoolError::Exhausted { .. } | PoolError::AllocationFailed(_) => {
                BridgeError::OutOfMemory(format!("{}", err))
            }
        }
    }
}

impl MemoryManager {
    /// Create a new bridge with the default configuration
    pub fn new() -> BridgeResult<Self> {
        Self::with_config(BridgeConfig::default())
    }

    /// Create a new bridge, picking the pool from `shared_pool_size`
    pub fn with_config(config: BridgeConfig) -> BridgeResult<Self> {
        let pool = create_pool(config.shared_pool_size);
        Self::with_pool(config, pool)
    }

    /// Build a bridge on top of a caller-provided pool
    pub fn with_pool(config: BridgeConfig, pool: Arc<dyn SharedPool>) -> BridgeResult<Self> {
        let manager = Self {
            registry: OwnershipRegistry::with_capacity(config.ownership_capacity),
            counter: ReferenceCounter::with_capacity(config.reference_capacity),
            gc: GcRegistry::new(config.gc_notifications),
            snapshots: SnapshotRegistry::new(),
            pool,
            strict_ownership: config.strict_ownership,
            compatibility: config.compatibility,
            active: AtomicBool::new(true),
        };

        // The global callback listens to every language
        if let Some(callback) = config.global_gc_callback {
            if manager.gc.is_enabled() {
                manager.gc.register(None, callback, None)?;
            } else {
                warn!("global GC callback ignored while notifications are disabled");
            }
        }

        debug!(
            pool_capacity = manager.pool.capacity(),
            strict = manager.strict_ownership,
            gc = manager.gc.is_enabled(),
            "memory bridge initialized"
        );
        Ok(manager)
    }

    /// Get the ownership registry
    pub fn registry(&self) -> &OwnershipRegistry {
        &self.registry
    }

    /// Get the reference counter
    pub fn reference_counter(&self) -> &ReferenceCounter {
        &self.counter
    }

    /// Get the GC notification registry
    pub fn gc_registry(&self) -> &GcRegistry {
        &self.gc
    }

    /// Get the pool backing bridge-owned regions
    pub fn pool(&self) -> &Arc<dyn SharedPool> {
        &self.pool
    }

    /// Whether the bridge still accepts operations
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> BridgeResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(BridgeError::InvalidState("memory bridge has been shut down".to_string()))
        }
    }

    /// Take the ownership lock, failing if the bridge was shut down while
    /// the caller waited for it
    fn lock_active(&self) -> BridgeResult<MutexGuard<'_, RegistryTable>> {
        let table = self.registry.lock();
        self.ensure_active()?;
        Ok(table)
    }

    /// In strict mode only the owner, or a language the predicate accepts,
    /// may touch a region
    fn check_compatible(&self, info: &RegionInfo, language: &LanguageId) -> BridgeResult<()> {
        if !self.strict_ownership || info.is_owned_by(language) {
            return Ok(());
        }
        let accepted = self
            .compatibility
            .as_ref()
            .map_or(false, |predicate| predicate(&info.owner, language));
        if accepted {
            Ok(())
        } else {
            Err(BridgeError::IncompatibleLanguage {
                owner: info.owner.clone(),
                requester: language.clone(),
            })
        }
    }

    /// Allocate, register and seed a bridge-owned region. Unwinds fully on failure.
    fn alloc_locked(&self, table: &mut RegistryTable, size: usize, owner: &LanguageId, permissions: Permissions, flags: RegionFlags) -> BridgeResult<RegionHandle> {
        table.reserve(1)?;
        let buffer = self.pool.pool_alloc(size)?;
        let handle = table.add(Backing::Pooled(buffer), size, owner.clone(), permissions, flags);

        if !self.counter.lock().increment(handle) {
            if let Some(entry) = table.remove(handle) {
                entry.backing.release(&*self.pool);
            }
            return Err(BridgeError::OutOfMemory("reference table growth failed".to_string()));
        }
        Ok(handle)
    }

    /// Register memory the bridge does not own, seeded with one holder
    fn track_locked(&self, table: &mut RegistryTable, ptr: RegionHandle, size: usize, owner: &LanguageId, permissions: Permissions) -> BridgeResult<RegionHandle> {
        if ptr.is_tagged() {
            return Err(BridgeError::InvalidParameters(format!("{} was issued by the bridge", ptr)));
        }
        if table.contains_address(ptr.address()) {
            return Err(BridgeError::InvalidParameters(format!("{} is already tracked", ptr)));
        }
        table.reserve(1)?;
        // SAFETY: untagged handles only come from `RegionHandle::from_raw`,
        // whose contract covers `size` bytes while the region is tracked
        let backing = unsafe { Backing::foreign(ptr, size) }
            .ok_or_else(|| BridgeError::InvalidParameters("null pointer".to_string()))?;
        let handle = table.add(backing, size, owner.clone(), permissions, RegionFlags::empty());

        if !self.counter.lock().increment(handle) {
            table.remove(handle);
            return Err(BridgeError::OutOfMemory("reference table growth failed".to_string()));
        }
        Ok(handle)
    }

    /// Remove a region and give its bytes back. Runs under the ownership lock.
    fn deallocate(&self, table: &mut RegistryTable, handle: RegionHandle) {
        if let Some(entry) = table.remove(handle) {
            self.counter.lock().forget(handle);
            debug!(%handle, size = entry.info.size, foreign = entry.backing.is_foreign(), "region released");
            entry.backing.release(&*self.pool);
        }
    }

    /// Empty the registry and the counts, returning pooled buffers. Runs
    /// under the ownership lock.
    fn release_locked(&self, table: &mut RegistryTable) -> usize {
        let live = table.drain();
        self.counter.lock().clear();
        let released = live.len();
        for entry in live {
            entry.backing.release(&*self.pool);
        }
        released
    }

    /// Allocate `size` zeroed bytes owned by `owner`, readable and writable,
    /// with one holder. Only `AUTO_FREE` is taken from `flags`, and it is
    /// always set.
    pub fn alloc_shared(&self, size: usize, owner: &LanguageId, flags: RegionFlags) -> BridgeResult<RegionHandle> {
        self.ensure_active()?;
        if size == 0 {
            return Err(BridgeError::InvalidParameters("allocation size must be non-zero".to_string()));
        }

        let mut table = self.lock_active()?;
        let handle = self.alloc_locked(
            &mut table,
            size,
            owner,
            Permissions::READ | Permissions::WRITE,
            (flags & RegionFlags::AUTO_FREE) | RegionFlags::AUTO_FREE,
        )?;
        debug!(%handle, size, %owner, "region allocated");
        Ok(handle)
    }

    /// Give up the owner's hold on a region. The bytes are released only once
    /// no holder remains.
    pub fn free_shared(&self, ptr: RegionHandle, language: &LanguageId) -> BridgeResult<()> {
        self.ensure_active()?;

        let mut table = self.lock_active()?;
        let entry = table.find(ptr).ok_or(BridgeError::InvalidMemoryRegion(ptr))?;
        if !entry.info.is_owned_by(language) {
            return Err(BridgeError::PermissionDenied(format!(
                "{} is owned by {}, not {}",
                entry.info.handle, entry.info.owner, language
            )));
        }

        let handle = entry.info.handle;
        let remaining = self.counter.lock().decrement(handle);
        if remaining == 0 {
            self.deallocate(&mut table, handle);
        }
        Ok(())
    }

    /// Make a region visible to another language.
    ///
    /// `COPY` wins over `TRANSFER`, which wins over a plain reference share.
    /// An untracked `ptr` is registered on behalf of `source` even when
    /// `TRANSFER` is requested.
    pub fn share(&self, ptr: RegionHandle, size: usize, source: &LanguageId, target: &LanguageId, flags: ShareFlags) -> BridgeResult<RegionInfo> {
        self.ensure_active()?;
        if ptr.is_null() || size == 0 {
            return Err(BridgeError::InvalidParameters("share needs a non-null pointer and size".to_string()));
        }

        let mut table = self.lock_active()?;

        // Validate against the existing descriptor, if any
        let existing = table.find(ptr).map(|entry| entry.info.clone());
        if let Some(info) = &existing {
            if !info.is_owned_by(source) {
                return Err(BridgeError::PermissionDenied(format!(
                    "{} is owned by {}, not {}",
                    info.handle, info.owner, source
                )));
            }
            if size > info.size {
                return Err(BridgeError::InvalidParameters(format!(
                    "share of {} bytes exceeds {} of {} bytes",
                    size, info.handle, info.size
                )));
            }
        } else if ptr.is_tagged() {
            return Err(BridgeError::InvalidMemoryRegion(ptr));
        }

        // Copy into a fresh region owned by the target
        if flags.contains(ShareFlags::COPY) {
            let content = match table.find(ptr) {
                Some(entry) => entry.content()[..size].to_vec(),
                // SAFETY: untagged handle, covered by the `from_raw` contract
                None => unsafe { std::slice::from_raw_parts(ptr.address() as *const u8, size) }.to_vec(),
            };
            let handle = self.alloc_locked(
                &mut table,
                size,
                target,
                Permissions::READ | Permissions::WRITE,
                RegionFlags::AUTO_FREE,
            )?;
            let entry = table
                .find_mut(handle)
                .ok_or(BridgeError::InvalidMemoryRegion(handle))?;
            entry.content_mut().copy_from_slice(&content);
            debug!(from = %ptr, to = %handle, size, %source, %target, "region copied");
            return Ok(entry.info.clone());
        }

        match existing {
            // Hand the descriptor over; holders are unchanged
            Some(info) if flags.contains(ShareFlags::TRANSFER) => {
                let entry = table
                    .find_mut(info.handle)
                    .ok_or(BridgeError::InvalidMemoryRegion(info.handle))?;
                entry.info.owner = target.clone();
                debug!(handle = %info.handle, %source, %target, "ownership transferred");
                Ok(entry.info.clone())
            }
            // Share by reference: narrow permissions and add a holder
            Some(info) => {
                let entry = table
                    .find_mut(info.handle)
                    .ok_or(BridgeError::InvalidMemoryRegion(info.handle))?;
                if flags.contains(ShareFlags::READ_ONLY) {
                    entry.info.permissions.remove(Permissions::WRITE);
                }
                if flags.contains(ShareFlags::TEMPORARY) {
                    entry.info.flags.insert(RegionFlags::AUTO_FREE);
                }
                if !self.counter.lock().increment(info.handle) {
                    return Err(BridgeError::OutOfMemory("reference table growth failed".to_string()));
                }
                debug!(handle = %info.handle, %source, %target, ?flags, "region shared");
                Ok(entry.info.clone())
            }
            // First sight of this memory: track it for the source
            None => {
                if flags.contains(ShareFlags::TRANSFER) {
                    warn!(%ptr, %source, %target, "transfer of untracked memory keeps the source as owner");
                }
                let permissions = if flags.contains(ShareFlags::READ_ONLY) {
                    Permissions::READ
                } else {
                    Permissions::READ | Permissions::WRITE
                };
                let handle = self.track_locked(&mut table, ptr, size, source, permissions)?;
                debug!(%handle, size, %source, %target, "untracked region shared");
                table
                    .find(handle)
                    .map(|entry| entry.info.clone())
                    .ok_or(BridgeError::InvalidMemoryRegion(handle))
            }
        }
    }

    /// Register memory allocated by `language` so other runtimes can see it.
    /// The bridge never frees these bytes.
    pub fn track_reference(&self, ptr: RegionHandle, size: usize, language: &LanguageId) -> BridgeResult<RegionHandle> {
        self.ensure_active()?;
        if ptr.is_null() || size == 0 {
            return Err(BridgeError::InvalidParameters("track needs a non-null pointer and size".to_string()));
        }

        let mut table = self.lock_active()?;
        let handle = self.track_locked(&mut table, ptr, size, language, Permissions::READ | Permissions::WRITE)?;
        debug!(%handle, size, %language, "foreign region tracked");
        Ok(handle)
    }

    /// Take a hold on a region with the given access
    pub fn acquire(&self, ptr: RegionHandle, language: &LanguageId, requested: Permissions) -> BridgeResult<()> {
        self.ensure_active()?;

        let table = self.lock_active()?;
        let entry = table.find(ptr).ok_or(BridgeError::InvalidMemoryRegion(ptr))?;
        if requested.contains(Permissions::WRITE) && !entry.info.is_writable() {
            return Err(BridgeError::PermissionDenied(format!(
                "{} is read-only",
                entry.info.handle
            )));
        }
        self.check_compatible(&entry.info, language)?;

        if !self.counter.lock().increment(entry.info.handle) {
            return Err(BridgeError::OutOfMemory("reference table growth failed".to_string()));
        }
        Ok(())
    }

    /// Drop a hold. When the last hold goes on an `AUTO_FREE` region, only the
    /// owner may trigger the release; the decrement stands either way.
    pub fn release(&self, ptr: RegionHandle, language: &LanguageId) -> BridgeResult<()> {
        self.ensure_active()?;

        let mut table = self.lock_active()?;
        let info = table
            .find(ptr)
            .map(|entry| entry.info.clone())
            .ok_or(BridgeError::InvalidMemoryRegion(ptr))?;

        let remaining = self.counter.lock().decrement(info.handle);
        if remaining == 0 && info.is_auto_free() {
            // Last hold gone; only the owner may free
            if !info.is_owned_by(language) {
                warn!(handle = %info.handle, owner = %info.owner, %language, "non-owner released the last hold");
                return Err(BridgeError::PermissionDenied(format!(
                    "only {} may release {}",
                    info.owner, info.handle
                )));
            }
            self.deallocate(&mut table, info.handle);
        }
        Ok(())
    }

    /// Publish writes made by `language` to the first `size` bytes to every
    /// other holder. This is a fence; no bytes move.
    pub fn synchronize(&self, ptr: RegionHandle, size: usize, language: &LanguageId) -> BridgeResult<()> {
        self.ensure_active()?;

        {
            let table = self.registry.lock();
            let entry = table.find(ptr).ok_or(BridgeError::InvalidMemoryRegion(ptr))?;
            if size == 0 || size > entry.info.size {
                return Err(BridgeError::InvalidParameters(format!(
                    "cannot synchronize {} bytes of {} ({} bytes)",
                    size, entry.info.handle, entry.info.size
                )));
            }
            if !entry.info.is_writable() {
                return Err(BridgeError::PermissionDenied(format!(
                    "{} is read-only",
                    entry.info.handle
                )));
            }
            self.check_compatible(&entry.info, language)?;
        }

        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Get a copy of the descriptor a handle resolves to
    pub fn get_region_info(&self, ptr: RegionHandle) -> BridgeResult<RegionInfo> {
        self.ensure_active()?;
        self.registry.find(ptr).ok_or(BridgeError::InvalidMemoryRegion(ptr))
    }

    /// Current number of holders; zero for unknown regions
    pub fn ref_count(&self, ptr: RegionHandle) -> usize {
        let table = self.registry.lock();
        let handle = table.find(ptr).map_or(ptr, |entry| entry.info.handle);
        self.counter.get_count(handle)
    }

    /// Copy `len` bytes starting at `offset` out of a region
    pub fn read_bytes(&self, ptr: RegionHandle, language: &LanguageId, offset: usize, len: usize) -> BridgeResult<Vec<u8>> {
        self.ensure_active()?;

        let table = self.registry.lock();
        let entry = table.find(ptr).ok_or(BridgeError::InvalidMemoryRegion(ptr))?;
        if !entry.info.permissions.contains(Permissions::READ) {
            return Err(BridgeError::PermissionDenied(format!("{} is not readable", entry.info.handle)));
        }
        self.check_compatible(&entry.info, language)?;

        let range = byte_range(&entry.info, offset, len)?;
        Ok(entry.content()[range].to_vec())
    }

    /// Copy `data` into a region starting at `offset`
    pub fn write_bytes(&self, ptr: RegionHandle, language: &LanguageId, offset: usize, data: &[u8]) -> BridgeResult<()> {
        self.ensure_active()?;

        let mut table = self.lock_active()?;
        let entry = table.find_mut(ptr).ok_or(BridgeError::InvalidMemoryRegion(ptr))?;
        if !entry.info.is_writable() {
            return Err(BridgeError::PermissionDenied(format!("{} is read-only", entry.info.handle)));
        }
        self.check_compatible(&entry.info, language)?;

        let range = byte_range(&entry.info, offset, data.len())?;
        entry.content_mut()[range].copy_from_slice(data);
        Ok(())
    }

    /// Listen for GC passes of one language, or of every language when
    /// `language` is `None`
    pub fn register_gc_callback(&self, language: Option<LanguageId>, callback: GcCallback, user_data: Option<UserData>) -> BridgeResult<GcCallbackId> {
        self.ensure_active()?;
        self.gc.register(language, callback, user_data)
    }

    /// Remove a callback registered with `register_gc_callback`
    pub fn unregister_gc_callback(&self, id: GcCallbackId) -> BridgeResult<()> {
        self.ensure_active()?;
        self.gc.unregister(id)
    }

    /// Signal that `language` started a GC pass: mark its regions `IN_GC` and
    /// run the matching callbacks with the GC lock held. Marks are never
    /// cleared. Returns the number of regions marked.
    pub fn notify_gc(&self, language: &LanguageId) -> BridgeResult<usize> {
        self.ensure_active()?;
        self.gc.ensure_enabled()?;

        let callbacks = self.gc.lock();

        // Mark first, then release the ownership lock before any callback runs
        let marked = {
            let mut table = self.lock_active()?;
            let mut marked = 0;
            for entry in table.iter_mut().filter(|entry| entry.info.is_owned_by(language)) {
                entry.info.flags.insert(RegionFlags::IN_GC);
                marked += 1;
            }
            marked
        };
        let invoked = callbacks.dispatch(language);

        info!(%language, marked, invoked, "GC pass started");
        Ok(marked)
    }

    /// Deep-copy every live region and its bytes
    pub fn create_snapshot(&self, language: &LanguageId) -> BridgeResult<SnapshotId> {
        self.ensure_active()?;

        let table = self.lock_active()?;
        let snapshot = Snapshot::capture(self.snapshots.next_id(), language.clone(), &table)?;
        let id = snapshot.id;
        info!(%id, %language, regions = snapshot.regions.len(), bytes = snapshot.total_bytes(), "snapshot created");

        // Inserted under the ownership lock so a concurrent shutdown clears it
        self.snapshots.insert(snapshot);
        Ok(id)
    }

    /// Replace the whole registry with a snapshot's contents and consume it.
    ///
    /// Every handle issued before the call dangles afterwards, including
    /// regions created after the snapshot; the report maps captured handles
    /// to their replacements.
    pub fn restore_snapshot(&self, id: SnapshotId, language: &LanguageId) -> BridgeResult<RestoreReport> {
        self.ensure_active()?;

        let snapshot = self.snapshots.take(id, language)?;
        let mut table = self.lock_active()?;
        let mut counts = self.counter.lock();

        // Draw every replacement before touching live state
        let buffers = match snapshot.allocate_replacements(&*self.pool) {
            Ok(buffers) => buffers,
            Err(err) => {
                drop(counts);
                drop(table);
                self.snapshots.insert(snapshot);
                return Err(err);
            }
        };
        if table.reserve(snapshot.regions.len()).is_err() || !counts.reserve(snapshot.regions.len()) {
            for buffer in buffers {
                self.pool.pool_free(buffer);
            }
            drop(counts);
            drop(table);
            self.snapshots.insert(snapshot);
            return Err(BridgeError::OutOfMemory(format!("table growth for {} failed", id)));
        }

        // Tear down the live registry
        let live = table.drain();
        counts.clear();
        let released = live.len();
        for entry in live {
            entry.backing.release(&*self.pool);
        }

        // Register the saved regions with fresh handles and one holder each
        let mut remapped = Vec::with_capacity(snapshot.regions.len());
        for (saved, buffer) in snapshot.regions.into_iter().zip(buffers) {
            let handle = table.add(Backing::Pooled(buffer), saved.size, saved.owner, saved.permissions, saved.flags);
            counts.increment(handle);
            remapped.push((saved.original, handle));
        }

        info!(%id, %language, released, restored = remapped.len(), "snapshot restored");
        Ok(RestoreReport {
            snapshot: id,
            remapped,
            released,
        })
    }

    /// Drop a snapshot without restoring it
    pub fn discard_snapshot(&self, id: SnapshotId, language: &LanguageId) -> BridgeResult<()> {
        self.ensure_active()?;
        self.snapshots.take(id, language)?;
        debug!(%id, %language, "snapshot discarded");
        Ok(())
    }

    /// Ids of the snapshots still held, in creation order
    pub fn snapshot_ids(&self) -> Vec<SnapshotId> {
        self.snapshots.ids()
    }

    /// Release every region, snapshot and callback. Later operations fail
    /// with `InvalidState`.
    pub fn shutdown(&self) -> BridgeResult<()> {
        // Close under the ownership lock so nothing registers after the drain
        let released = {
            let mut table = self.registry.lock();
            if !self.active.swap(false, Ordering::AcqRel) {
                return Err(BridgeError::InvalidState("memory bridge is already shut down".to_string()));
            }
            self.snapshots.clear();
            self.release_locked(&mut table)
        };
        self.gc.clear();

        info!(released, "memory bridge shut down");
        Ok(())
    }

    /// Take a snapshot of the bridge's counters
    pub fn stats(&self) -> BridgeStats {
        let (live_regions, bytes_tracked) = {
            let table = self.registry.lock();
            (table.len(), table.bytes_tracked())
        };
        BridgeStats {
            live_regions,
            bytes_tracked,
            referenced_regions: self.counter.tracked(),
            snapshots: self.snapshots.len(),
            gc_callbacks: self.gc.len(),
            pool_capacity: self.pool.capacity(),
            pool_bytes_in_use: self.pool.bytes_in_use(),
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        // Return whatever is still registered, whether or not shutdown ran
        self.active.store(false, Ordering::Release);
        let mut table = self.registry.lock();
        let released = self.release_locked(&mut table);
        if released > 0 {
            debug!(released, "memory bridge dropped");
        }
    }
}

fn byte_range(info: &RegionInfo, offset: usize, len: usize) -> BridgeResult<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= info.size => Ok(offset..end),
        _ => Err(BridgeError::InvalidParameters(format!(
            "range {}+{} is outside {} ({} bytes)",
            offset, len, info.handle, info.size
        ))),
    }
}
