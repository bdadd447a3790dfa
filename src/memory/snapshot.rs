use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use dashmap::DashMap;
use crate::memory::{BridgeError, BridgeResult, LanguageId, Permissions, RegionFlags, RegionHandle};
use crate::memory::ownership::RegistryTable;
use crate::pool::SharedPool;

/// Identifies a snapshot; ids increase monotonically from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(u64);

impl SnapshotId {
    /// Wrap a raw snapshot id
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw id
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot-{}", self.0)
    }
}

/// Deep copy of one region
pub(crate) struct SavedRegion {
    pub(crate) original: RegionHandle,
    pub(crate) size: usize,
    pub(crate) owner: LanguageId,
    pub(crate) permissions: Permissions,
    pub(crate) flags: RegionFlags,
    pub(crate) content: Vec<u8>,
}

/// Immutable capture of the whole ownership registry
pub(crate) struct Snapshot {
    pub(crate) id: SnapshotId,
    pub(crate) creator: LanguageId,
    pub(crate) regions: Vec<SavedRegion>,
}

impl Snapshot {
    /// Copy every descriptor and its bytes. Runs under the ownership lock.
    pub(crate) fn capture(id: SnapshotId, creator: LanguageId, table: &RegistryTable) -> BridgeResult<Self> {
        let mut regions = Vec::new();
        regions
            .try_reserve_exact(table.len())
            .map_err(|_| BridgeError::OutOfMemory(format!("{} table allocation failed", id)))?;

        for entry in table.iter() {
            let mut content = Vec::new();
            content
                .try_reserve_exact(entry.info.size)
                .map_err(|_| BridgeError::OutOfMemory(format!("{} copy of {} failed", id, entry.info.handle)))?;
            content.extend_from_slice(entry.content());

            regions.push(SavedRegion {
                original: entry.info.handle,
                size: entry.info.size,
                owner: entry.info.owner.clone(),
                permissions: entry.info.permissions,
                flags: entry.info.flags,
                content,
            });
        }

        Ok(Self { id, creator, regions })
    }

    /// Draw a fresh buffer for every saved region and fill it with the saved
    /// bytes. Nothing is kept if any allocation fails.
    pub(crate) fn allocate_replacements(&self, pool: &dyn SharedPool) -> BridgeResult<Vec<Box<[u8]>>> {
        let mut buffers: Vec<Box<[u8]>> = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            match pool.pool_alloc(region.size) {
                Ok(mut buffer) => {
                    buffer[..region.size].copy_from_slice(&region.content);
                    buffers.push(buffer);
                }
                Err(err) => {
                    for buffer in buffers {
                        pool.pool_free(buffer);
                    }
                    return Err(BridgeError::OutOfMemory(format!(
                        "restoring {} needs {} bytes: {}",
                        self.id, region.size, err
                    )));
                }
            }
        }
        Ok(buffers)
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.regions.iter().map(|region| region.size).sum()
    }
}

/// Outcome of a restore: where every saved region now lives.
///
/// Handles held before the restore are dangling; adapters re-resolve them
/// through `resolve`.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub snapshot: SnapshotId,
    /// `(handle at capture time, handle after restore)`
    pub remapped: Vec<(RegionHandle, RegionHandle)>,
    /// Live regions torn down by the restore
    pub released: usize,
}

impl RestoreReport {
    /// New handle for a region that was live when the snapshot was taken
    pub fn resolve(&self, old: RegionHandle) -> Option<RegionHandle> {
        self.remapped
            .iter()
            .find(|(before, _)| *before == old)
            .map(|(_, after)| *after)
    }
}

/// Snapshots keyed by id
pub(crate) struct SnapshotRegistry {
    snapshots: DashMap<SnapshotId, Snapshot>,
    next_id: AtomicU64,
}

impl SnapshotRegistry {
    pub(crate) fn new() -> Self {
        Self {
            snapshots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> SnapshotId {
        SnapshotId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn insert(&self, snapshot: Snapshot) {
        self.snapshots.insert(snapshot.id, snapshot);
    }

    /// Remove a snapshot on behalf of its creator
    pub(crate) fn take(&self, id: SnapshotId, language: &LanguageId) -> BridgeResult<Snapshot> {
        {
            let snapshot = self
                .snapshots
                .get(&id)
                .ok_or_else(|| BridgeError::InvalidParameters(format!("unknown {}", id)))?;
            if &snapshot.creator != language {
                return Err(BridgeError::PermissionDenied(format!(
                    "{} was created by {}, not {}",
                    id, snapshot.creator, language
                )));
            }
        }

        self.snapshots
            .remove_if(&id, |_, snapshot| &snapshot.creator == language)
            .map(|(_, snapshot)| snapshot)
            .ok_or_else(|| BridgeError::InvalidParameters(format!("{} was consumed concurrently", id)))
    }

    pub(crate) fn ids(&self) -> Vec<SnapshotId> {
        let mut ids: Vec<SnapshotId> = self.snapshots.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub(crate) fn clear(&self) {
        self.snapshots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::OwnershipRegistry;
    use crate::memory::ownership::Backing;
    use crate::pool::BytePool;

    fn registry_with(pool: &BytePool, regions: &[(&str, &[u8])]) -> OwnershipRegistry {
        let registry = OwnershipRegistry::with_capacity(regions.len());
        {
            let mut table = registry.lock();
            for (owner, bytes) in regions {
                let mut buffer = pool.pool_alloc(bytes.len()).unwrap();
                buffer[..bytes.len()].copy_from_slice(bytes);
                table.reserve(1).unwrap();
                table.add(
                    Backing::Pooled(buffer),
                    bytes.len(),
                    (*owner).into(),
                    Permissions::READ | Permissions::WRITE,
                    RegionFlags::AUTO_FREE,
                );
            }
        }
        registry
    }

    #[test]
    fn test_snapshot_ids_increase() {
        let snapshots = SnapshotRegistry::new();

        assert_eq!(snapshots.next_id(), SnapshotId::new(1));
        assert_eq!(snapshots.next_id(), SnapshotId::new(2));
        assert_eq!(format!("{}", SnapshotId::new(7)), "snapshot-7");
    }

    #[test]
    fn test_capture_copies_descriptors_and_bytes() {
        let pool = BytePool::new(4096);
        let registry = registry_with(&pool, &[("lang_a", &b"hello"[..]), ("lang_b", &b"world!"[..])]);

        let snapshot = Snapshot::capture(SnapshotId::new(1), "lang_a".into(), &registry.lock()).unwrap();

        assert_eq!(snapshot.regions.len(), 2);
        assert_eq!(snapshot.total_bytes(), 11);

        let mut contents: Vec<&[u8]> = snapshot.regions.iter().map(|r| r.content.as_slice()).collect();
        contents.sort();
        assert_eq!(contents, vec![&b"hello"[..], &b"world!"[..]]);
    }

    #[test]
    fn test_capture_is_independent_of_live_bytes() {
        let pool = BytePool::new(4096);
        let registry = registry_with(&pool, &[("lang_a", &b"abc"[..])]);

        let snapshot = Snapshot::capture(SnapshotId::new(1), "lang_a".into(), &registry.lock()).unwrap();
        for entry in registry.lock().iter_mut() {
            entry.content_mut().fill(b'z');
        }

        assert_eq!(snapshot.regions[0].content, b"abc");
    }

    #[test]
    fn test_allocate_replacements_copies_content() {
        let pool = BytePool::new(4096);
        let registry = registry_with(&pool, &[("lang_a", &b"payload"[..])]);
        let snapshot = Snapshot::capture(SnapshotId::new(1), "lang_a".into(), &registry.lock()).unwrap();

        let buffers = snapshot.allocate_replacements(&pool).unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(&buffers[0][..7], b"payload");
    }

    #[test]
    fn test_allocate_replacements_unwinds_on_exhaustion() {
        let pool = BytePool::new(128);
        let registry = registry_with(&pool, &[("lang_a", &[1u8; 64][..]), ("lang_a", &[2u8; 64][..])]);
        let snapshot = Snapshot::capture(SnapshotId::new(1), "lang_a".into(), &registry.lock()).unwrap();

        // Live regions already use the whole pool
        let result = snapshot.allocate_replacements(&pool);
        assert!(matches!(result, Err(BridgeError::OutOfMemory(_))));
        assert_eq!(pool.bytes_in_use(), 128);
    }

    #[test]
    fn test_take_checks_creator() {
        let snapshots = SnapshotRegistry::new();
        let id = snapshots.next_id();
        snapshots.insert(Snapshot { id, creator: "lang_a".into(), regions: Vec::new() });

        let denied = snapshots.take(id, &"lang_b".into());
        assert!(matches!(denied, Err(BridgeError::PermissionDenied(_))));
        assert_eq!(snapshots.len(), 1);

        let taken = snapshots.take(id, &"lang_a".into()).unwrap();
        assert_eq!(taken.id, id);
        assert_eq!(snapshots.len(), 0);

        let unknown = snapshots.take(id, &"lang_a".into());
        assert!(matches!(unknown, Err(BridgeError::InvalidParameters(_))));
    }

    #[test]
    fn test_ids_sorted() {
        let snapshots = SnapshotRegistry::new();
        for _ in 0..3 {
            let id = snapshots.next_id();
            snapshots.insert(Snapshot { id, creator: "lang_a".into(), regions: Vec::new() });
        }

        assert_eq!(snapshots.ids(), vec![SnapshotId::new(1), SnapshotId::new(2), SnapshotId::new(3)]);
        snapshots.clear();
        assert!(snapshots.ids().is_empty());
    }

    #[test]
    fn test_restore_report_resolve() {
        let old = RegionHandle::from_parts(0x1000, 1);
        let new = RegionHandle::from_parts(0x2000, 1);
        let report = RestoreReport {
            snapshot: SnapshotId::new(1),
            remapped: vec![(old, new)],
            released: 1,
        };

        assert_eq!(report.resolve(old), Some(new));
        assert_eq!(report.resolve(new), None);
    }
}
