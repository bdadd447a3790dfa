use std::fmt;
use bitflags::bitflags;
use crate::memory::LanguageId;

/// Generation carried by handles to memory the bridge has not tagged yet
pub const UNTAGGED: u64 = 0;

/// First generation handed out by a registry
pub const FIRST_GENERATION: u64 = 1;

bitflags! {
    /// Access rights granted on a region
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

bitflags! {
    /// Lifecycle flags of a region
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// The bridge releases the bytes once the last holder lets go
        const AUTO_FREE = 0b01;
        /// The owning runtime has started a GC pass since registration
        const IN_GC = 0b10;
    }
}

bitflags! {
    /// Options for `MemoryManager::share`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShareFlags: u32 {
        const COPY = 0b0001;
        const TRANSFER = 0b0010;
        const READ_ONLY = 0b0100;
        const TEMPORARY = 0b1000;
    }
}

/// Handle identifying a region by address and generation.
///
/// Every registration draws a new generation from a registry-wide counter,
/// so a handle kept past a free never resolves to a newer region at the
/// same address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle {
    address: usize,
    generation: u64,
}

impl RegionHandle {
    pub(crate) fn from_parts(address: usize, generation: u64) -> Self {
        Self { address, generation }
    }

    /// Wrap memory allocated outside the bridge so it can be shared or tracked.
    ///
    /// # Safety
    ///
    /// If the handle is passed to `share` or `track_reference`, `ptr` must be
    /// valid for reads and writes of the size given there, and must stay valid
    /// until the bridge drops its descriptor.
    pub unsafe fn from_raw(ptr: *const u8) -> Self {
        Self {
            address: ptr as usize,
            generation: UNTAGGED,
        }
    }

    /// Create a null handle
    pub fn null() -> Self {
        Self { address: 0, generation: UNTAGGED }
    }

    /// Whether this is the null handle
    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// Raw address of the first byte
    pub fn address(&self) -> usize {
        self.address
    }

    /// Registration generation, or zero for untagged handles
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the handle came from a registration
    pub fn is_tagged(&self) -> bool {
        self.generation != UNTAGGED
    }
}

impl fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "RegionHandle(null)")
        } else {
            write!(f, "RegionHandle(addr={:#x}, gen={})", self.address, self.generation)
        }
    }
}

impl fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "Region@{:#x}#{}", self.address, self.generation)
        }
    }
}

/// Metadata for one cross-language visible allocation.
///
/// The descriptor annotates the bytes; it never owns them. Holder counts live
/// in the `ReferenceCounter` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub handle: RegionHandle,
    pub size: usize,
    pub owner: LanguageId,
    pub permissions: Permissions,
    pub flags: RegionFlags,
}

impl RegionInfo {
    /// Build a descriptor
    pub fn new(handle: RegionHandle, size: usize, owner: LanguageId, permissions: Permissions, flags: RegionFlags) -> Self {
        Self { handle, size, owner, permissions, flags }
    }

    /// Whether `language` owns the region
    pub fn is_owned_by(&self, language: &LanguageId) -> bool {
        &self.owner == language
    }

    /// Whether the region grants `WRITE`
    pub fn is_writable(&self) -> bool {
        self.permissions.contains(Permissions::WRITE)
    }

    /// Whether the region frees itself on its last release
    pub fn is_auto_free(&self) -> bool {
        self.flags.contains(RegionFlags::AUTO_FREE)
    }
}
