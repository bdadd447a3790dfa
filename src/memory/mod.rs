mod region;
mod ownership;
mod refcount;
mod gc;
mod snapshot;
mod manager;

pub use region::{RegionHandle, RegionInfo, Permissions, RegionFlags, ShareFlags};
pub use ownership::OwnershipRegistry;
pub use refcount::ReferenceCounter;
pub use gc::{GcCallback, GcCallbackId, GcEvent, GcRegistry, UserData};
pub use snapshot::{SnapshotId, RestoreReport};
pub use manager::{MemoryManager, BridgeStats};

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the memory bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Invalid memory region: {0}")]
    InvalidMemoryRegion(RegionHandle),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Language {requester} is not compatible with owner {owner}")]
    IncompatibleLanguage { owner: LanguageId, requester: LanguageId },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Identifier of a participating language runtime
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LanguageId(Arc<str>);

impl LanguageId {
    /// Create an id from a runtime name
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// The runtime name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LanguageId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for LanguageId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl fmt::Debug for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Language({})", self.0)
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Predicate deciding whether `requester` may touch memory owned by `owner`
/// when strict ownership is enabled
pub type CompatibilityFn = Arc<dyn Fn(&LanguageId, &LanguageId) -> bool + Send + Sync>;
