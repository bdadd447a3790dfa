// Polybridge - Shared memory between language runtimes

pub mod config;
pub mod memory;
pub mod pool;

pub use config::BridgeConfig;
pub use memory::{
    BridgeError, BridgeResult, BridgeStats, GcCallback, GcCallbackId, GcEvent, LanguageId, MemoryManager,
    Permissions, RegionFlags, RegionHandle, RegionInfo, RestoreReport, ShareFlags, SnapshotId,
};
pub use pool::{BytePool, SharedPool, SystemPool};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
