//! Bridge configuration options
//!
//! Values can be set with the builder methods or loaded from the
//! environment. Callbacks and predicates can only be set in code.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `BRIDGE_POOL_SIZE` | Shared pool capacity in bytes (0 = general allocator) | 0 |
//! | `BRIDGE_OWNERSHIP_CAPACITY` | Initial ownership table capacity | 64 |
//! | `BRIDGE_REFERENCE_CAPACITY` | Initial reference table capacity | 64 |
//! | `BRIDGE_GC_NOTIFICATIONS` | Enable GC notifications ("true"/"false") | true |
//! | `BRIDGE_STRICT_OWNERSHIP` | Refuse non-owner access unless compatible | false |

use std::env;
use std::fmt;
use crate::memory::{CompatibilityFn, GcCallback, LanguageId};

/// Configuration options for a `MemoryManager`
#[derive(Clone)]
pub struct BridgeConfig {
    pub shared_pool_size: usize,
    pub ownership_capacity: usize,
    pub reference_capacity: usize,
    pub gc_notifications: bool,
    pub global_gc_callback: Option<GcCallback>,
    pub strict_ownership: bool,
    pub compatibility: Option<CompatibilityFn>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shared_pool_size: 0,
            ownership_capacity: 64,
            reference_capacity: 64,
            gc_notifications: true,
            global_gc_callback: None,
            strict_ownership: false,
            compatibility: None,
        }
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("shared_pool_size", &self.shared_pool_size)
            .field("ownership_capacity", &self.ownership_capacity)
            .field("reference_capacity", &self.reference_capacity)
            .field("gc_notifications", &self.gc_notifications)
            .field("global_gc_callback", &self.global_gc_callback.is_some())
            .field("strict_ownership", &self.strict_ownership)
            .field("compatibility", &self.compatibility.is_some())
            .finish()
    }
}

impl BridgeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `BRIDGE_*` variables that parse
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("BRIDGE_POOL_SIZE") {
            config.shared_pool_size = val;
        }
        if let Some(val) = parse_env_usize("BRIDGE_OWNERSHIP_CAPACITY") {
            config.ownership_capacity = val;
        }
        if let Some(val) = parse_env_usize("BRIDGE_REFERENCE_CAPACITY") {
            config.reference_capacity = val;
        }
        if let Some(val) = parse_env_bool("BRIDGE_GC_NOTIFICATIONS") {
            config.gc_notifications = val;
        }
        if let Some(val) = parse_env_bool("BRIDGE_STRICT_OWNERSHIP") {
            config.strict_ownership = val;
        }

        config
    }

    /// Back allocations with a bounded pool of this many bytes
    pub fn with_shared_pool_size(mut self, size: usize) -> Self {
        self.shared_pool_size = size;
        self
    }

    /// Set the initial ownership table capacity
    pub fn with_ownership_capacity(mut self, capacity: usize) -> Self {
        self.ownership_capacity = capacity;
        self
    }

    /// Set the initial reference table capacity
    pub fn with_reference_capacity(mut self, capacity: usize) -> Self {
        self.reference_capacity = capacity;
        self
    }

    /// Enable or disable GC notifications
    pub fn with_gc_notifications(mut self, enabled: bool) -> Self {
        self.gc_notifications = enabled;
        self
    }

    /// Listener invoked for every language's GC pass. Enables notifications.
    pub fn with_global_gc_callback(mut self, callback: GcCallback) -> Self {
        self.gc_notifications = true;
        self.global_gc_callback = Some(callback);
        self
    }

    /// Refuse access by non-owners unless the compatibility predicate allows it
    pub fn with_strict_ownership(mut self, strict: bool) -> Self {
        self.strict_ownership = strict;
        self
    }

    /// Predicate `(owner, requester)` consulted in strict mode
    pub fn with_compatibility<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&LanguageId, &LanguageId) -> bool + Send + Sync + 'static,
    {
        self.compatibility = Some(std::sync::Arc::new(predicate));
        self
    }
}

/// Parse an environment variable as `usize`, ignoring unset or bad values
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse an environment variable as a boolean flag
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|v| match v.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}
