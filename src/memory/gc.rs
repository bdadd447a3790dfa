use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::{Mutex, MutexGuard};
use crate::memory::{BridgeError, BridgeResult, LanguageId, RegionHandle};

/// Opaque data handed back to a callback on every invocation
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Listener for garbage-collection passes.
///
/// Callbacks run with the GC lock held and must not call back into the
/// `MemoryManager`.
pub type GcCallback = Arc<dyn Fn(&GcEvent<'_>) + Send + Sync>;

/// What a callback learns about a GC pass
pub struct GcEvent<'a> {
    /// Runtime whose collector started
    pub language: &'a LanguageId,
    /// `None` signals that a pass started rather than naming a freed region
    pub region: Option<RegionHandle>,
    pub user_data: Option<&'a UserData>,
}

/// Identifies a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcCallbackId(u64);

impl fmt::Display for GcCallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gc-callback-{}", self.0)
    }
}

struct GcCallbackEntry {
    id: GcCallbackId,
    /// `None` listens to every language
    language: Option<LanguageId>,
    callback: GcCallback,
    user_data: Option<UserData>,
}

impl GcCallbackEntry {
    fn listens_to(&self, language: &LanguageId) -> bool {
        self.language.as_ref().map_or(true, |l| l == language)
    }
}

/// Callbacks guarded by the GC lock
pub(crate) struct CallbackList {
    entries: Vec<GcCallbackEntry>,
}

impl CallbackList {
    /// Invoke every callback listening to `language`; returns how many ran
    pub(crate) fn dispatch(&self, language: &LanguageId) -> usize {
        let mut invoked = 0;
        for entry in self.entries.iter().filter(|entry| entry.listens_to(language)) {
            let event = GcEvent {
                language,
                region: None,
                user_data: entry.user_data.as_ref(),
            };
            (entry.callback)(&event);
            invoked += 1;
        }
        invoked
    }
}

/// Registry of GC listeners, global or scoped to one language
pub struct GcRegistry {
    enabled: bool,
    callbacks: Mutex<CallbackList>,
    next_id: AtomicU64,
}

impl GcRegistry {
    /// Create a registry; disabled registries refuse callbacks
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            callbacks: Mutex::new(CallbackList { entries: Vec::new() }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Whether GC signalling is on
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn ensure_enabled(&self) -> BridgeResult<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(BridgeError::UnsupportedOperation("GC notifications are disabled".to_string()))
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CallbackList> {
        self.callbacks.lock()
    }

    /// Register a callback for one language, or every language when `language` is `None`
    pub fn register(&self, language: Option<LanguageId>, callback: GcCallback, user_data: Option<UserData>) -> BridgeResult<GcCallbackId> {
        self.ensure_enabled()?;

        let mut callbacks = self.lock();
        callbacks
            .entries
            .try_reserve(1)
            .map_err(|_| BridgeError::OutOfMemory("GC callback list growth failed".to_string()))?;

        let id = GcCallbackId(self.next_id.fetch_add(1, Ordering::SeqCst));
        callbacks.entries.push(GcCallbackEntry { id, language, callback, user_data });
        Ok(id)
    }

    /// Remove a callback by id
    pub fn unregister(&self, id: GcCallbackId) -> BridgeResult<()> {
        self.ensure_enabled()?;

        let mut callbacks = self.lock();
        let position = callbacks
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| BridgeError::InvalidParameters(format!("{} is not registered", id)))?;
        callbacks.entries.remove(position);
        Ok(())
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no callback is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: Arc<AtomicUsize>) -> GcCallback {
        Arc::new(move |_event: &GcEvent<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_register_when_disabled() {
        let registry = GcRegistry::new(false);
        let counter = Arc::new(AtomicUsize::new(0));

        let result = registry.register(None, counting_callback(counter), None);
        assert!(matches!(result, Err(BridgeError::UnsupportedOperation(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_scoped_and_global() {
        let registry = GcRegistry::new(true);
        let global = Arc::new(AtomicUsize::new(0));
        let python = Arc::new(AtomicUsize::new(0));

        registry.register(None, counting_callback(global.clone()), None).unwrap();
        registry.register(Some("python".into()), counting_callback(python.clone()), None).unwrap();

        assert_eq!(registry.lock().dispatch(&"python".into()), 2);
        assert_eq!(registry.lock().dispatch(&"cobol".into()), 1);

        assert_eq!(global.load(Ordering::SeqCst), 2);
        assert_eq!(python.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_carries_user_data_and_no_region() {
        let registry = GcRegistry::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let callback: GcCallback = Arc::new(move |event: &GcEvent<'_>| {
            let tag = event
                .user_data
                .and_then(|data| data.downcast_ref::<u32>())
                .copied();
            seen_clone.lock().push((event.language.to_string(), event.region, tag));
        });
        registry.register(None, callback, Some(Arc::new(42u32))).unwrap();

        registry.lock().dispatch(&"lang_a".into());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("lang_a".to_string(), None, Some(42)));
    }

    #[test]
    fn test_unregister() {
        let registry = GcRegistry::new(true);
        let counter = Arc::new(AtomicUsize::new(0));

        let id = registry.register(None, counting_callback(counter.clone()), None).unwrap();
        assert_eq!(registry.len(), 1);

        registry.unregister(id).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.lock().dispatch(&"lang_a".into()), 0);

        let again = registry.unregister(id);
        assert!(matches!(again, Err(BridgeError::InvalidParameters(_))));
    }

    #[test]
    fn test_callback_ids_unique() {
        let registry = GcRegistry::new(true);
        let counter = Arc::new(AtomicUsize::new(0));

        let a = registry.register(None, counting_callback(counter.clone()), None).unwrap();
        let b = registry.register(None, counting_callback(counter), None).unwrap();

        assert_ne!(a, b);
        assert_eq!(format!("{}", a), "gc-callback-1");
    }
}
