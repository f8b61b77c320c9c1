//! Fiber-specific storage
//!
//! Per-fiber keyed storage: opaque pointer-sized keys map to raw value
//! pointers paired with an optional cleanup function. On fiber
//! termination every surviving cleanup runs exactly once, in
//! unspecified order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cleanup function invoked with the stored value pointer
///
/// The registrant guarantees the function is sound to call exactly once
/// with the pointer it was registered alongside.
pub type FssCleanup = unsafe fn(*mut u8);

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Opaque key into fiber-specific storage
///
/// Keys are process-wide unique and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct FssKey(u64);

impl FssKey {
    /// Allocate a fresh key
    pub fn next() -> Self {
        FssKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

struct FssEntry {
    value: *mut u8,
    cleanup: Option<FssCleanup>,
}

/// Per-fiber storage map, guarded by the owning context's spinlock
pub struct FssMap {
    entries: HashMap<FssKey, FssEntry>,
}

impl FssMap {
    pub fn new() -> Self {
        FssMap {
            entries: HashMap::new(),
        }
    }

    /// Look up the value bound to `key`, null if unbound
    pub fn get(&self, key: FssKey) -> *mut u8 {
        self.entries
            .get(&key)
            .map(|e| e.value)
            .unwrap_or(std::ptr::null_mut())
    }

    /// Bind `value` (with `cleanup`) to `key`
    ///
    /// A null `value` erases the binding. An existing binding is only
    /// cleaned up when `cleanup_existing` is set; otherwise the old value
    /// is dropped on the floor, which is the caller's explicit choice.
    pub fn set(
        &mut self,
        key: FssKey,
        cleanup: Option<FssCleanup>,
        value: *mut u8,
        cleanup_existing: bool,
    ) {
        if let Some(old) = self.entries.remove(&key) {
            if cleanup_existing && !old.value.is_null() {
                if let Some(run) = old.cleanup {
                    // Safety: contract established when the binding was set
                    unsafe { run(old.value) };
                }
            }
        }
        if !value.is_null() {
            self.entries.insert(key, FssEntry { value, cleanup });
        }
    }

    /// Remove and return the binding for `key` without running cleanup
    ///
    /// Lets a caller lift the old value out of a locked region and run
    /// its cleanup elsewhere.
    pub fn take(&mut self, key: FssKey) -> Option<(*mut u8, Option<FssCleanup>)> {
        self.entries.remove(&key).map(|e| (e.value, e.cleanup))
    }

    /// Invoke every surviving cleanup and clear the map
    ///
    /// Called once, at fiber termination.
    pub fn run_cleanups(&mut self) {
        for (_, entry) in self.entries.drain() {
            if entry.value.is_null() {
                continue;
            }
            if let Some(run) = entry.cleanup {
                // Safety: contract established when the binding was set
                unsafe { run(entry.value) };
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FssMap {
    fn default() -> Self {
        FssMap::new()
    }
}
