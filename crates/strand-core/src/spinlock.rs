//! Spinlocks for short scheduler critical sections
//!
//! Two flavors: `SpinLock<T>` owns its data and hands out scoped guards,
//! `RawSpinLock` protects fields that live elsewhere (the per-context
//! hook and state locks). Neither is reentrant, and neither may be held
//! across a suspension point.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Maximum pause iterations per backoff round
const BACKOFF_LIMIT: u32 = 64;

#[inline]
fn spin_wait(locked: &AtomicBool) {
    let mut rounds = 0u32;
    while locked.load(Ordering::Relaxed) {
        rounds = rounds.wrapping_add(1);
        for _ in 0..rounds.min(BACKOFF_LIMIT) {
            core::hint::spin_loop();
        }
    }
}

/// A bare test-and-set spinlock with no payload
///
/// Used where the guarded fields live inline in another structure. The
/// guard releases on drop, including during unwinding.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    #[inline]
    pub const fn new() -> Self {
        RawSpinLock {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_wait(&self.locked);
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Acquire the lock, spinning with backoff until available
    #[inline]
    pub fn lock(&self) -> RawSpinLockGuard<'_> {
        self.acquire();
        RawSpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning
    #[inline]
    pub fn try_lock(&self) -> Option<RawSpinLockGuard<'_>> {
        if self.try_acquire() {
            Some(RawSpinLockGuard { lock: self })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        RawSpinLock::new()
    }
}

/// Guard releasing a `RawSpinLock` when dropped
pub struct RawSpinLockGuard<'a> {
    lock: &'a RawSpinLock,
}

impl<'a> Drop for RawSpinLockGuard<'a> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A spinlock owning its data
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// Safety: the lock serializes all access to T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning with backoff until available
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Get mutable access without locking
    ///
    /// Requires exclusive access to the lock itself.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Guard releasing a `SpinLock` when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_raw_lock() {
        let lock = RawSpinLock::new();
        assert!(!lock.is_locked());

        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_spinlock_basic() {
        let lock = SpinLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard = 42;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn test_spinlock_try_lock() {
        let lock = SpinLock::new(0u32);

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_spinlock_contended() {
        let lock = Arc::new(SpinLock::new(0u32));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn test_release_on_unwind() {
        let lock = Arc::new(SpinLock::new(0u32));
        let lock2 = Arc::clone(&lock);

        let result = thread::spawn(move || {
            let _guard = lock2.lock();
            panic!("unwind with guard held");
        })
        .join();
        assert!(result.is_err());

        // Lock was released by the unwinding guard
        assert!(lock.try_lock().is_some());
    }
}
