//! Linux futex-based parking
//!
//! The futex word counts pending wakes: `wake_one` increments and wakes,
//! `park` consumes a pending wake or waits on zero.

use super::Parker;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct FutexParker {
    /// Count of pending wakes
    word: AtomicU32,

    /// Count of parked threads, to skip the wake syscall when idle
    parked: AtomicUsize,
}

impl FutexParker {
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    /// Consume one banked wake if any
    fn consume_wake(&self) -> bool {
        let mut current = self.word.load(Ordering::Acquire);
        while current > 0 {
            match self.word.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    /// FUTEX_WAIT while the word is still zero
    fn wait(&self, timeout: Option<Duration>) -> i64 {
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as i64,
            tv_nsec: d.subsec_nanos() as i64,
        });
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                timespec
                    .as_ref()
                    .map_or(std::ptr::null(), |ts| ts as *const libc::timespec),
                std::ptr::null::<u32>(),
                0u32,
            )
        }
    }

    fn wake(&self, count: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Parker for FutexParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        if self.consume_wake() {
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);
        self.wait(timeout);
        self.parked.fetch_sub(1, Ordering::SeqCst);

        // Whether the wait ended by wake, by EAGAIN (the word changed
        // before we slept) or by timeout, a banked wake settles it
        self.consume_wake()
    }

    fn wake_one(&self) {
        self.word.fetch_add(1, Ordering::Release);
        if self.parked.load(Ordering::Acquire) > 0 {
            self.wake(1);
        }
    }
}
