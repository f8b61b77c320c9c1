//! Kernel-thread parking for the idle dispatcher
//!
//! When a scheduler has nothing runnable it blocks its kernel thread
//! here, until the earliest sleep deadline or a remote wake-up.

use std::time::Duration;

/// Blocking primitive the dispatcher idles on
///
/// Wakes are counted, not edge-triggered: a `wake_one` delivered while
/// nobody is parked is consumed by the next `park`, so a remote ready
/// posted between the dispatcher's last queue check and its park is
/// never lost.
pub trait Parker: Send + Sync {
    /// Block until woken or until `timeout` elapses
    ///
    /// Returns `true` when woken by a signal, `false` on timeout. The
    /// caller re-checks its queues either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake the parked thread (or bank the wake for the next park)
    fn wake_one(&self);
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParker as PlatformParker;
    } else {
        mod fallback;
        pub use fallback::CondvarParker as PlatformParker;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parker = PlatformParker::new();
        let start = Instant::now();
        let woken = parker.park(Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wake_before_park_is_banked() {
        let parker = PlatformParker::new();
        parker.wake_one();

        let start = Instant::now();
        let woken = parker.park(Some(Duration::from_secs(5)));
        assert!(woken);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_cross_thread_wake() {
        let parker = Arc::new(PlatformParker::new());
        let parker2 = Arc::clone(&parker);

        let handle = thread::spawn(move || parker2.park(Some(Duration::from_secs(10))));

        thread::sleep(Duration::from_millis(50));
        parker.wake_one();

        assert!(handle.join().unwrap());
    }
}
