//! Condvar-based parking for platforms without futexes

use super::Parker;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct CondvarParker {
    /// Count of pending wakes
    pending: Mutex<u32>,
    condvar: Condvar,
}

impl CondvarParker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }
}

impl Default for CondvarParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Parker for CondvarParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
            return true;
        }

        match timeout {
            Some(t) => {
                let deadline = std::time::Instant::now() + t;
                loop {
                    let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    let (guard, wait) = self.condvar.wait_timeout(pending, remaining).unwrap();
                    pending = guard;
                    if *pending > 0 {
                        *pending -= 1;
                        return true;
                    }
                    if wait.timed_out() {
                        return false;
                    }
                }
            }
            None => loop {
                pending = self.condvar.wait(pending).unwrap();
                if *pending > 0 {
                    *pending -= 1;
                    return true;
                }
            },
        }
    }

    fn wake_one(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending += 1;
        drop(pending);
        self.condvar.notify_one();
    }
}
