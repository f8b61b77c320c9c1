//! Runtime configuration

use crate::stack::MIN_STACK_SIZE;
use std::time::Duration;
use strand_core::env::env_get;

/// Default usable stack size per fiber (256 KiB)
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Per-thread runtime configuration
///
/// Picked up when the thread's scheduler is bootstrapped; later changes
/// have no effect on that thread.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Usable stack size per fiber (and for the dispatcher)
    pub stack_size: usize,

    /// Upper bound on a single idle park when no deadline is pending
    pub park_max: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", DEFAULT_STACK_SIZE),
            park_max: Duration::from_millis(env_get("STRAND_PARK_MAX_MS", 100u64)),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-fiber stack size
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Set the idle park cap
    pub fn park_max(mut self, d: Duration) -> Self {
        self.park_max = d;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err("stack_size below minimum");
        }
        if self.park_max.is_zero() {
            return Err("park_max must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = RuntimeConfig::new()
            .stack_size(1024 * 1024)
            .park_max(Duration::from_millis(5));
        assert_eq!(config.stack_size, 1024 * 1024);
        assert_eq!(config.park_max, Duration::from_millis(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        assert!(RuntimeConfig::new().stack_size(1).validate().is_err());
        assert!(RuntimeConfig::new()
            .park_max(Duration::ZERO)
            .validate()
            .is_err());
    }
}
