//! Fiber identifier type

use core::fmt;

/// Unique identity of a fiber
///
/// Derived from the context address, so it is unique for the lifetime of
/// the fiber. Zero is reserved as the "no fiber" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(usize);

impl FiberId {
    /// Sentinel indicating no fiber
    pub const NONE: FiberId = FiberId(0);

    /// Create an id from a raw context address
    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        FiberId(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({:#x})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}
