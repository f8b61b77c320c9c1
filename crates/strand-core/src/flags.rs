//! Fiber context flag bits

use core::fmt;

/// Bitset of fiber context flags
///
/// Stored in an `AtomicU8` on the context; compound transitions (for
/// example terminate-and-drain) happen under the context spinlock.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct ContextFlags(u8);

impl ContextFlags {
    /// The thread's main fiber, running on the native stack
    pub const MAIN: ContextFlags = ContextFlags(1 << 0);

    /// The scheduler's dispatcher fiber
    pub const DISPATCHER: ContextFlags = ContextFlags(1 << 1);

    /// Entry function has returned or unwound; terminal
    pub const TERMINATED: ContextFlags = ContextFlags(1 << 2);

    /// Interruption delivery is suppressed at interruption points
    pub const INTERRUPTION_BLOCKED: ContextFlags = ContextFlags(1 << 3);

    /// Interruption has been requested and not yet delivered
    pub const INTERRUPTION_REQUESTED: ContextFlags = ContextFlags(1 << 4);

    /// One-shot stack unwind pending, delivered on next resume
    pub const FORCED_UNWIND: ContextFlags = ContextFlags(1 << 5);

    /// Empty flag set
    #[inline]
    pub const fn empty() -> Self {
        ContextFlags(0)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        ContextFlags(bits)
    }

    /// Check whether every bit of `other` is set
    #[inline]
    pub const fn contains(self, other: ContextFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: ContextFlags) -> Self {
        ContextFlags(self.0 | other.0)
    }

    #[inline]
    pub const fn difference(self, other: ContextFlags) -> Self {
        ContextFlags(self.0 & !other.0)
    }
}

impl fmt::Debug for ContextFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (ContextFlags::MAIN, "MAIN"),
            (ContextFlags::DISPATCHER, "DISPATCHER"),
            (ContextFlags::TERMINATED, "TERMINATED"),
            (ContextFlags::INTERRUPTION_BLOCKED, "INTERRUPTION_BLOCKED"),
            (ContextFlags::INTERRUPTION_REQUESTED, "INTERRUPTION_REQUESTED"),
            (ContextFlags::FORCED_UNWIND, "FORCED_UNWIND"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "(empty)")?;
        }
        Ok(())
    }
}
