//! Error types for fiber operations

use core::fmt;

/// Result type for fiber operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors surfaced by the fiber runtime
///
/// Programmer errors (self-join, resuming a terminated fiber, unwinding
/// the main or dispatcher fiber) are contract violations and are caught
/// by debug assertions, not represented here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// The fiber observed a pending interruption request at an
    /// interruption point (join, sleep).
    Interrupted,

    /// Stack or context allocation failed during spawn
    Resource(ResourceError),

    /// The fiber's entry function panicked
    ///
    /// Delivered to the first joiner only; carries the panic message when
    /// the payload was a string.
    Panicked(Option<String>),

    /// The fiber was canceled via forced unwinding before producing a value
    Canceled,
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::Interrupted => write!(f, "fiber interrupted"),
            FiberError::Resource(e) => write!(f, "resource error: {}", e),
            FiberError::Panicked(Some(msg)) => write!(f, "fiber panicked: {}", msg),
            FiberError::Panicked(None) => write!(f, "fiber panicked"),
            FiberError::Canceled => write!(f, "fiber canceled"),
        }
    }
}

impl std::error::Error for FiberError {}

/// Stack and context allocation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// mmap for a fiber stack failed
    StackAllocation,

    /// mprotect for the guard page failed
    GuardProtection,

    /// Requested stack size is zero or overflows with the guard page
    InvalidStackSize,

    /// Runtime configuration failed validation
    InvalidConfig(&'static str),
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::StackAllocation => write!(f, "stack allocation failed"),
            ResourceError::GuardProtection => write!(f, "guard page protection failed"),
            ResourceError::InvalidStackSize => write!(f, "invalid stack size"),
            ResourceError::InvalidConfig(why) => write!(f, "invalid configuration: {}", why),
        }
    }
}

impl From<ResourceError> for FiberError {
    fn from(e: ResourceError) -> Self {
        FiberError::Resource(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", FiberError::Interrupted), "fiber interrupted");

        let e = FiberError::Resource(ResourceError::StackAllocation);
        assert_eq!(format!("{}", e), "resource error: stack allocation failed");

        let e = FiberError::Panicked(Some("boom".to_string()));
        assert_eq!(format!("{}", e), "fiber panicked: boom");
    }

    #[test]
    fn test_error_conversion() {
        let err: FiberError = ResourceError::InvalidStackSize.into();
        assert!(matches!(
            err,
            FiberError::Resource(ResourceError::InvalidStackSize)
        ));
    }
}
