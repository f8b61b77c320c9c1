//! # strand-core
//!
//! Platform-agnostic primitives for the strand fiber runtime.
//!
//! This crate contains no OS-specific code; the scheduler, fiber
//! contexts and context switching live in `strand-runtime`.
//!
//! ## Modules
//!
//! - `error` - error taxonomy for fiber operations
//! - `flags` - fiber context flag bits
//! - `id` - fiber identifier type
//! - `spinlock` - test-and-set locks for short critical sections
//! - `fss` - fiber-specific storage with cleanup callbacks
//! - `env` - environment variable helpers
//! - `fprint` - leveled diagnostic printing macros

pub mod env;
pub mod error;
pub mod flags;
pub mod fprint;
pub mod fss;
pub mod id;
pub mod spinlock;

// Re-exports for convenience
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{FiberError, FiberResult, ResourceError};
pub use flags::ContextFlags;
pub use fprint::LogLevel;
pub use fss::{FssCleanup, FssKey, FssMap};
pub use id::FiberId;
pub use spinlock::{RawSpinLock, SpinLock};
