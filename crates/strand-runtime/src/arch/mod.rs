//! Architecture-specific context switching
//!
//! Provides the stack-switch primitive the scheduler is built on:
//! `init_frame` prepares a fresh stack so that switching to it enters an
//! entry function, `switch_frames` saves the caller's callee-saved
//! registers and restores another frame's.

/// Callee-saved register frame for a voluntary switch (System V AMD64)
///
/// Layout is fixed for the assembly in the per-arch modules.
#[repr(C)]
pub struct RegisterFrame {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl RegisterFrame {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Entry function signature for a fresh fiber stack
///
/// Entries never return; they terminate by switching away for good.
pub type EntryFn = extern "C" fn(usize) -> !;

const _: () = {
    assert!(core::mem::size_of::<RegisterFrame>() == 64);
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64 as current;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64 as current;
    } else {
        compile_error!("Unsupported architecture");
    }
}
