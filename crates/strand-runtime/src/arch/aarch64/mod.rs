//! aarch64 context switching
//!
//! TODO: port the x86_64 frame layout to x19-x28/lr/sp saves.

use super::{EntryFn, RegisterFrame};

/// Prepare a fresh stack for entry
pub unsafe fn init_frame(
    _frame: *mut RegisterFrame,
    _stack_top: *mut u8,
    _entry_fn: EntryFn,
    _entry_arg: usize,
) {
    todo!("aarch64 init_frame not yet implemented")
}

/// Switch execution contexts
pub unsafe extern "C" fn switch_frames(
    _save: *mut RegisterFrame,
    _restore: *const RegisterFrame,
) {
    todo!("aarch64 switch_frames not yet implemented")
}
