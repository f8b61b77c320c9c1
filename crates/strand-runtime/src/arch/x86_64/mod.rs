//! x86_64 context switching
//!
//! Inline assembly via naked functions (stable since Rust 1.88).

use super::{EntryFn, RegisterFrame};
use std::arch::naked_asm;

/// Prepare a fresh stack so that switching to `frame` enters `entry_fn(entry_arg)`
///
/// The entry function and its argument ride in r12/r13 until the
/// trampoline moves them into place.
///
/// # Safety
///
/// `frame` must point to valid `RegisterFrame` memory and `stack_top`
/// must be the top of a mapped stack region.
pub unsafe fn init_frame(
    frame: *mut RegisterFrame,
    stack_top: *mut u8,
    entry_fn: EntryFn,
    entry_arg: usize,
) {
    // 16-byte alignment per the System V AMD64 ABI, minus 8 so the
    // trampoline's call re-establishes it
    let sp = (stack_top as usize & !0xF) - 8;

    let frame = &mut *frame;
    frame.rsp = sp as u64;
    frame.rip = entry_trampoline as usize as u64;
    frame.rbx = 0;
    frame.rbp = 0;
    frame.r12 = entry_fn as usize as u64;
    frame.r13 = entry_arg as u64;
    frame.r14 = 0;
    frame.r15 = 0;
}

/// First instructions executed on a fresh fiber stack
///
/// Calls entry_fn(entry_arg); entries never return, the trap is a
/// backstop.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2",);
}

/// Switch execution contexts
///
/// Saves the caller's callee-saved registers into `save` and restores
/// `restore`. Returns when some later switch restores `save`.
///
/// # Safety
///
/// Both pointers must reference valid frames; `restore` must hold either
/// a frame produced by `init_frame` or one saved by a previous switch.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_frames(_save: *mut RegisterFrame, _restore: *const RegisterFrame) {
    naked_asm!(
        // Save callee-saved registers into save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Restore from restore (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context
        "2:",
        "ret",
    );
}
