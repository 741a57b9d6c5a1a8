//! AArch64-specific primitives: system registers, exceptions, boot, timer.

pub mod boot;
/// Data/instruction cache maintenance for freshly written code
pub mod cache;
pub mod config;
/// Task register-frame save/restore (context switch)
pub mod context;
pub mod exception;
pub mod exception_handlers;
pub mod machine;
pub mod shutdown;
pub mod timer;

pub use shutdown::shutdown;

/// Converts a `usize` to a `u64`, for targets where the two widths coincide.
pub const fn usize_to_u64(value: usize) -> u64 {
    value as u64
}

/// Architecture-specific initialization, run once during boot.
///
/// # Safety
/// Must be called exactly once, in EL1, before any interrupt can be taken.
pub unsafe fn init() {
    config::init();
    exception::init();
    // SAFETY: this is the one-time vector-base/alignment-check setup, run before
    // interrupts are unmasked.
    unsafe {
        exception::install_vectors();
    }
}
