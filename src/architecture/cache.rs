//! Data/instruction cache maintenance for freshly written executable memory.
//!
//! Used by `kernel::process` after copying a program's code into a fresh
//! allocation: the copy goes through the data cache, but the core may fetch
//! instructions from memory or from a stale icache line, so the range must be
//! cleaned to the point of coherency and the instruction cache invalidated
//! before anything jumps into it.

use core::arch::asm;

/// Cache line granularity assumed for maintenance operations.
const CACHE_LINE_SIZE: usize = 64;

/// Cleans and invalidates the data cache, then invalidates the instruction
/// cache, over `[start, start + len)`, ordered per the architecture: clean →
/// `isb` → `dsb ish` → invalidate → `isb`.
///
/// # Safety
/// `start..start + len` must be a valid, writable range that has just been
/// written with the code the caller is about to execute.
pub unsafe fn sync_icache_range(start: usize, len: usize) {
    let first_line = start & !(CACHE_LINE_SIZE - 1);
    let last_line = (start + len.saturating_sub(1)) & !(CACHE_LINE_SIZE - 1);

    let mut line = first_line;
    while line <= last_line {
        // SAFETY: `line` falls within the caller's range, per this
        // function's contract.
        unsafe {
            asm!("dc civac, {}", in(reg) line);
        }
        line += CACHE_LINE_SIZE;
    }
    // SAFETY: ordinary barrier instructions, always safe to issue.
    unsafe {
        asm!("isb sy");
        asm!("dsb ish");
    }

    let mut line = first_line;
    while line <= last_line {
        // SAFETY: see above.
        unsafe {
            asm!("ic ivau, {}", in(reg) line);
        }
        line += CACHE_LINE_SIZE;
    }
    // SAFETY: ordinary barrier instruction.
    unsafe {
        asm!("isb sy");
    }
}
