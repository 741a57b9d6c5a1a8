//! Compile-time constants shared across kernel subsystems.
//!
//! Where `architecture::config` probes and logs runtime-discovered facts about
//! the running core, this module holds the fixed sizes and limits the rest of
//! the kernel is built against.

use crate::log;

/// Size of a single page / MMU granule, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Block granularity used by the kernel heap's block map.
pub const KERNEL_HEAP_BLOCK_SIZE: usize = 4096;

/// Lower bound on the kernel heap size, regardless of `ram_size`.
pub const KERNEL_HEAP_MIN_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound on the kernel heap size, regardless of `ram_size`.
pub const KERNEL_HEAP_MAX_SIZE: usize = 256 * 1024 * 1024;

/// Divisor applied to `ram_size` to size the kernel heap.
pub const KERNEL_HEAP_RAM_DIVISOR: usize = 5;

/// Upper bound on the number of page frames the page allocator can track.
pub const MAX_PAGES: usize = 4 * 1024 * 1024;

/// Number of pages reserved at the bottom of RAM for boot code and the early
/// kernel image.
pub const RESERVED_BOOT_PAGES: usize = 64;

/// Smallest block the tensor pool's bitmap region hands out.
pub const AI_MEMORY_MIN_BLOCK_SIZE: usize = 64;

/// Number of bits tracked by the tensor pool's small-block bitmap.
pub const AI_MEMORY_MAX_BLOCKS: usize = 4096;

/// Fraction (as `1/N`) of the kernel heap reserved for the tensor pool.
pub const AI_MEMORY_POOL_RATIO: usize = 4;

/// Bound on free-block descriptors tracked by the tensor pool's large-block
/// free list.
pub const MAX_MEMORY_REGIONS: usize = 32;

/// Bound on the interrupt handler table.
pub const MAX_INTERRUPT_HANDLERS: usize = 128;

/// Bound on the process table.
pub const MAX_PROCESSES: usize = 64;

/// Bound on a single process's allocation table.
pub const MAX_ALLOCS_PER_PROC: usize = 128;

/// Default process stack size, in bytes.
pub const PROCESS_STACK_SIZE: usize = 128 * 1024;

/// Bound on a process's bounded name string.
pub const MAX_PROCESS_NAME: usize = 64;

/// Fallback timer frequency, used only if `CNTFRQ_EL0` reads back zero.
pub const CPU_FREQ_HZ_FALLBACK: u64 = 1_000_000_000;

/// Scheduler tick interval, in milliseconds.
pub const SCHEDULER_TICK_MS: u64 = 10;

/// SPI number of the architected EL0 physical timer on the GICv2 `virt`
/// machine.
pub const TIMER_IRQ: u32 = 30;

/// PL011 UART MMIO base address on the QEMU `virt` machine.
pub const UART_BASE: usize = 0x0900_0000;

/// Magic value identifying a valid boot handoff record.
pub const BOOT_INFO_MAGIC: u64 = 0x424F_4F54;

/// Logs the fixed configuration constants, mirroring the format of
/// `architecture::config::Config::log`.
pub fn log() {
    log!("--- KERNEL CONFIG ---");
    log!("Page size: {}", PAGE_SIZE);
    log!(
        "Kernel heap: {}..{} bytes (ram/{})",
        KERNEL_HEAP_MIN_SIZE, KERNEL_HEAP_MAX_SIZE, KERNEL_HEAP_RAM_DIVISOR
    );
    log!("Max page frames: {}", MAX_PAGES);
    log!("Max processes: {}", MAX_PROCESSES);
    log!("Scheduler tick: {} ms", SCHEDULER_TICK_MS);
    log!("Timer IRQ: {}", TIMER_IRQ);
    log!("--- END KERNEL CONFIG ---");
}
