//! Board-specific implementations for the QEMU `virt` machine: UART and GICv2.

/// GICv2 distributor/CPU-interface driver
pub mod gic;
/// Memory-mapped I/O wrapper
pub mod mmio;
/// PL011 UART driver
mod uart;

pub use mmio::Mmio;
pub use uart::serial;

use crate::call_once;

/// Board-specific initialization sequence.
///
/// # Safety
/// Must be called only once, after architecture initialization.
pub unsafe fn init() {
    call_once!();
    serial().init();
    // SAFETY: delegated to this function's own contract.
    unsafe {
        gic::init();
    }
}
