//! Boot orchestrator: the first Rust code to run, reached via `eret` from
//! `architecture::boot::el2_init` with the boot-info pointer still in `x0`.
//! Brings up the heap, page allocator, MMU, and tensor pool, then the
//! interrupt controller, timer, and scheduler, in that order, and halts with
//! a diagnostic on the first subsystem that fails.

use crate::{
    architecture, board,
    kernel::{
        boot_info::BootInfo,
        config::{self, AI_MEMORY_POOL_RATIO},
        exception::PrivilegeLevel,
        heap, mmu, page, process, scheduler, tensor,
    },
    log,
};

extern "Rust" {
    /// First byte of the loaded kernel image; provided by the linker script.
    static __kernel_start: u8;
}

/// Global initialization of the system.
///
/// # Safety
/// Must be the very first Rust code to run, at EL1, with `boot_info_ptr`
/// holding the physical address of the boot handoff record, per the boot
/// handoff contract documented in `architecture::boot::boot.s`.
#[no_mangle]
pub extern "C" fn init(boot_info_ptr: *const u8) -> ! {
    assert_eq!(
        architecture::exception::el(),
        PrivilegeLevel::Kernel,
        "the boot orchestrator must run at EL1"
    );

    let boot_info = match unsafe { BootInfo::read(boot_info_ptr) } {
        Ok(info) => info,
        Err(err) => panic!("malformed boot-info record: {err}"),
    };
    log!("BOOT: ram {} bytes, kernel image {} bytes", boot_info.ram_size, boot_info.kernel_size);

    let ram_size = boot_info.ram_size as usize;
    // SAFETY: `__kernel_start` is the linker-provided load address of this image.
    let kernel_start = unsafe { core::ptr::addr_of!(__kernel_start) as usize };
    let kernel_end = kernel_start + boot_info.kernel_size as usize;

    // SAFETY: first and only call, before anything else allocates.
    unsafe {
        heap::init(ram_size, kernel_end).expect("kernel heap initialization failed");
    }
    config::log();

    // SAFETY: first and only call, before any frame is handed out.
    unsafe {
        page::init(ram_size, kernel_start, kernel_end).expect("page allocator initialization failed");
    }

    // SAFETY: first and only call; the page allocator is live to back new tables.
    unsafe {
        mmu::init(ram_size).expect("page table setup failed");
    }
    // SAFETY: the tables built by `mmu::init` identity-map everything touched so far.
    unsafe {
        mmu::enable().expect("enabling the MMU failed");
    }

    // SAFETY: first and only call, with the kernel heap live to back the pool.
    unsafe {
        tensor::init(ram_size / AI_MEMORY_POOL_RATIO).expect("tensor pool initialization failed");
    }

    // SAFETY: first and only call, before interrupts are unmasked.
    unsafe {
        architecture::init();
    }
    // SAFETY: first and only call, after the vector table is installed.
    unsafe {
        board::init();
    }
    // SAFETY: first and only call, after the GIC is live.
    unsafe {
        scheduler::init();
    }

    spawn_initial_processes();

    log!("BOOT: handoff complete, starting the scheduler");
    // SAFETY: at least one process exists; interrupts are still masked.
    match unsafe { scheduler::start() } {
        Ok(()) => unreachable!("scheduler::start diverges into the first task on success"),
        Err(err) => panic!("scheduler failed to start: {err}"),
    }
}

/// Spawns a small fixed set of demo processes so the scheduler has more than
/// one ready task to rotate between at boot.
///
/// TODO: replace with loading processes out of a boot image, once this
/// kernel grows a loader.
fn spawn_initial_processes() {
    /// `b .`: an unconditional branch to self, used as a placeholder program
    /// that simply spins, to give the scheduler something to run.
    const SPIN_FOREVER: &[u8] = &[0x00, 0x00, 0x00, 0x14];

    for name in ["idle-0", "idle-1"] {
        match process::create(name, SPIN_FOREVER, PrivilegeLevel::Kernel) {
            Ok(pid) => log!("BOOT: spawned process {} (pid {})", name, pid.raw()),
            Err(err) => panic!("failed to spawn process {name}: {err}"),
        }
    }
}
