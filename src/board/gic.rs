//! GICv2 distributor and CPU interface driver, for the QEMU `virt` machine.

use crate::{architecture::context::Frame, board::Mmio, error::KernelError, kernel::config::MAX_INTERRUPT_HANDLERS, log, sync::SpinLock};
use aarch64_cpu::registers::DAIF;
use tock_registers::{
    interfaces::{ReadWriteable, Readable, Writeable},
    register_bitfields, register_structs,
    registers::ReadWrite,
};

/// Distributor MMIO base on the QEMU `virt` machine.
const GICD_BASE: usize = 0x0800_0000;
/// CPU interface MMIO base on the QEMU `virt` machine.
const GICC_BASE: usize = 0x0801_0000;

/// Interrupt ids `>= this` read back from `GICC_IAR` are architecturally
/// spurious and carry no interrupt to service.
const SPURIOUS_THRESHOLD: u32 = 1020;

register_bitfields! {u32,
    GICD_CTLR [
        ENABLE OFFSET(0) NUMBITS(1) [],
    ],
    GICC_CTLR [
        ENABLE OFFSET(0) NUMBITS(1) [],
    ],
    GICC_IAR [
        INTERRUPT_ID OFFSET(0) NUMBITS(10) [],
    ],
}

register_structs! {
    #[allow(non_snake_case)]
    DistributorBlock {
        (0x000 => CTLR: ReadWrite<u32, GICD_CTLR::Register>),
        (0x004 => _reserved0),
        (0x100 => ISENABLER: [ReadWrite<u32>; 32]),
        (0x180 => ICENABLER: [ReadWrite<u32>; 32]),
        (0x200 => _reserved1),
        (0x280 => ICPENDR: [ReadWrite<u32>; 32]),
        (0x300 => _reserved2),
        (0xC00 => ICFGR: [ReadWrite<u32>; 64]),
        (0xD00 => @END),
    }
}

register_structs! {
    #[allow(non_snake_case)]
    CpuInterfaceBlock {
        (0x00 => CTLR: ReadWrite<u32, GICC_CTLR::Register>),
        (0x04 => PMR: ReadWrite<u32>),
        (0x08 => BPR: ReadWrite<u32>),
        (0x0C => IAR: ReadWrite<u32, GICC_IAR::Register>),
        (0x10 => EOIR: ReadWrite<u32>),
        (0x14 => @END),
    }
}

/// A registered per-IRQ callback, invoked with the trap frame that was
/// interrupted.
pub type Handler = fn(&mut Frame);

struct GicState {
    distributor: Mmio<DistributorBlock>,
    cpu_interface: Mmio<CpuInterfaceBlock>,
    handlers: [Option<Handler>; MAX_INTERRUPT_HANDLERS],
}

// SAFETY: all access is serialized through `GIC`'s spin lock.
unsafe impl Send for GicState {}

impl GicState {
    fn register(&mut self, num: u32, handler: Handler) -> Result<(), KernelError> {
        let slot = self.handlers.get_mut(num as usize).ok_or(KernelError::InvalidArg)?;
        if slot.is_some() {
            return Err(KernelError::InUse);
        }
        *slot = Some(handler);
        Ok(())
    }

    fn unregister(&mut self, num: u32) {
        if let Some(slot) = self.handlers.get_mut(num as usize) {
            *slot = None;
        }
    }

    fn dispatch(&self, num: u32) -> Option<Handler> {
        self.handlers.get(num as usize).copied().flatten()
    }
}

static GIC: SpinLock<Option<GicState>> = SpinLock::new(None);

/// Programs the distributor and CPU interface into a known, all-masked
/// state, then enables both.
///
/// # Safety
/// Must be called exactly once, after board MMIO is otherwise untouched.
pub unsafe fn init() {
    // SAFETY: `GICD_BASE`/`GICC_BASE` are the fixed GICv2 MMIO bases on the
    // QEMU `virt` machine, and this is the only place either is mapped.
    let distributor = unsafe { Mmio::new(GICD_BASE as *mut DistributorBlock) };
    // SAFETY: see above.
    let cpu_interface = unsafe { Mmio::new(GICC_BASE as *mut CpuInterfaceBlock) };

    distributor.CTLR.write(GICD_CTLR::ENABLE::CLEAR);
    for register in distributor.ICFGR.iter() {
        register.set(0);
    }
    for register in distributor.ICENABLER.iter() {
        register.set(0xFFFF_FFFF);
    }
    for register in distributor.ICPENDR.iter() {
        register.set(0xFFFF_FFFF);
    }
    distributor.CTLR.write(GICD_CTLR::ENABLE::SET);

    cpu_interface.CTLR.write(GICC_CTLR::ENABLE::CLEAR);
    cpu_interface.PMR.set(0xFF);
    cpu_interface.BPR.set(0);
    cpu_interface.CTLR.write(GICC_CTLR::ENABLE::SET);

    log!("GIC: distributor and CPU interface enabled, {} handler slots", MAX_INTERRUPT_HANDLERS);

    *GIC.lock() = Some(GicState {
        distributor,
        cpu_interface,
        handlers: [None; MAX_INTERRUPT_HANDLERS],
    });
}

/// Registers `handler` for interrupt `num`.
pub fn register(num: u32, handler: Handler) -> Result<(), KernelError> {
    let mut guard = GIC.lock();
    guard.as_mut().ok_or(KernelError::NotReady)?.register(num, handler)
}

/// Removes any handler registered for interrupt `num`.
pub fn unregister(num: u32) {
    if let Some(state) = GIC.lock().as_mut() {
        state.unregister(num);
    }
}

/// Enables interrupt `num` at the distributor.
pub fn enable(num: u32) {
    let guard = GIC.lock();
    if let Some(state) = guard.as_ref() {
        state.distributor.ISENABLER[(num / 32) as usize].set(1 << (num % 32));
    }
}

/// Disables interrupt `num` at the distributor.
pub fn disable(num: u32) {
    let guard = GIC.lock();
    if let Some(state) = guard.as_ref() {
        state.distributor.ICENABLER[(num / 32) as usize].set(1 << (num % 32));
    }
}

/// Unmasks IRQs at the CPU level.
///
/// # Safety
/// Must only be called once the handler table and distributor are in a
/// state ready to service interrupts.
pub unsafe fn enable_all() {
    DAIF.modify(DAIF::I::Unmasked);
}

/// Masks IRQs at the CPU level.
pub fn disable_all() {
    DAIF.modify(DAIF::I::Masked);
}

/// Top-level IRQ dispatch, called from the trap plane for both current- and
/// lower-EL IRQs.
pub fn handle_irq(frame: &mut Frame) {
    let guard = GIC.lock();
    let Some(state) = guard.as_ref() else {
        return;
    };

    let iar = state.cpu_interface.IAR.get();
    let id = iar & 0x3FF;
    if id >= SPURIOUS_THRESHOLD {
        return;
    }

    let handler = state.dispatch(id);
    // Drop the lock before running the handler: handlers (e.g. the timer
    // tick) call back into `register`/`enable` or the scheduler, which would
    // deadlock against a held `GIC` guard.
    drop(guard);
    if let Some(handler) = handler {
        handler(frame);
    } else {
        log!("GIC: unhandled interrupt {}", id);
    }

    let guard = GIC.lock();
    if let Some(state) = guard.as_ref() {
        state.cpu_interface.EOIR.set(iar);
    }
}
