//! Tick programming on top of the architected EL0 physical timer, wired
//! through the interrupt controller.

use crate::{
    architecture::{self, context::Frame},
    board,
    kernel::config::{CPU_FREQ_HZ_FALLBACK, TIMER_IRQ},
    log,
    sync::SpinLock,
};
use aarch64_cpu::registers::{CNTFRQ_EL0, CNTPCT_EL0, CNTP_CTL_EL0, CNTP_CVAL_EL0};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

struct TimerState {
    /// Ticks between successive fires, as last programmed by [`set_interval`].
    interval_ticks: u64,
    /// Monotonic count of ticks serviced since [`init`].
    ticks: u64,
    /// Called at the end of every tick, after rearming the timer, with the
    /// interrupted frame; normally set by `kernel::scheduler::init`.
    hook: Option<fn(&mut Frame)>,
}

static STATE: SpinLock<TimerState> = SpinLock::new(TimerState {
    interval_ticks: 0,
    ticks: 0,
    hook: None,
});

/// Registers the internal tick handler with the interrupt controller and
/// leaves the timer disabled.
///
/// # Safety
/// Must be called exactly once, after `board::gic::init`.
pub unsafe fn init() {
    crate::call_once!();
    if CNTFRQ_EL0.get() == 0 {
        log!("TIMER: CNTFRQ_EL0 reads 0, falling back to {} Hz", CPU_FREQ_HZ_FALLBACK);
    }
    board::gic::register(TIMER_IRQ, handle_tick).expect("the timer IRQ slot must be free at init");
    CNTP_CTL_EL0.modify(CNTP_CTL_EL0::ENABLE::CLEAR);
    log!("TIMER: registered on IRQ {}, frequency {} Hz", TIMER_IRQ, frequency_hz());
}

/// Reads `CNTFRQ_EL0`, substituting the configured fallback if the firmware
/// left it unprogrammed (reads back zero).
fn frequency_hz() -> u64 {
    let frequency = CNTFRQ_EL0.get();
    if frequency == 0 {
        CPU_FREQ_HZ_FALLBACK
    } else {
        frequency
    }
}

/// Registers `hook` to run at the end of every tick.
pub fn set_tick_hook(hook: fn(&mut Frame)) {
    STATE.lock().hook = Some(hook);
}

/// Programs the next compare value `interval_ms` milliseconds from now.
pub fn set_interval(interval_ms: u64) {
    let interval_ticks = frequency_hz() * interval_ms / 1000;
    STATE.lock().interval_ticks = interval_ticks;
    CNTP_CVAL_EL0.set(CNTPCT_EL0.get() + interval_ticks);
}

/// Enables the timer: unmasks it locally, enables it at the CPU level, and
/// enables its IRQ at the distributor.
///
/// # Safety
/// Must be called after [`init`] and [`set_interval`].
pub unsafe fn enable() {
    CNTP_CTL_EL0.modify(CNTP_CTL_EL0::ENABLE::SET);
    // SAFETY: delegated to this function's own contract.
    unsafe {
        architecture::exception::enable();
    }
    board::gic::enable(TIMER_IRQ);
}

/// Number of ticks serviced since [`init`].
pub fn tick_count() -> u64 {
    STATE.lock().ticks
}

/// Disables the timer at the CPU level and masks its IRQ at the distributor.
pub fn disable() {
    CNTP_CTL_EL0.modify(CNTP_CTL_EL0::ENABLE::CLEAR);
    board::gic::disable(TIMER_IRQ);
}

/// The registered timer IRQ handler: advances the tick count, rearms the
/// timer, then runs the scheduler hook.
fn handle_tick(frame: &mut Frame) {
    let (interval_ticks, hook) = {
        let mut state = STATE.lock();
        state.ticks += 1;
        (state.interval_ticks, state.hook)
    };
    CNTP_CVAL_EL0.set(CNTPCT_EL0.get() + interval_ticks);
    if let Some(hook) = hook {
        hook(frame);
    }
}
