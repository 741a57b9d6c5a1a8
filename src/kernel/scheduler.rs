//! Round-robin scheduler driven by the system timer.
//!
//! Interrupt acknowledgement and EOI are strictly paired: the tick handler
//! only saves state and marks a reschedule pending, never switching tasks
//! itself. The actual switch, which may diverge straight into another task,
//! happens only after `board::gic::handle_irq` has written `EOIR`.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    architecture::context::Frame,
    error::KernelError,
    kernel::{config::SCHEDULER_TICK_MS, process, task, timer},
    log,
    sync::SpinLock,
};

static RUNNING: SpinLock<bool> = SpinLock::new(false);
static NEEDS_RESCHEDULE: AtomicBool = AtomicBool::new(false);

/// Initializes the timer and wires the tick handler; does not start ticking.
///
/// # Safety
/// Must be called exactly once, after `board::gic::init`.
pub unsafe fn init() {
    // SAFETY: delegated to this function's own contract.
    unsafe {
        timer::init();
    }
    timer::set_tick_hook(on_tick);
    timer::set_interval(SCHEDULER_TICK_MS);
    log!("SCHEDULER: tick interval {} ms", SCHEDULER_TICK_MS);
}

/// Enables the timer (which also unmasks CPU-level IRQs), flips the running
/// flag, then switches into the first ready task. Never returns on success;
/// on failure, undoes every step in reverse.
///
/// # Safety
/// Must be called exactly once, after [`init`], with at least one process
/// already created.
pub unsafe fn start() -> Result<(), KernelError> {
    // SAFETY: delegated to this function's own contract.
    unsafe {
        timer::enable();
    }
    *RUNNING.lock() = true;

    match task::run_first_ever_task() {
        Ok(()) => unreachable!("switching into the first task diverges on success"),
        Err(err) => {
            *RUNNING.lock() = false;
            timer::disable();
            Err(err)
        }
    }
}

/// Disables the timer and clears the running flag.
pub fn stop() {
    timer::disable();
    *RUNNING.lock() = false;
}

/// The timer's tick hook: saves the interrupted task's state from its frame,
/// downgrades it from `RUNNING` to `READY`, and marks a reschedule pending.
/// Does not itself switch tasks, so it always returns back to the interrupt
/// plane to let the IRQ be acknowledged first.
fn on_tick(frame: &mut Frame) {
    if !*RUNNING.lock() {
        return;
    }
    if let Some(current) = task::current() {
        let _ = task::save_state(current, frame);
        let _ = task::preempt(current);
    }
    NEEDS_RESCHEDULE.store(true, Ordering::Release);
}

/// Called by the trap plane after every IRQ has been acknowledged (`EOIR`
/// written). Performs the task switch the tick handler deferred, if one is
/// pending; may diverge into a different task.
pub fn service_pending_reschedule() {
    if NEEDS_RESCHEDULE.swap(false, Ordering::AcqRel) {
        if let Err(err) = process::schedule_next() {
            log!("SCHEDULER: tick found no runnable process: {}", err);
        }
    }
}
