//! Processes: the unit of isolation above a task. Each process owns exactly
//! one main task, a heap-backed stack and code image, a bounded allocation
//! table for its own `malloc`/`free` calls, and an optional argument vector.

use alloc::vec::Vec;

use aarch64_cpu::registers::SPSR_EL1;
use tock_registers::{
    interfaces::{Readable, Writeable},
    registers::InMemoryRegister,
};

use crate::{
    architecture,
    error::KernelError,
    kernel::{
        config::{MAX_ALLOCS_PER_PROC, MAX_PROCESSES, MAX_PROCESS_NAME, PROCESS_STACK_SIZE},
        exception::PrivilegeLevel,
        heap,
        task::{self, TaskId},
    },
    log,
    sync::SpinLock,
};

/// Opaque handle to a live process, indexing the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessId(usize);

impl ProcessId {
    /// The raw table index backing this handle.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }
}

/// A single `(ptr, size)` record in a process's allocation table: a stack,
/// the code image, or a `malloc` made on the process's behalf.
#[derive(Clone, Copy)]
struct Allocation {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: every access to a `Process` goes through `TABLE`'s spin lock.
unsafe impl Send for Allocation {}

/// A process's deep-copied argument vector: owned byte strings, plus a
/// pointer table into them suitable for handing back across a syscall.
struct ArgVector {
    strings: Vec<Vec<u8>>,
    pointers: Vec<*mut u8>,
}

// SAFETY: see `Allocation`.
unsafe impl Send for ArgVector {}

/// Bounded, fixed-capacity process name.
struct Name {
    bytes: [u8; MAX_PROCESS_NAME],
    len: usize,
}

impl Name {
    fn from_str(name: &str) -> Self {
        let mut bytes = [0u8; MAX_PROCESS_NAME];
        let len = name.len().min(MAX_PROCESS_NAME);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self { bytes, len }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }
}

struct Process {
    name: Name,
    task: TaskId,
    allocs: [Option<Allocation>; MAX_ALLOCS_PER_PROC],
    args: Option<ArgVector>,
}

static TABLE: SpinLock<[Option<Process>; MAX_PROCESSES]> = SpinLock::new([const { None }; MAX_PROCESSES]);

/// Rounds `value` down to the nearest multiple of `align` (`align` must be a power of two).
const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Builds the `SPSR_EL1` value a freshly created task resumes into: `D`/`A`
/// masked, `I`/`F` unmasked, mode bit chosen by `privilege`.
fn spsr_value(privilege: PrivilegeLevel) -> u64 {
    let mode = if privilege == PrivilegeLevel::User { SPSR_EL1::M::EL0t } else { SPSR_EL1::M::EL1h };
    let register: InMemoryRegister<u64, SPSR_EL1::Register> = InMemoryRegister::new(0);
    register.write(SPSR_EL1::D::Masked + SPSR_EL1::A::Masked + SPSR_EL1::I::Unmasked + SPSR_EL1::F::Unmasked + mode);
    register.get()
}

/// An in-kernel halt loop, installed as `X30` at task creation: reached only
/// if a task's entry function ever falls off its end instead of calling the
/// process-exit syscall.
extern "C" fn safe_return_handler() -> ! {
    if let Some(id) = task::current() {
        let _ = task::return_(id);
    }
    loop {
        aarch64_cpu::asm::wfe();
    }
}

/// Finds a free table slot, records `(ptr, size)` at `index` in `allocs`, and
/// advances `count`.
fn record_alloc(allocs: &mut [Option<Allocation>; MAX_ALLOCS_PER_PROC], count: &mut usize, ptr: *mut u8, size: usize) -> Result<(), KernelError> {
    let slot = allocs.get_mut(*count).ok_or(KernelError::AtMax)?;
    *slot = Some(Allocation { ptr, size });
    *count += 1;
    Ok(())
}

/// Creates a process named `name`, running `program_data` at `privilege`.
///
/// Allocates a zeroed stack and a fresh copy of `program_data` on the kernel
/// heap, issues the instruction-cache maintenance sequence over the copy,
/// and sets up its main task to enter at the copy's base address.
pub fn create(name: &str, program_data: &[u8], privilege: PrivilegeLevel) -> Result<ProcessId, KernelError> {
    let index = {
        let table = TABLE.lock();
        table.iter().position(Option::is_none).ok_or(KernelError::AtMax)?
    };

    let mut allocs: [Option<Allocation>; MAX_ALLOCS_PER_PROC] = [const { None }; MAX_ALLOCS_PER_PROC];
    let mut alloc_count = 0usize;

    let stack_ptr = heap::alloc(PROCESS_STACK_SIZE);
    if stack_ptr.is_null() {
        return Err(KernelError::NoMemory);
    }
    // SAFETY: `stack_ptr` is a fresh, uniquely-owned allocation of `PROCESS_STACK_SIZE` bytes.
    unsafe {
        core::ptr::write_bytes(stack_ptr, 0, PROCESS_STACK_SIZE);
    }
    record_alloc(&mut allocs, &mut alloc_count, stack_ptr, PROCESS_STACK_SIZE)?;

    let code_size = program_data.len().max(1);
    let binary_ptr = heap::alloc(code_size);
    if binary_ptr.is_null() {
        heap::free(stack_ptr);
        return Err(KernelError::NoMemory);
    }
    // SAFETY: `binary_ptr` is a fresh allocation of at least `program_data.len()` bytes,
    // and is cache-synced before anything can execute out of it.
    unsafe {
        core::ptr::copy_nonoverlapping(program_data.as_ptr(), binary_ptr, program_data.len());
        architecture::cache::sync_icache_range(binary_ptr as usize, code_size);
    }
    if record_alloc(&mut allocs, &mut alloc_count, binary_ptr, program_data.len()).is_err() {
        heap::free(stack_ptr);
        heap::free(binary_ptr);
        return Err(KernelError::AtMax);
    }

    let stack_top = align_down(stack_ptr as usize + PROCESS_STACK_SIZE, 16);
    let task_id = match task::new(task::PRIORITY_NORMAL) {
        Ok(id) => id,
        Err(err) => {
            heap::free(stack_ptr);
            heap::free(binary_ptr);
            return Err(err);
        }
    };
    if let Err(err) = task::set_entry(
        task_id,
        binary_ptr as u64,
        stack_top as u64,
        safe_return_handler as usize as u64,
        spsr_value(privilege),
    ) {
        task::free(task_id);
        heap::free(stack_ptr);
        heap::free(binary_ptr);
        return Err(err);
    }

    if task::set_owner(task_id, index).is_err() {
        task::free(task_id);
        heap::free(stack_ptr);
        heap::free(binary_ptr);
        return Err(KernelError::NotFound);
    }

    let mut table = TABLE.lock();
    table[index] = Some(Process { name: Name::from_str(name), task: task_id, allocs, args: None });
    drop(table);

    log!("PROCESS: created pid {} ({}, {} bytes)", index, name, program_data.len());
    Ok(ProcessId(index))
}

/// Saves the current task's live state, then switches directly to `pid`'s
/// main task. Intended for voluntary switches with no interrupt frame at
/// hand; the timer-driven scheduler reschedules via [`schedule_next`] instead.
pub fn switch(pid: ProcessId) -> Result<(), KernelError> {
    if task::current().is_some() {
        // SAFETY: called with no interrupt frame live, per this function's contract.
        unsafe {
            task::current_save_state()?;
        }
    }
    let task_id = {
        let table = TABLE.lock();
        table[pid.0].as_ref().ok_or(KernelError::NotFound)?.task
    };
    task::switch(task_id)
}

/// Tears down `pid`: frees every recorded allocation, its argument vector,
/// and its main task, then clears the table slot.
pub fn terminate(pid: ProcessId) -> Result<(), KernelError> {
    let mut table = TABLE.lock();
    let process = table.get_mut(pid.0).ok_or(KernelError::InvalidArg)?.take().ok_or(KernelError::NotFound)?;
    drop(table);

    for allocation in process.allocs.iter().flatten() {
        heap::free(allocation.ptr);
    }
    drop(process.args);
    task::free(process.task);

    log!("PROCESS: terminated pid {}", pid.0);
    Ok(())
}

/// Allocates `size` bytes on the kernel heap on `pid`'s behalf, recording
/// the allocation in its table.
pub fn malloc(pid: ProcessId, size: usize) -> Result<*mut u8, KernelError> {
    let mut table = TABLE.lock();
    let process = table.get_mut(pid.0).ok_or(KernelError::InvalidArg)?.as_mut().ok_or(KernelError::NotFound)?;
    let slot_index = process.allocs.iter().position(Option::is_none).ok_or(KernelError::AtMax)?;
    let ptr = heap::alloc(size);
    if ptr.is_null() {
        return Err(KernelError::NoMemory);
    }
    process.allocs[slot_index] = Some(Allocation { ptr, size });
    Ok(ptr)
}

/// Releases an allocation previously returned by [`malloc`] for `pid`.
pub fn free(pid: ProcessId, ptr: *mut u8) -> Result<(), KernelError> {
    let mut table = TABLE.lock();
    let process = table.get_mut(pid.0).ok_or(KernelError::InvalidArg)?.as_mut().ok_or(KernelError::NotFound)?;
    let slot = process.allocs.iter_mut().find(|slot| slot.is_some_and(|allocation| allocation.ptr == ptr)).ok_or(KernelError::NotFound)?;
    heap::free(ptr);
    *slot = None;
    Ok(())
}

/// Deep-copies `args` (each a byte string, NUL-terminated on storage) as
/// `pid`'s argument vector, replacing any previous one.
pub fn set_arguments(pid: ProcessId, args: &[&[u8]]) -> Result<(), KernelError> {
    let mut strings = Vec::with_capacity(args.len());
    for arg in args {
        let mut owned = Vec::with_capacity(arg.len() + 1);
        owned.extend_from_slice(arg);
        owned.push(0);
        strings.push(owned);
    }
    let pointers = strings.iter_mut().map(|owned| owned.as_mut_ptr()).collect();

    let mut table = TABLE.lock();
    let process = table.get_mut(pid.0).ok_or(KernelError::InvalidArg)?.as_mut().ok_or(KernelError::NotFound)?;
    process.args = Some(ArgVector { strings, pointers });
    Ok(())
}

/// Returns `pid`'s argument count and a pointer to its pointer table, or
/// `(0, null)` if no argument vector has been set.
pub fn get_arguments(pid: ProcessId) -> Result<(usize, *const *mut u8), KernelError> {
    let table = TABLE.lock();
    let process = table.get(pid.0).ok_or(KernelError::InvalidArg)?.as_ref().ok_or(KernelError::NotFound)?;
    Ok(match &process.args {
        Some(args) => (args.pointers.len(), args.pointers.as_ptr()),
        None => (0, core::ptr::null()),
    })
}

/// The process whose main task is the currently running task, if any.
pub fn current() -> Option<ProcessId> {
    let current_task = task::current()?;
    task::owner(current_task).map(ProcessId)
}

/// Runs `f` with `pid`'s name, while the process table is locked.
pub fn with_name<R>(pid: ProcessId, f: impl FnOnce(&str) -> R) -> Result<R, KernelError> {
    let table = TABLE.lock();
    let process = table.get(pid.0).ok_or(KernelError::InvalidArg)?.as_ref().ok_or(KernelError::NotFound)?;
    Ok(f(process.name.as_str()))
}

/// Switches to the lowest pid whose main task is `READY`, wrapping past the
/// end of the table if needed. Called by the scheduler's tick handler after
/// the outgoing task's state has already been saved and it has been
/// downgraded to `READY`.
pub fn schedule_next() -> Result<(), KernelError> {
    let current_index = current().map_or(0, |pid| pid.0 + 1);
    let table = TABLE.lock();
    for offset in 0..MAX_PROCESSES {
        let index = (current_index + offset) % MAX_PROCESSES;
        if let Some(process) = table[index].as_ref() {
            if task::state(process.task) == Some(task::TaskState::Ready) {
                let task_id = process.task;
                drop(table);
                return task::switch(task_id);
            }
        }
    }
    Err(KernelError::NoTask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down_rounds_to_multiple() {
        assert_eq!(align_down(0x1007, 16), 0x1000);
        assert_eq!(align_down(0x1000, 16), 0x1000);
    }

    #[test]
    fn name_truncates_to_capacity() {
        let long = "x".repeat(MAX_PROCESS_NAME + 8);
        let name = Name::from_str(&long);
        assert_eq!(name.as_str().len(), MAX_PROCESS_NAME);
    }

    #[test]
    fn name_round_trips_short_strings() {
        let name = Name::from_str("idle-0");
        assert_eq!(name.as_str(), "idle-0");
    }

    #[test]
    fn record_alloc_fills_then_reports_at_max() {
        let mut allocs: [Option<Allocation>; MAX_ALLOCS_PER_PROC] = [const { None }; MAX_ALLOCS_PER_PROC];
        let mut count = 0usize;
        for _ in 0..MAX_ALLOCS_PER_PROC {
            record_alloc(&mut allocs, &mut count, core::ptr::null_mut(), 1).unwrap();
        }
        assert_eq!(count, MAX_ALLOCS_PER_PROC);
        assert!(record_alloc(&mut allocs, &mut count, core::ptr::null_mut(), 1).is_err());
    }

    #[test]
    fn spsr_value_masks_debug_and_serror_unmasks_irq_fiq() {
        let kernel = spsr_value(PrivilegeLevel::Kernel);
        // D and A masked (bits 9, 8), I and F unmasked (bits 7, 6), EL1h mode (0b0101).
        assert_eq!(kernel & 0b1111, 0b0101);
        assert_ne!(kernel & (1 << 9), 0);
        assert_ne!(kernel & (1 << 8), 0);
        assert_eq!(kernel & (1 << 7), 0);
        assert_eq!(kernel & (1 << 6), 0);
    }

    #[test]
    fn spsr_value_picks_el0t_for_user() {
        let user = spsr_value(PrivilegeLevel::User);
        assert_eq!(user & 0b1111, 0b0000);
    }
}
