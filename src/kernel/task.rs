//! The task ring: register-frame-level preemptible execution contexts.
//!
//! A task's frame mirrors the interrupt frame exactly, so switching to a task
//! is nothing more than restoring that frame and `eret`-ing into it.

use crate::{
    architecture::context::{task_restore_context, task_save_context, Frame},
    error::KernelError,
    kernel::config::MAX_PROCESSES,
    sync::SpinLock,
};

/// Where a task sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Finished,
}

/// Opaque handle to a live task, indexing the task arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

/// Lowest scheduling priority.
pub const PRIORITY_LOW: u8 = 0;
/// Default scheduling priority.
pub const PRIORITY_NORMAL: u8 = 1;
/// Highest scheduling priority.
pub const PRIORITY_HIGH: u8 = 2;

struct Task {
    state: TaskState,
    priority: u8,
    frame: Frame,
    next: usize,
    prev: usize,
    /// Index of the owning process in `kernel::process`'s table, if any.
    owner: Option<usize>,
}

struct TaskRing {
    slots: [Option<Task>; MAX_PROCESSES],
    head: Option<usize>,
    current: Option<usize>,
}

static RING: SpinLock<TaskRing> = SpinLock::new(TaskRing {
    slots: [const { None }; MAX_PROCESSES],
    head: None,
    current: None,
});

impl TaskRing {
    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Links `index` at the tail of the ring (`head.prev`), or makes it the
    /// sole element if the ring is empty.
    fn link_at_tail(&mut self, index: usize) {
        match self.head {
            None => {
                self.head = Some(index);
                if let Some(task) = self.slots[index].as_mut() {
                    task.next = index;
                    task.prev = index;
                }
            }
            Some(head) => {
                let tail = self.slots[head].as_ref().expect("head slot must be occupied").prev;
                self.slots[tail].as_mut().expect("tail slot must be occupied").next = index;
                self.slots[head].as_mut().expect("head slot must be occupied").prev = index;
                if let Some(task) = self.slots[index].as_mut() {
                    task.next = head;
                    task.prev = tail;
                }
            }
        }
    }

    fn unlink(&mut self, index: usize) {
        let (next, prev) = {
            let task = self.slots[index].as_ref().expect("unlinking a vacant slot");
            (task.next, task.prev)
        };
        if next == index {
            self.head = None;
        } else {
            if let Some(task) = self.slots[prev].as_mut() {
                task.next = next;
            }
            if let Some(task) = self.slots[next].as_mut() {
                task.prev = prev;
            }
            if self.head == Some(index) {
                self.head = Some(next);
            }
        }
        self.slots[index] = None;
        if self.current == Some(index) {
            self.current = None;
        }
    }
}

/// Allocates a new task at priority `priority`, linked at the tail of the
/// ring, initially `Ready`.
pub fn new(priority: u8) -> Result<TaskId, KernelError> {
    let mut ring = RING.lock();
    let index = ring.find_free_slot().ok_or(KernelError::AtMax)?;
    ring.slots[index] = Some(Task {
        state: TaskState::Ready,
        priority,
        frame: Frame::zeroed(),
        next: index,
        prev: index,
        owner: None,
    });
    ring.link_at_tail(index);
    Ok(TaskId(index))
}

/// Tears down a task, unlinking it from the ring.
pub fn free(id: TaskId) {
    RING.lock().unlink(id.0);
}

/// Sets up a task's entry state: program counter, stack pointer, link
/// register, and `SPSR_EL1`.
pub fn set_entry(id: TaskId, pc: u64, sp: u64, link_register: u64, spsr: u64) -> Result<(), KernelError> {
    let mut ring = RING.lock();
    let task = ring.slots[id.0].as_mut().ok_or(KernelError::NotFound)?;
    task.frame.pc = pc;
    task.frame.sp = sp;
    task.frame.regs[30] = link_register;
    task.frame.spsr = spsr;
    Ok(())
}

/// Field-by-field copies `frame` into task `id`'s saved register frame.
pub fn save_state(id: TaskId, frame: &Frame) -> Result<(), KernelError> {
    let mut ring = RING.lock();
    let task = ring.slots[id.0].as_mut().ok_or(KernelError::NotFound)?;
    task.frame = *frame;
    Ok(())
}

/// Captures the live register state directly (via the architecture
/// primitive) into the current task's frame, for use at suspension points
/// with no interrupt frame at hand.
///
/// # Safety
/// Must be called with the task ring unlocked and with the expectation that
/// execution later resumes at this call site via [`task_restore_context`].
pub unsafe fn current_save_state() -> Result<(), KernelError> {
    let current = RING.lock().current.ok_or(KernelError::NoTask)?;
    let mut ring = RING.lock();
    let task = ring.slots[current].as_mut().ok_or(KernelError::NotFound)?;
    // SAFETY: delegated to this function's own contract.
    unsafe {
        task_save_context(&mut task.frame);
    }
    Ok(())
}

/// Switches execution to task `id`; never returns on success.
pub fn switch(id: TaskId) -> Result<(), KernelError> {
    let mut ring = RING.lock();
    let task = ring.slots[id.0].as_mut().ok_or(KernelError::NotFound)?;
    if task.frame.sp == 0 || task.frame.pc == 0 {
        return Err(KernelError::InvalidArg);
    }
    task.state = TaskState::Running;
    ring.current = Some(id.0);
    let frame = task.frame;
    drop(ring);
    // SAFETY: `frame` was validated to carry a nonzero SP and PC above.
    unsafe { task_restore_context(&frame) }
}

/// Picks the next `Ready` task after `current` and switches to it.
///
/// If no other task is ready and `current` is still `Running`, returns `Ok`
/// without switching.
pub fn schedule() -> Result<(), KernelError> {
    let (start, current_state) = {
        let ring = RING.lock();
        let current = ring.current.ok_or(KernelError::NoTask)?;
        let task = ring.slots[current].as_ref().expect("current must be occupied");
        (task.next, task.state)
    };

    let mut index = start;
    loop {
        let found = {
            let ring = RING.lock();
            ring.slots[index].as_ref().is_some_and(|task| task.state == TaskState::Ready)
        };
        if found {
            return switch(TaskId(index));
        }
        let next = {
            let ring = RING.lock();
            ring.slots[index].as_ref().map(|task| task.next)
        };
        match next {
            Some(next) if next != start => index = next,
            _ => break,
        }
    }

    if current_state == TaskState::Running {
        Ok(())
    } else {
        Err(KernelError::NoTask)
    }
}

/// Switches to the first `Ready` task found walking from the head of the
/// ring; never returns on success.
pub fn run_first_ever_task() -> Result<(), KernelError> {
    let mut index = RING.lock().head.ok_or(KernelError::NoTask)?;
    let start = index;
    loop {
        let is_ready = RING.lock().slots[index].as_ref().is_some_and(|task| task.state == TaskState::Ready);
        if is_ready {
            return switch(TaskId(index));
        }
        let next = RING.lock().slots[index].as_ref().map(|task| task.next);
        match next {
            Some(next) if next != start => index = next,
            _ => return Err(KernelError::NoTask),
        }
    }
}

/// Marks `id` as `Finished`, then reschedules if it was current.
pub fn return_(id: TaskId) -> Result<(), KernelError> {
    let was_current = {
        let mut ring = RING.lock();
        let task = ring.slots[id.0].as_mut().ok_or(KernelError::NotFound)?;
        task.state = TaskState::Finished;
        ring.current == Some(id.0)
    };
    if was_current {
        schedule()?;
    }
    Ok(())
}

/// Marks `id` as `Blocked`, then reschedules if it was current.
pub fn block(id: TaskId) -> Result<(), KernelError> {
    let was_current = {
        let mut ring = RING.lock();
        let task = ring.slots[id.0].as_mut().ok_or(KernelError::NotFound)?;
        task.state = TaskState::Blocked;
        ring.current == Some(id.0)
    };
    if was_current {
        schedule()?;
    }
    Ok(())
}

/// Marks `id` as `Ready` again, without forcing an immediate reschedule.
pub fn unblock(id: TaskId) -> Result<(), KernelError> {
    let mut ring = RING.lock();
    let task = ring.slots[id.0].as_mut().ok_or(KernelError::NotFound)?;
    if task.state == TaskState::Blocked {
        task.state = TaskState::Ready;
    }
    Ok(())
}

/// Downgrades `id` from `Running` to `Ready`, used by the scheduler's tick
/// handler after saving its state.
pub fn preempt(id: TaskId) -> Result<(), KernelError> {
    let mut ring = RING.lock();
    let task = ring.slots[id.0].as_mut().ok_or(KernelError::NotFound)?;
    if task.state == TaskState::Running {
        task.state = TaskState::Ready;
    }
    Ok(())
}

/// The currently running task, if any.
pub fn current() -> Option<TaskId> {
    RING.lock().current.map(TaskId)
}

/// The lifecycle state of task `id`, if it is still live.
pub fn state(id: TaskId) -> Option<TaskState> {
    RING.lock().slots[id.0].as_ref().map(|task| task.state)
}

/// Records `owner` (a `kernel::process` table index) as task `id`'s owning process.
pub fn set_owner(id: TaskId, owner: usize) -> Result<(), KernelError> {
    let mut ring = RING.lock();
    let task = ring.slots[id.0].as_mut().ok_or(KernelError::NotFound)?;
    task.owner = Some(owner);
    Ok(())
}

/// The owning process's table index for task `id`, if it is still live and owned.
pub fn owner(id: TaskId) -> Option<usize> {
    RING.lock().slots[id.0].as_ref().and_then(|task| task.owner)
}
