//! The closed error taxonomy shared by every fallible core operation.
use core::fmt;

/// Error kind returned by core operations, drawn from a small closed set.
///
/// Every fallible operation in the core returns `Result<T, KernelError>`; there is no
/// transparent retry anywhere in the crate. Syscall wrappers collapse this into a negative
/// `isize` at the trap boundary (see [`KernelError::as_negative_isize`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    /// Null, misaligned, out-of-range, or semantically incoherent input.
    InvalidArg = 1,
    /// Heap or page allocator could not satisfy the request.
    NoMemory = 2,
    /// Virtual address not mapped in the active tables.
    NoMapping = 3,
    /// Walk found a non-table intermediate or a type-incoherent leaf.
    InvalidMapping = 4,
    /// Subsystem used before its `init` completed.
    NotReady = 5,
    /// Slot or resource already taken.
    Busy = 6,
    /// Catastrophic: MMU enable failed, corruption detected.
    Fault = 7,
    /// Scheduler found no runnable task.
    NoTask = 8,
    /// Bounded table is full.
    AtMax = 9,
    /// Syscall number out of range or unregistered.
    BadSyscall = 10,
    /// Lookup miss.
    NotFound = 11,
    /// Slot or resource already in use (distinct spelling of `Busy` for table registration).
    InUse = 12,
}

impl KernelError {
    /// The negative-errno convention used to return errors across the syscall boundary.
    #[must_use]
    pub const fn as_negative_isize(self) -> isize {
        -(self as i32 as isize)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::InvalidArg => "invalid argument",
            Self::NoMemory => "out of memory",
            Self::NoMapping => "virtual address not mapped",
            Self::InvalidMapping => "page table walk found an incoherent entry",
            Self::NotReady => "subsystem not yet initialized",
            Self::Busy => "resource busy",
            Self::Fault => "fatal fault",
            Self::NoTask => "no runnable task",
            Self::AtMax => "bounded table is full",
            Self::BadSyscall => "unregistered syscall number",
            Self::NotFound => "not found",
            Self::InUse => "slot already in use",
        };
        f.write_str(message)
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = core::result::Result<T, KernelError>;
