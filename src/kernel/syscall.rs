//! Fixed SVC dispatch table, reached from the trap plane on `svc #0`.
//!
//! Every entry takes the four general-purpose argument registers (`x1..x4`
//! at the trap site, surfaced here as `args`) and returns the value to place
//! back into `x0`. Errors are encoded as `KernelError::as_negative_isize()`,
//! matching the negative-errno convention used everywhere else in the core.

use crate::{
    architecture,
    error::KernelError,
    kernel::{process, task},
};

/// `PROCESS_EXIT(code)`: terminates the calling process and does not return.
const PROCESS_EXIT: u64 = 0;
/// `PROCESS_MALLOC(size) -> ptr`.
const PROCESS_MALLOC: u64 = 1;
/// `PROCESS_FREE(ptr) -> status`.
const PROCESS_FREE: u64 = 2;
/// `PROCESS_GET_ARGS(argc_out, argv_out) -> status`.
const PROCESS_GET_ARGS: u64 = 3;
/// `PRINT_CHAR(byte) -> 0`.
const PRINT_CHAR: u64 = 4;
/// `PRINT_STRING(ptr) -> status`.
const PRINT_STRING: u64 = 5;

/// Dispatches syscall `number` with `args`, returning the value to place
/// back into `x0`.
pub fn dispatch(number: u64, args: [u64; 4]) -> u64 {
    match number {
        PROCESS_EXIT => process_exit(args),
        PROCESS_MALLOC => process_malloc(args),
        PROCESS_FREE => process_free(args),
        PROCESS_GET_ARGS => process_get_args(args),
        PRINT_CHAR => print_char(args),
        PRINT_STRING => print_string(args),
        _ => KernelError::BadSyscall.as_negative_isize() as u64,
    }
}

/// Terminates the calling process and switches to whatever task is ready
/// next. Diverges: there is no caller left to return `x0` to.
fn process_exit(args: [u64; 4]) -> u64 {
    let code = args[0];
    if let Some(pid) = process::current() {
        crate::log!("SYSCALL: pid {} exited with code {}", pid.raw(), code);
        let _ = process::terminate(pid);
    }
    match task::run_first_ever_task() {
        Ok(()) => unreachable!("switching diverges on success"),
        Err(_) => {
            crate::log!("SYSCALL: no runnable task after process exit, halting");
            architecture::shutdown(0)
        }
    }
}

fn process_malloc(args: [u64; 4]) -> u64 {
    let Some(pid) = process::current() else {
        return KernelError::NoTask.as_negative_isize() as u64;
    };
    match process::malloc(pid, args[0] as usize) {
        Ok(ptr) => ptr as u64,
        Err(err) => err.as_negative_isize() as u64,
    }
}

fn process_free(args: [u64; 4]) -> u64 {
    let Some(pid) = process::current() else {
        return KernelError::NoTask.as_negative_isize() as u64;
    };
    let ptr = args[0] as usize as *mut u8;
    match process::free(pid, ptr) {
        Ok(()) => 0,
        Err(err) => err.as_negative_isize() as u64,
    }
}

/// Writes the calling process's `argc`/`argv` through the two out-pointers
/// supplied in `args[0]`/`args[1]`.
fn process_get_args(args: [u64; 4]) -> u64 {
    let Some(pid) = process::current() else {
        return KernelError::NoTask.as_negative_isize() as u64;
    };
    let (argc, argv) = match process::get_arguments(pid) {
        Ok(value) => value,
        Err(err) => return err.as_negative_isize() as u64,
    };
    let argc_out = args[0] as usize as *mut u64;
    let argv_out = args[1] as usize as *mut *const *mut u8;
    if argc_out.is_null() || argv_out.is_null() {
        return KernelError::InvalidArg.as_negative_isize() as u64;
    }
    // SAFETY: this kernel has no separate user address space to validate
    // against; the caller-supplied addresses are trusted writable output slots.
    unsafe {
        argc_out.write(argc as u64);
        argv_out.write(argv);
    }
    0
}

fn print_char(args: [u64; 4]) -> u64 {
    crate::print!("{}", args[0] as u8 as char);
    0
}

/// Emits the NUL-terminated string at `args[0]` on the diagnostic sink,
/// scanning byte by byte until the terminator (no length, no UTF-8 check).
fn print_string(args: [u64; 4]) -> u64 {
    let mut ptr = args[0] as usize as *const u8;
    if ptr.is_null() {
        return KernelError::InvalidArg.as_negative_isize() as u64;
    }
    loop {
        // SAFETY: see `process_get_args`; no separate address space to check
        // against. The caller is trusted to terminate the string with NUL.
        let byte = unsafe { ptr.read() };
        if byte == 0 {
            break;
        }
        crate::print!("{}", byte as char);
        // SAFETY: still within the caller-supplied NUL-terminated string.
        ptr = unsafe { ptr.add(1) };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_number_returns_bad_syscall() {
        let result = dispatch(6, [0; 4]);
        assert_eq!(result as i64, KernelError::BadSyscall.as_negative_isize() as i64);
    }

    #[test]
    fn malloc_without_a_current_process_returns_no_task() {
        let result = dispatch(PROCESS_MALLOC, [64, 0, 0, 0]);
        assert_eq!(result as i64, KernelError::NoTask.as_negative_isize() as i64);
    }

    #[test]
    fn free_without_a_current_process_returns_no_task() {
        let result = dispatch(PROCESS_FREE, [0; 4]);
        assert_eq!(result as i64, KernelError::NoTask.as_negative_isize() as i64);
    }

    #[test]
    fn get_args_without_a_current_process_returns_no_task() {
        let result = dispatch(PROCESS_GET_ARGS, [0; 4]);
        assert_eq!(result as i64, KernelError::NoTask.as_negative_isize() as i64);
    }

    #[test]
    fn print_string_scans_to_nul_terminator() {
        let bytes = [b'h', b'i', 0];
        let result = dispatch(PRINT_STRING, [bytes.as_ptr() as u64, 0, 0, 0]);
        assert_eq!(result, 0);
    }

    #[test]
    fn print_string_rejects_null_pointer() {
        let result = dispatch(PRINT_STRING, [0, 0, 0, 0]);
        assert_eq!(result as i64, KernelError::InvalidArg.as_negative_isize() as i64);
    }
}
