//! Core of a bare-metal AArch64 kernel for the QEMU `virt` platform.
#![no_main]
#![no_std]
#![feature(const_mut_refs)]
#![feature(const_option)]
#![feature(const_trait_impl)]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![feature(let_chains)]
#![feature(panic_info_message)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(test_runner)]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;

/// Architecture-specific implementations (system registers, exceptions, boot, timer)
pub mod architecture;
/// Board-specific implementations (UART, GICv2)
pub mod board;
/// Crate-wide error taxonomy
pub mod error;
/// Kernel subsystems: heap, page allocator, MMU, tensor pool, tasks, processes, scheduler
pub mod kernel;
/// Mutual exclusion for process-wide singleton state
pub mod sync;

/// The default runner for host-independent unit tests and on-target test cases.
pub fn test_runner(tests: &[&TestCase]) -> ! {
    const DEFAULT_LOOPS: u64 = 1;
    let num_loops: u64 = option_env!("LOOP")
        .and_then(|v| str::parse(v).ok())
        .unwrap_or(DEFAULT_LOOPS);

    for test in tests {
        for i in 1..=num_loops {
            println!("[{}/{}] {}:", i, num_loops, test.name);
            (test.test)();
            println!(".... PASSED");
        }
    }

    architecture::shutdown(0);
}

/// Registers a test to run under the in-kernel test harness.
#[macro_export]
macro_rules! add_test {
    ($name: ident, $test: block) => {
        #[test_case]
        const $name: $crate::TestCase = $crate::TestCase {
            name: stringify!($name),
            test: || $test,
        };
    };
}

/// A single entry in the in-kernel test harness.
pub struct TestCase {
    /// Name of the test, for progress reporting.
    pub name: &'static str,
    /// The test body.
    pub test: fn(),
}

#[cfg(test)]
#[no_mangle]
fn kernel_main() {
    test_main();
}
