/// Writes the given information out to the diagnostic sink.
pub fn _print(args: core::fmt::Arguments) {
    use crate::{board, kernel::Serial};
    board::serial().write_fmt(args);
}
/// Discards the input arguments.
pub fn _unused(_args: core::fmt::Arguments) {}

/// Prints to the diagnostic sink.
// <https://doc.rust-lang.org/src/std/macros.rs.html>
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kernel::print::_print(format_args!($($arg)*)));
}

/// Prints, with a newline, to the diagnostic sink.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ({
        $crate::kernel::print::_print(format_args_nl!($($arg)*));
    })
}

/// Prints a diagnostic line prefixed with the current monotonic timestamp.
#[macro_export]
#[cfg(feature = "verbose")]
macro_rules! log {
    ($string:expr) => ({
        let timestamp = $crate::kernel::time::now();

        $crate::kernel::print::_print(format_args_nl!(
            concat!("[{}.{:03}s] ", $string),
            timestamp.as_secs(),
            timestamp.subsec_millis(),
        ));
    });
    ($format_string:expr, $($arg:tt)*) => ({
        let timestamp = $crate::kernel::time::now();

        $crate::kernel::print::_print(format_args_nl!(
            concat!("[{}.{:03}s] ", $format_string),
            timestamp.as_secs(),
            timestamp.subsec_millis(),
            $($arg)*
        ));
    })
}

/// A no-op logging mechanism, used when the `verbose` feature is disabled.
#[cfg(not(feature = "verbose"))]
#[macro_export]
macro_rules! log {
    ($string:expr) => ({
        $crate::kernel::print::_unused(format_args_nl!(
             $string,
        ));
    });
    ($format_string:expr, $($arg:tt)*) => ({
        $crate::kernel::print::_unused(format_args_nl!(
            $format_string,
            $($arg)*
        ));
    })
}
