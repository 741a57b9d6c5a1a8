/// Ensures that the function it is invoked in is only ever called once.
///
/// Panics on a second invocation. Used to guard every subsystem `init()`.
#[macro_export]
macro_rules! call_once {
    () => {{
        use core::sync::atomic::{AtomicBool, Ordering::AcqRel};
        static IS_FIRST_INVOCATION: AtomicBool = AtomicBool::new(true);
        assert!(
            IS_FIRST_INVOCATION.swap(false, AcqRel),
            "this initializer must run at most once"
        );
    }};
}
