use core::cell::OnceCell;

/// A cell that can be written exactly once, then read freely.
///
/// Used for every subsystem singleton that is populated during boot and read-only
/// thereafter (the page allocator, the MMU root, the process table, ...).
#[derive(Debug)]
pub struct SetOnce<T> {
    inner: OnceCell<T>,
}

impl<T> SetOnce<T> {
    /// Creates an unset `SetOnce`.
    pub const fn new() -> Self {
        Self {
            inner: OnceCell::new(),
        }
    }

    /// Sets the value.
    ///
    /// Panics if the value is already set.
    pub fn set(&self, value: T) {
        assert!(self.inner.set(value).is_ok(), "SetOnce already set");
    }

    /// Gets the value.
    ///
    /// Panics if the value is not yet set.
    pub fn get(&self) -> &T {
        self.inner
            .get()
            .expect("SetOnce accessed before being set")
    }

    /// Gets the value, if it has been set.
    pub fn try_get(&self) -> Option<&T> {
        self.inner.get()
    }
}

// SAFETY: writes happen once, during single-threaded boot, before any concurrent read.
unsafe impl<T> Sync for SetOnce<T> {}
// SAFETY: see above.
unsafe impl<T> Send for SetOnce<T> {}
