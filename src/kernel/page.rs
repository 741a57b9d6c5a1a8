//! Physical page frame allocator: a free/used bitmap plus a parallel
//! per-frame flag byte, backed by the kernel heap.

use crate::{
    error::KernelError,
    kernel::{
        config::{MAX_PAGES, PAGE_SIZE, RESERVED_BOOT_PAGES},
        heap,
    },
    log, sync::SpinLock,
};

/// Per-frame flag bits, tracked alongside the free/used bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageFlags(u8);

impl PageFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Never handed out by [`alloc`] (boot region, bitmap, flag array).
    pub const RESERVED: Self = Self(0b0000_0001);
    /// Currently handed out to a caller.
    pub const ALLOCATED: Self = Self(0b0000_0010);
    /// Present in some page table (set by `kernel::mmu`, not by this module).
    pub const MAPPED: Self = Self(0b0000_0100);
    /// Owned by the kernel rather than a process.
    pub const KERNEL: Self = Self(0b0000_1000);
    /// Zeroed at allocation time.
    pub const ZEROED: Self = Self(0b0001_0000);
    /// Touched since last cleared (unused by this core; reserved for future
    /// working-set accounting).
    pub const ACCESSED: Self = Self(0b0010_0000);
    /// Written since last cleared (same status as `ACCESSED`).
    pub const DIRTY: Self = Self(0b0100_0000);

    const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

struct PageAllocatorState {
    /// One bit per frame; 1 means free.
    free_bitmap: &'static mut [u8],
    /// One byte per frame.
    flags: &'static mut [PageFlags],
    total: usize,
    used: usize,
}

// SAFETY: all access is serialized through `ALLOCATOR`'s spin lock.
unsafe impl Send for PageAllocatorState {}

impl PageAllocatorState {
    fn is_free(&self, index: usize) -> bool {
        self.free_bitmap[index / 8] & (1 << (index % 8)) != 0
    }

    fn set_free(&mut self, index: usize, free: bool) {
        let byte = &mut self.free_bitmap[index / 8];
        let bit = 1 << (index % 8);
        if free {
            *byte |= bit;
        } else {
            *byte &= !bit;
        }
    }

    fn reserve(&mut self, index: usize) {
        if self.is_free(index) {
            self.used += 1;
        }
        self.set_free(index, false);
        self.flags[index] = self.flags[index] | PageFlags::RESERVED;
    }

    fn alloc_one(&mut self, flags: PageFlags) -> Option<usize> {
        for index in 0..self.total {
            if self.is_free(index) {
                self.set_free(index, false);
                self.used += 1;
                self.flags[index] = flags | PageFlags::ALLOCATED;
                return Some(index);
            }
        }
        None
    }

    fn alloc_contiguous(&mut self, count: usize, flags: PageFlags) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0;
        for index in 0..self.total {
            if self.is_free(index) {
                if run_start.is_none() {
                    run_start = Some(index);
                }
                run_len += 1;
                if run_len == count {
                    let start = run_start.unwrap();
                    for offset in 0..count {
                        self.set_free(start + offset, false);
                        self.flags[start + offset] = flags | PageFlags::ALLOCATED;
                    }
                    self.used += count;
                    return Some(start);
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    fn free_one(&mut self, index: usize) {
        if index >= self.total || self.is_free(index) {
            return;
        }
        self.set_free(index, true);
        self.flags[index] = PageFlags::NONE;
        self.used -= 1;
    }
}

static ALLOCATOR: SpinLock<Option<PageAllocatorState>> = SpinLock::new(None);

/// Initializes the page frame allocator over `ram_size` bytes of RAM,
/// reserving the boot region and the allocator's own bookkeeping pages.
///
/// # Safety
/// Must be called exactly once, after `kernel::heap::init`.
pub unsafe fn init(ram_size: usize, kernel_start: usize, kernel_end: usize) -> Result<(), KernelError> {
    let mut guard = ALLOCATOR.lock();
    if guard.is_some() {
        return Err(KernelError::Busy);
    }

    let total = core::cmp::min(ram_size / PAGE_SIZE, MAX_PAGES);
    if total == 0 {
        return Err(KernelError::InvalidArg);
    }

    let bitmap_bytes = total.div_ceil(8);
    let bitmap_ptr = heap::alloc(bitmap_bytes);
    if bitmap_ptr.is_null() {
        return Err(KernelError::NoMemory);
    }
    // SAFETY: `heap::alloc` returned a unique, correctly sized allocation.
    let free_bitmap = unsafe { core::slice::from_raw_parts_mut(bitmap_ptr, bitmap_bytes) };
    free_bitmap.fill(0xFF);

    let flags_bytes = total * core::mem::size_of::<PageFlags>();
    let flags_ptr = heap::alloc(flags_bytes).cast::<PageFlags>();
    if flags_ptr.is_null() {
        return Err(KernelError::NoMemory);
    }
    // SAFETY: `heap::alloc` returned a unique, correctly sized allocation;
    // `PageFlags` is `repr(transparent)` over `u8` so any bit pattern is valid.
    let flags = unsafe { core::slice::from_raw_parts_mut(flags_ptr, total) };
    flags.fill(PageFlags::NONE);

    let mut state = PageAllocatorState {
        free_bitmap,
        flags,
        total,
        used: 0,
    };

    for index in 0..RESERVED_BOOT_PAGES.min(total) {
        state.reserve(index);
    }

    for index in page_range(kernel_start, kernel_end, total) {
        state.reserve(index);
    }
    for index in page_range(bitmap_ptr as usize, bitmap_ptr as usize + bitmap_bytes, total) {
        state.reserve(index);
    }
    for index in page_range(flags_ptr as usize, flags_ptr as usize + flags_bytes, total) {
        state.reserve(index);
    }

    log!(
        "PAGE: {} frames ({} reserved) tracked from physical address 0",
        total, state.used
    );

    *guard = Some(state);
    Ok(())
}

/// The inclusive-exclusive page index range `[start, end)` covers, clamped to
/// `[0, total)`.
fn page_range(start: usize, end: usize, total: usize) -> core::ops::Range<usize> {
    let first = start / PAGE_SIZE;
    let last = end.div_ceil(PAGE_SIZE).min(total);
    first.min(total)..last
}

/// Allocates a single page frame, returning its physical address.
pub fn alloc(flags: PageFlags) -> Result<usize, KernelError> {
    let mut guard = ALLOCATOR.lock();
    let state = guard.as_mut().ok_or(KernelError::NotReady)?;
    let index = state.alloc_one(flags).ok_or(KernelError::NoMemory)?;
    if flags.contains(PageFlags::ZEROED) {
        // SAFETY: the frame is identity-mapped and exclusively owned by the
        // caller from this point on.
        unsafe {
            core::ptr::write_bytes((index * PAGE_SIZE) as *mut u8, 0, PAGE_SIZE);
        }
    }
    Ok(index * PAGE_SIZE)
}

/// Allocates `count` physically contiguous page frames, returning the base
/// physical address.
pub fn alloc_contiguous(count: usize, flags: PageFlags) -> Result<usize, KernelError> {
    let mut guard = ALLOCATOR.lock();
    let state = guard.as_mut().ok_or(KernelError::NotReady)?;
    let start = state
        .alloc_contiguous(count, flags)
        .ok_or(KernelError::NoMemory)?;
    Ok(start * PAGE_SIZE)
}

/// Frees a single page frame previously returned by [`alloc`].
pub fn free(address: usize) {
    let mut guard = ALLOCATOR.lock();
    if let Some(state) = guard.as_mut() {
        state.free_one(address / PAGE_SIZE);
    }
}

/// Frees `count` physically contiguous page frames starting at `address`.
pub fn free_contiguous(address: usize, count: usize) {
    let mut guard = ALLOCATOR.lock();
    if let Some(state) = guard.as_mut() {
        let start = address / PAGE_SIZE;
        for index in start..start + count {
            state.free_one(index);
        }
    }
}

/// Total number of frames tracked.
pub fn total() -> usize {
    ALLOCATOR.lock().as_ref().map_or(0, |state| state.total)
}

/// Number of currently free frames.
pub fn free_count() -> usize {
    ALLOCATOR
        .lock()
        .as_ref()
        .map_or(0, |state| state.total - state.used)
}

/// Number of currently used (allocated or reserved) frames.
pub fn used_count() -> usize {
    ALLOCATOR.lock().as_ref().map_or(0, |state| state.used)
}

/// Logs a one-line summary of frame usage.
pub fn print_stats() {
    log!("PAGE: {} used / {} total", used_count(), total());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_range_clamps_to_total() {
        let range = page_range(0, PAGE_SIZE * 3, 2);
        assert_eq!(range, 0..2);
    }

    #[test]
    fn page_range_rounds_end_up() {
        let range = page_range(PAGE_SIZE, PAGE_SIZE + 1, 100);
        assert_eq!(range, 1..2);
    }

    #[test]
    fn flags_union_preserves_bits() {
        let combined = PageFlags::ALLOCATED | PageFlags::ZEROED;
        assert!(combined.contains(PageFlags::ALLOCATED));
        assert!(combined.contains(PageFlags::ZEROED));
        assert!(!combined.contains(PageFlags::RESERVED));
    }
}
