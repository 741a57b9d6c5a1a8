//! The kernel heap: a dense per-block status byte array over a region of
//! memory placed just after the kernel image, with first-fit allocation over
//! runs of consecutive free blocks.

use crate::{
    error::KernelError,
    kernel::config::{KERNEL_HEAP_BLOCK_SIZE, KERNEL_HEAP_MAX_SIZE, KERNEL_HEAP_MIN_SIZE, KERNEL_HEAP_RAM_DIVISOR},
    log, sync::SpinLock,
};
use core::alloc::{GlobalAlloc, Layout};

/// Status bit: the block is handed out (vs. free).
const TAKEN: u8 = 0b001;
/// Status bit: this is the first block of an allocation.
const IS_FIRST: u8 = 0b010;
/// Status bit: the next block belongs to the same allocation.
const HAS_NEXT: u8 = 0b100;

/// Rounds `value` down to the nearest multiple of `align` (`align` must be a
/// power of two).
const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Rounds `value` up to the nearest multiple of `align` (`align` must be a
/// power of two).
const fn align_up(value: usize, align: usize) -> usize {
    align_down(value + align - 1, align)
}

/// Picks the heap's total size given the amount of installed RAM.
const fn heap_size_for(ram_size: usize) -> usize {
    let target = ram_size / KERNEL_HEAP_RAM_DIVISOR;
    let clamped = if target < KERNEL_HEAP_MIN_SIZE {
        KERNEL_HEAP_MIN_SIZE
    } else if target > KERNEL_HEAP_MAX_SIZE {
        KERNEL_HEAP_MAX_SIZE
    } else {
        target
    };
    align_down(clamped, KERNEL_HEAP_BLOCK_SIZE)
}

/// Scans `map` for the first run of `needed` consecutive free blocks.
fn find_free_run(map: &[u8], needed: usize) -> Option<usize> {
    if needed == 0 {
        return None;
    }
    let mut run_start = None;
    let mut run_len = 0usize;
    for (index, &status) in map.iter().enumerate() {
        if status & TAKEN == 0 {
            if run_start.is_none() {
                run_start = Some(index);
            }
            run_len += 1;
            if run_len == needed {
                return run_start;
            }
        } else {
            run_start = None;
            run_len = 0;
        }
    }
    None
}

/// Marks `len` consecutive blocks starting at `start` as taken, chaining them
/// via `IS_FIRST`/`HAS_NEXT`.
fn mark_allocated(map: &mut [u8], start: usize, len: usize) {
    for offset in 0..len {
        let mut status = TAKEN;
        if offset == 0 {
            status |= IS_FIRST;
        }
        if offset + 1 < len {
            status |= HAS_NEXT;
        }
        map[start + offset] = status;
    }
}

/// Clears the chain of blocks starting at `start` (which must be marked
/// `IS_FIRST`), returning how many blocks were freed.
fn mark_freed(map: &mut [u8], start: usize) -> usize {
    let mut index = start;
    let mut count = 0;
    loop {
        let status = map[index];
        map[index] = 0;
        count += 1;
        if status & HAS_NEXT == 0 {
            break;
        }
        index += 1;
    }
    count
}

/// Number of 4 KiB blocks needed to hold `size` bytes.
const fn blocks_needed(size: usize) -> usize {
    align_up(size, KERNEL_HEAP_BLOCK_SIZE) / KERNEL_HEAP_BLOCK_SIZE
}

/// The live heap region: a block map and the data area it describes.
struct HeapState {
    /// One status byte per block.
    map: &'static mut [u8],
    /// Base address of block 0's data.
    data_start: *mut u8,
    /// Running count of allocations made, for diagnostics.
    allocations: u64,
    /// Running count of frees made, for diagnostics.
    frees: u64,
}

// SAFETY: the heap is single-core and protected end-to-end by `HEAP`'s
// `SpinLock`; `data_start` is never read concurrently outside that lock.
unsafe impl Send for HeapState {}

impl HeapState {
    fn block_index(&self, pointer: *mut u8) -> Option<usize> {
        let offset = (pointer as usize).checked_sub(self.data_start as usize)?;
        if offset % KERNEL_HEAP_BLOCK_SIZE != 0 {
            return None;
        }
        let index = offset / KERNEL_HEAP_BLOCK_SIZE;
        if index < self.map.len() {
            Some(index)
        } else {
            None
        }
    }

    fn alloc(&mut self, size: usize) -> *mut u8 {
        let needed = blocks_needed(size);
        let Some(start) = find_free_run(self.map, needed) else {
            return core::ptr::null_mut();
        };
        mark_allocated(self.map, start, needed);
        self.allocations += 1;
        // SAFETY: `start` is within `self.map`'s range by construction of
        // `find_free_run`, so the resulting pointer is within the heap's data
        // region.
        unsafe { self.data_start.add(start * KERNEL_HEAP_BLOCK_SIZE) }
    }

    fn free(&mut self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }
        let Some(index) = self.block_index(pointer) else {
            debug_assert!(false, "freed pointer does not belong to the kernel heap");
            return;
        };
        debug_assert!(
            self.map[index] & IS_FIRST != 0,
            "freed pointer does not mark the first block of an allocation"
        );
        mark_freed(self.map, index);
        self.frees += 1;
    }
}

static HEAP: SpinLock<Option<HeapState>> = SpinLock::new(None);

/// Initializes the kernel heap immediately after the kernel image.
///
/// # Safety
/// Must be called exactly once, before any allocation is attempted, and
/// `kernel_end` must be the first byte past the loaded kernel image.
pub unsafe fn init(ram_size: usize, kernel_end: usize) -> Result<(), KernelError> {
    let mut guard = HEAP.lock();
    if guard.is_some() {
        return Err(KernelError::Busy);
    }

    let heap_size = heap_size_for(ram_size);
    if heap_size == 0 {
        return Err(KernelError::InvalidArg);
    }
    let num_blocks = heap_size / KERNEL_HEAP_BLOCK_SIZE;

    let map_start = kernel_end;
    let data_start = align_up(map_start + num_blocks, KERNEL_HEAP_BLOCK_SIZE);

    // SAFETY: delegated to the caller's contract: `kernel_end..data_start +
    // heap_size` is unused memory reserved for the heap.
    let map = unsafe { core::slice::from_raw_parts_mut(map_start as *mut u8, num_blocks) };
    map.fill(0);

    log!(
        "HEAP: {} blocks of {} bytes at {:#x}, map at {:#x}",
        num_blocks, KERNEL_HEAP_BLOCK_SIZE, data_start, map_start
    );

    *guard = Some(HeapState {
        map,
        data_start: data_start as *mut u8,
        allocations: 0,
        frees: 0,
    });
    Ok(())
}

/// Allocates `size` bytes, rounded up to block granularity. Returns null on
/// failure.
pub fn alloc(size: usize) -> *mut u8 {
    let mut guard = HEAP.lock();
    match guard.as_mut() {
        Some(state) => state.alloc(size),
        None => core::ptr::null_mut(),
    }
}

/// Frees a pointer previously returned by [`alloc`].
pub fn free(pointer: *mut u8) {
    let mut guard = HEAP.lock();
    if let Some(state) = guard.as_mut() {
        state.free(pointer);
    }
}

/// Logs allocation/free counts, called during shutdown diagnostics.
pub fn log_allocator() {
    let guard = HEAP.lock();
    match guard.as_ref() {
        Some(state) => log!(
            "HEAP: {} allocations, {} frees outstanding",
            state.allocations,
            state.allocations.saturating_sub(state.frees)
        ),
        None => log!("HEAP: not initialized"),
    }
}

/// The crate-wide heap, backing `alloc::{Box, Vec, ...}`.
struct KernelAllocator;

// SAFETY: `alloc`/`free` serialize all access through `HEAP`'s spin lock and
// never hand out overlapping regions, satisfying `GlobalAlloc`'s contract.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        alloc(layout.size())
    }

    unsafe fn dealloc(&self, pointer: *mut u8, _layout: Layout) {
        free(pointer);
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_ram_fifth_within_bounds() {
        assert_eq!(heap_size_for(40 * 1024 * 1024), 8 * 1024 * 1024);
    }

    #[test]
    fn clamps_to_minimum() {
        assert_eq!(heap_size_for(1024), KERNEL_HEAP_MIN_SIZE);
    }

    #[test]
    fn clamps_to_maximum() {
        assert_eq!(heap_size_for(usize::MAX / 2), KERNEL_HEAP_MAX_SIZE);
    }

    #[test]
    fn rounds_down_to_block_multiple() {
        let size = heap_size_for(20 * 1024 * 1024 + 1);
        assert_eq!(size % KERNEL_HEAP_BLOCK_SIZE, 0);
    }

    #[test]
    fn first_fit_picks_earliest_run() {
        let mut map = [0u8; 8];
        map[0] = TAKEN | IS_FIRST;
        let start = find_free_run(&map, 2).unwrap();
        assert_eq!(start, 1);
    }

    #[test]
    fn alloc_marks_chain() {
        let mut map = [0u8; 4];
        mark_allocated(&mut map, 1, 3);
        assert_eq!(map[0], 0);
        assert_eq!(map[1], TAKEN | IS_FIRST | HAS_NEXT);
        assert_eq!(map[2], TAKEN | HAS_NEXT);
        assert_eq!(map[3], TAKEN);
    }

    #[test]
    fn free_clears_whole_chain() {
        let mut map = [0u8; 4];
        mark_allocated(&mut map, 0, 3);
        let freed = mark_freed(&mut map, 0);
        assert_eq!(freed, 3);
        assert!(map.iter().all(|&status| status == 0));
    }

    #[test]
    fn no_run_found_returns_none() {
        let map = [TAKEN | IS_FIRST; 4];
        assert!(find_free_run(&map, 1).is_none());
    }
}
