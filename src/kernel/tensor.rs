//! A small AI-workload memory pool layered on the kernel heap: a bitmap
//! region for sub-`MIN_BLOCK_SIZE` allocations plus a best-fit free list for
//! larger ones, and tensor descriptors allocated from it.

use crate::{
    error::KernelError,
    kernel::{
        config::{AI_MEMORY_MAX_BLOCKS, AI_MEMORY_MIN_BLOCK_SIZE, AI_MEMORY_POOL_RATIO, MAX_MEMORY_REGIONS},
        heap,
    },
    log, sync::SpinLock,
};
use alloc::vec::Vec;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// Element data type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum DType {
    I8 = 0,
    I16 = 1,
    I32 = 2,
    F16 = 3,
    F32 = 4,
}

impl DType {
    /// Size of one element, in bytes.
    pub const fn elem_size(self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 | Self::F16 => 2,
            Self::I32 | Self::F32 => 4,
        }
    }

    /// Advisory alignment ceiling used when `TensorFlags::ALIGNED` is set.
    pub const fn alignment(self) -> usize {
        match self {
            Self::I8 => 16,
            Self::I16 | Self::F16 => 16,
            Self::I32 | Self::F32 => 32,
        }
    }
}

/// Memory layout tag of a tensor, determining its default strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Layout {
    RowMajor = 0,
    ColumnMajor = 1,
    Nchw = 2,
    Nhwc = 3,
}

/// Computes strides (in elements) for `shape` under `layout`.
fn strides_for(shape: &[usize], layout: Layout) -> Vec<usize> {
    let ndim = shape.len();
    match layout {
        Layout::Nchw if ndim == 4 => {
            vec![shape[1] * shape[2] * shape[3], shape[2] * shape[3], shape[3], 1]
        }
        Layout::Nhwc if ndim == 4 => {
            vec![shape[1] * shape[2] * shape[3], shape[2] * shape[3], shape[3], 1]
        }
        Layout::ColumnMajor => {
            let mut strides = alloc::vec![1usize; ndim];
            for i in 1..ndim {
                strides[i] = strides[i - 1] * shape[i - 1];
            }
            strides
        }
        // ROW_MAJOR, and NCHW/NHWC falling back to it when ndim != 4.
        _ => {
            let mut strides = alloc::vec![1usize; ndim];
            for i in (0..ndim.saturating_sub(1)).rev() {
                strides[i] = strides[i + 1] * shape[i + 1];
            }
            strides
        }
    }
}

/// Bitset of tensor allocation/view flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorFlags(u32);

impl TensorFlags {
    pub const NONE: Self = Self(0);
    pub const ZEROED: Self = Self(1 << 0);
    pub const ALIGNED: Self = Self(1 << 1);
    pub const CONTIGUOUS: Self = Self(1 << 2);
    pub const CACHEABLE: Self = Self(1 << 3);
    pub const UNCACHEABLE: Self = Self(1 << 4);
    pub const DMA: Self = Self(1 << 5);

    const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for TensorFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A tensor: shape, strides, element type, layout, and owned (or borrowed, if
/// a view) data.
pub struct Tensor {
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub dtype: DType,
    pub layout: Layout,
    pub flags: TensorFlags,
    data: *mut u8,
    size: usize,
    /// `true` if `data` is borrowed from a parent tensor rather than owned.
    is_view: bool,
}

impl Tensor {
    /// Raw pointer to the tensor's first element.
    pub fn data_ptr(&self) -> *mut u8 {
        self.data
    }

    /// Total element count (`product(shape)`).
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

// --- Pool allocator -------------------------------------------------------

/// Bytes of header preceding every large-block allocation, storing its
/// region size; kept a multiple of 32 so carve-out boundaries stay aligned
/// to the largest alignment in the `DType` table.
const HEADER_SIZE: usize = 32;
const CHUNK_SIZE: usize = 64 * 1024;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

struct FreeBlock {
    ptr: usize,
    size: usize,
}

struct PoolState {
    small_base: usize,
    small_count: usize,
    small_bitmap: &'static mut [u64],
    free_list: Vec<FreeBlock>,
    total_bytes: usize,
    used_bytes: usize,
    peak_bytes: usize,
    allocations: u64,
    deallocations: u64,
}

// SAFETY: access is always serialized through `POOL`'s spin lock.
unsafe impl Send for PoolState {}

impl PoolState {
    fn alloc_small(&mut self) -> Option<usize> {
        for word_index in 0..self.small_bitmap.len() {
            let word = self.small_bitmap[word_index];
            if word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let index = word_index * 64 + bit;
                if index >= self.small_count {
                    return None;
                }
                self.small_bitmap[word_index] |= 1 << bit;
                return Some(self.small_base + index * AI_MEMORY_MIN_BLOCK_SIZE);
            }
        }
        None
    }

    fn free_small(&mut self, ptr: usize) {
        let index = (ptr - self.small_base) / AI_MEMORY_MIN_BLOCK_SIZE;
        self.small_bitmap[index / 64] &= !(1 << (index % 64));
    }

    fn in_small_region(&self, ptr: usize) -> bool {
        ptr >= self.small_base && ptr < self.small_base + self.small_count * AI_MEMORY_MIN_BLOCK_SIZE
    }

    /// Finds best-fit space for `size` bytes aligned to `alignment`, carving
    /// the data pointer out of a block's tail so the header can sit right
    /// before it regardless of where alignment padding falls.
    fn alloc_large(&mut self, size: usize, alignment: usize) -> Option<usize> {
        let data_size = align_up(size, HEADER_SIZE);

        let mut best: Option<(usize, usize, usize)> = None;
        for (index, block) in self.free_list.iter().enumerate() {
            let data_ptr = align_up(block.ptr + HEADER_SIZE, alignment);
            let required = data_ptr + data_size - block.ptr;
            if block.size >= required && best.map_or(true, |(_, best_size, _)| block.size < best_size) {
                best = Some((index, block.size, required));
            }
        }

        let (block_ptr, consumed) = if let Some((index, block_size, required)) = best {
            let block = self.free_list.swap_remove(index);
            let remainder = block_size - required;
            if remainder >= AI_MEMORY_MIN_BLOCK_SIZE {
                self.free_list.push(FreeBlock {
                    ptr: block.ptr + required,
                    size: remainder,
                });
                (block.ptr, required)
            } else {
                (block.ptr, block_size)
            }
        } else {
            let worst_case = HEADER_SIZE + alignment + data_size;
            let chunk_size = align_up(worst_case, CHUNK_SIZE);
            let chunk_ptr = heap::alloc(chunk_size);
            if chunk_ptr.is_null() {
                return None;
            }
            let chunk_ptr = chunk_ptr as usize;
            let data_ptr = align_up(chunk_ptr + HEADER_SIZE, alignment);
            let required = data_ptr + data_size - chunk_ptr;
            let remainder = chunk_size - required;
            if remainder >= AI_MEMORY_MIN_BLOCK_SIZE {
                if self.free_list.len() < MAX_MEMORY_REGIONS {
                    self.free_list.push(FreeBlock {
                        ptr: chunk_ptr + required,
                        size: remainder,
                    });
                } else {
                    log!("TENSOR: free list full, leaking {} leftover bytes", remainder);
                }
                (chunk_ptr, required)
            } else {
                (chunk_ptr, chunk_size)
            }
        };

        let data_ptr = align_up(block_ptr + HEADER_SIZE, alignment);
        let header_ptr = data_ptr - HEADER_SIZE;
        // SAFETY: `header_ptr` falls within `[block_ptr, block_ptr + consumed)`,
        // which is at least `HEADER_SIZE` bytes since `data_ptr >= block_ptr + HEADER_SIZE`.
        unsafe {
            (header_ptr as *mut u64).write(block_ptr as u64);
            ((header_ptr + 8) as *mut u64).write(consumed as u64);
        }
        Some(data_ptr)
    }

    fn free_large(&mut self, ptr: usize) {
        let header_ptr = ptr - HEADER_SIZE;
        // SAFETY: `header_ptr` was written by a matching `alloc_large`.
        let (block_ptr, size) = unsafe {
            ((header_ptr as *const u64).read() as usize, ((header_ptr + 8) as *const u64).read() as usize)
        };
        if self.free_list.len() < MAX_MEMORY_REGIONS {
            self.free_list.push(FreeBlock { ptr: block_ptr, size });
        } else {
            log!("TENSOR: free list full, leaking {} bytes", size);
        }
    }
}

static POOL: SpinLock<Option<PoolState>> = SpinLock::new(None);

/// Snapshot of pool usage, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub peak_bytes: usize,
    pub allocations: u64,
    pub deallocations: u64,
}

/// Carves out the tensor pool from the kernel heap.
///
/// # Safety
/// Must be called exactly once, after `kernel::heap::init`.
pub unsafe fn init(pool_size: usize) -> Result<(), KernelError> {
    let mut guard = POOL.lock();
    if guard.is_some() {
        return Err(KernelError::Busy);
    }

    let small_region_size = (pool_size / AI_MEMORY_POOL_RATIO) & !(AI_MEMORY_MIN_BLOCK_SIZE - 1);
    let small_count = (small_region_size / AI_MEMORY_MIN_BLOCK_SIZE).min(AI_MEMORY_MAX_BLOCKS);
    let small_region_size = small_count * AI_MEMORY_MIN_BLOCK_SIZE;

    let small_base = heap::alloc(small_region_size);
    if small_base.is_null() {
        return Err(KernelError::NoMemory);
    }

    let bitmap_words = small_count.div_ceil(64).max(1);
    let bitmap_ptr = heap::alloc(bitmap_words * 8).cast::<u64>();
    if bitmap_ptr.is_null() {
        return Err(KernelError::NoMemory);
    }
    // SAFETY: `heap::alloc` returned a unique, correctly sized allocation.
    let small_bitmap = unsafe { core::slice::from_raw_parts_mut(bitmap_ptr, bitmap_words) };
    small_bitmap.fill(0);

    let mut free_list = Vec::new();
    let remaining = pool_size.saturating_sub(small_region_size);
    if remaining >= HEADER_SIZE + AI_MEMORY_MIN_BLOCK_SIZE {
        let chunk = heap::alloc(remaining);
        if !chunk.is_null() {
            free_list.push(FreeBlock {
                ptr: chunk as usize,
                size: remaining,
            });
        }
    }

    log!(
        "TENSOR: pool of {} bytes ({} small blocks of {} bytes)",
        pool_size, small_count, AI_MEMORY_MIN_BLOCK_SIZE
    );

    *guard = Some(PoolState {
        small_base: small_base as usize,
        small_count,
        small_bitmap,
        free_list,
        total_bytes: pool_size,
        used_bytes: 0,
        peak_bytes: 0,
        allocations: 0,
        deallocations: 0,
    });
    Ok(())
}

/// Allocates `size` bytes aligned to `alignment` from the pool, preferring
/// the small-block bitmap when the request fits a block and the bitmap's
/// fixed block alignment satisfies `alignment`; falls back to the best-fit
/// large-block path otherwise. Never returns an address less aligned than
/// requested.
pub fn alloc(size: usize, alignment: usize) -> Result<usize, KernelError> {
    let mut guard = POOL.lock();
    let state = guard.as_mut().ok_or(KernelError::NotReady)?;

    let small_eligible = size <= AI_MEMORY_MIN_BLOCK_SIZE
        && alignment <= AI_MEMORY_MIN_BLOCK_SIZE
        && AI_MEMORY_MIN_BLOCK_SIZE % alignment.max(1) == 0;

    let ptr = if small_eligible {
        state.alloc_small()
    } else {
        state.alloc_large(size, alignment)
    }
    .ok_or(KernelError::NoMemory)?;

    state.used_bytes += size;
    state.peak_bytes = state.peak_bytes.max(state.used_bytes);
    state.allocations += 1;
    Ok(ptr)
}

/// Returns a pointer previously returned by [`alloc`].
pub fn free(ptr: usize, size: usize) {
    let mut guard = POOL.lock();
    if let Some(state) = guard.as_mut() {
        if state.in_small_region(ptr) {
            state.free_small(ptr);
        } else {
            state.free_large(ptr);
        }
        state.used_bytes = state.used_bytes.saturating_sub(size);
        state.deallocations += 1;
    }
}

/// A snapshot of pool usage and allocation counters.
pub fn pool_stats() -> PoolStats {
    let guard = POOL.lock();
    guard.as_ref().map_or(
        PoolStats {
            total_bytes: 0,
            used_bytes: 0,
            peak_bytes: 0,
            allocations: 0,
            deallocations: 0,
        },
        |state| PoolStats {
            total_bytes: state.total_bytes,
            used_bytes: state.used_bytes,
            peak_bytes: state.peak_bytes,
            allocations: state.allocations,
            deallocations: state.deallocations,
        },
    )
}

/// Logs a one-line summary of pool usage.
pub fn log_stats() {
    let stats = pool_stats();
    log!(
        "TENSOR: {}/{} bytes used (peak {}), {} allocs / {} frees",
        stats.used_bytes, stats.total_bytes, stats.peak_bytes, stats.allocations, stats.deallocations
    );
}

// --- Tensor descriptor operations -----------------------------------------

/// Allocates a tensor with the given `shape`, `dtype`, and `layout`.
pub fn tensor_create(
    shape: &[usize],
    dtype: DType,
    layout: Layout,
    flags: TensorFlags,
) -> Result<Tensor, KernelError> {
    let element_count: usize = shape.iter().product();
    let size = element_count * dtype.elem_size();
    let alignment = if flags.contains(TensorFlags::ALIGNED) {
        dtype.alignment()
    } else {
        8
    };

    let ptr = alloc(size, alignment)?;
    if flags.contains(TensorFlags::ZEROED) {
        // SAFETY: `alloc` returned a unique allocation of at least `size`
        // bytes.
        unsafe {
            core::ptr::write_bytes(ptr as *mut u8, 0, size);
        }
    }

    Ok(Tensor {
        shape: shape.to_vec(),
        strides: strides_for(shape, layout),
        dtype,
        layout,
        flags,
        data: ptr as *mut u8,
        size,
        is_view: false,
    })
}

/// Frees a tensor's data.
pub fn tensor_destroy(tensor: Tensor) {
    if !tensor.is_view {
        free(tensor.data as usize, tensor.size);
    }
}

/// Reshapes a tensor in place; the new shape must have the same element
/// count.
pub fn tensor_reshape(tensor: &mut Tensor, new_shape: &[usize]) -> Result<(), KernelError> {
    let old_count: usize = tensor.shape.iter().product();
    let new_count: usize = new_shape.iter().product();
    if old_count != new_count {
        return Err(KernelError::InvalidArg);
    }
    tensor.shape = new_shape.to_vec();
    tensor.strides = strides_for(new_shape, tensor.layout);
    Ok(())
}

/// Recomputes a tensor's strides for a new layout, without moving data.
pub fn tensor_set_layout(tensor: &mut Tensor, layout: Layout) {
    tensor.layout = layout;
    tensor.strides = strides_for(&tensor.shape, layout);
}

/// Creates a view into `tensor` starting at `start_indices`, with a narrower
/// `shape`; the view shares data with its parent.
pub fn tensor_view(tensor: &Tensor, start_indices: &[usize], shape: &[usize]) -> Tensor {
    let element_offset: usize = start_indices
        .iter()
        .zip(tensor.strides.iter())
        .map(|(index, stride)| index * stride)
        .sum();
    let byte_offset = element_offset * tensor.dtype.elem_size();

    Tensor {
        shape: shape.to_vec(),
        strides: tensor.strides.clone(),
        dtype: tensor.dtype,
        layout: tensor.layout,
        flags: tensor.flags,
        // SAFETY: `byte_offset` is within the parent's allocation as long as
        // the caller's `start_indices`/`shape` are in bounds, which is this
        // function's precondition.
        data: unsafe { tensor.data.add(byte_offset) },
        size: shape.iter().product::<usize>() * tensor.dtype.elem_size(),
        is_view: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_strides() {
        let strides = strides_for(&[2, 3, 4], Layout::RowMajor);
        assert_eq!(strides, alloc::vec![12, 4, 1]);
    }

    #[test]
    fn column_major_strides() {
        let strides = strides_for(&[2, 3, 4], Layout::ColumnMajor);
        assert_eq!(strides, alloc::vec![1, 2, 6]);
    }

    #[test]
    fn nchw_strides() {
        let strides = strides_for(&[1, 3, 8, 8], Layout::Nchw);
        assert_eq!(strides, alloc::vec![192, 64, 8, 1]);
    }

    #[test]
    fn nhwc_strides() {
        let strides = strides_for(&[1, 8, 8, 3], Layout::Nhwc);
        assert_eq!(strides, alloc::vec![192, 24, 3, 1]);
    }

    #[test]
    fn nchw_falls_back_to_row_major_when_ndim_is_not_4() {
        let strides = strides_for(&[2, 3], Layout::Nchw);
        assert_eq!(strides, strides_for(&[2, 3], Layout::RowMajor));
    }

    #[test]
    fn alignment_table_matches_contract() {
        assert_eq!(DType::I8.alignment(), 16);
        assert_eq!(DType::I16.alignment(), 16);
        assert_eq!(DType::F16.alignment(), 16);
        assert_eq!(DType::I32.alignment(), 32);
        assert_eq!(DType::F32.alignment(), 32);
    }

    #[test]
    fn from_primitive_round_trips() {
        assert_eq!(DType::from_u8(2), Some(DType::I32));
        assert_eq!(DType::I32.to_u8(), Some(2));
    }

    #[test]
    fn align_up_rounds_to_requested_alignment() {
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(0, 32), 0);
    }

    #[test]
    fn large_alloc_data_pointer_is_never_less_aligned_than_requested() {
        // Mirrors `alloc_large`'s data-pointer derivation without needing a
        // live pool: whatever block start and alignment, the carved-out data
        // pointer must land on an `alignment`-multiple boundary.
        for block_ptr in [0x1000usize, 0x1020, 0x1040, 0x2000] {
            for alignment in [16usize, 32] {
                let data_ptr = align_up(block_ptr + HEADER_SIZE, alignment);
                assert_eq!(data_ptr % alignment, 0);
                assert!(data_ptr >= block_ptr + HEADER_SIZE);
            }
        }
    }
}
