//! Four-level AArch64 page tables (PGD -> PUD -> PMD -> PT), 4 KiB granule,
//! 48-bit virtual address space. The kernel half lives above `KERNEL_BASE` and
//! is reached through `TTBR1_EL1`; the user half is reached through
//! `TTBR0_EL1`.

use crate::{error::KernelError, kernel::page, log, sync::SpinLock};
use aarch64_cpu::{
    asm::barrier,
    registers::{MAIR_EL1, SCTLR_EL1, TCR_EL1, TTBR0_EL1, TTBR1_EL1},
};
use core::arch::asm;
use tock_registers::{
    fields::FieldValue, interfaces::{ReadWriteable, Readable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};

/// Base of the kernel's half of the address space.
pub const KERNEL_BASE: usize = 0xFFFF_0000_0000_0000;

const PAGE_SIZE: usize = 4096;
const ENTRIES_PER_TABLE: usize = 512;
/// Bits of virtual address consumed per table level.
const LEVEL_BITS: usize = 9;

/// MAIR_EL1 attribute indices, fixed by the contract.
mod mair_index {
    pub const DEVICE_NGNRNE: u64 = 0;
    pub const DEVICE_NGNRE: u64 = 1;
    pub const DEVICE_GRE: u64 = 2;
    pub const NORMAL_NC: u64 = 3;
    pub const NORMAL_WT: u64 = 4;
    pub const NORMAL_WB: u64 = 5;
}

register_bitfields! {u64,
    /// A page-table entry: a table descriptor (levels 0-2) or a page
    /// descriptor (level 3), sharing a layout per the ARMv8-A VMSA.
    DESC [
        UXN OFFSET(54) NUMBITS(1) [],
        PXN OFFSET(53) NUMBITS(1) [],
        OUTPUT_ADDRESS OFFSET(12) NUMBITS(36) [],
        AF OFFSET(10) NUMBITS(1) [],
        SH OFFSET(8) NUMBITS(2) [
            NonShareable = 0b00,
            OuterShareable = 0b10,
            InnerShareable = 0b11,
        ],
        AP1 OFFSET(7) NUMBITS(1) [],
        AP0 OFFSET(6) NUMBITS(1) [],
        ATTR_INDX OFFSET(2) NUMBITS(3) [],
        /// `1` for a table/page descriptor, `0` for a block/invalid one.
        TYPE OFFSET(1) NUMBITS(1) [
            Block = 0,
            TableOrPage = 1,
        ],
        VALID OFFSET(0) NUMBITS(1) [],
    ]
}

/// Bitset of mapping attributes, named per the contract's flag-to-attribute
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags(u32);

impl MapFlags {
    /// No flags: read-only, kernel-only, non-executable, write-back cacheable.
    pub const NONE: Self = Self(0);
    /// The mapping may be written.
    pub const WRITE: Self = Self(1 << 0);
    /// The mapping may be executed.
    pub const EXEC: Self = Self(1 << 1);
    /// The mapping is accessible from EL0.
    pub const USER: Self = Self(1 << 2);
    /// Device-nGnRE memory rather than normal memory.
    pub const DEVICE: Self = Self(1 << 3);
    /// Normal, write-through cacheable (ignored if `DEVICE` is set).
    pub const CACHE_WT: Self = Self(1 << 4);
    /// Normal, non-cacheable (ignored if `DEVICE` is set).
    pub const CACHE_NC: Self = Self(1 << 5);

    const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for MapFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Derives the descriptor attribute bits for a leaf entry, per the
/// flag-to-attribute mapping table.
fn leaf_attributes(flags: MapFlags) -> FieldValue<u64, DESC::Register> {
    let attr_index = if flags.contains(MapFlags::DEVICE) {
        mair_index::DEVICE_NGNRE
    } else if flags.contains(MapFlags::CACHE_WT) {
        mair_index::NORMAL_WT
    } else if flags.contains(MapFlags::CACHE_NC) {
        mair_index::NORMAL_NC
    } else {
        mair_index::NORMAL_WB
    };

    let access = match (flags.contains(MapFlags::WRITE), flags.contains(MapFlags::USER)) {
        (true, false) => DESC::AP1::CLEAR + DESC::AP0::CLEAR,
        (true, true) => DESC::AP1::SET + DESC::AP0::CLEAR,
        (false, false) => DESC::AP1::CLEAR + DESC::AP0::SET,
        (false, true) => DESC::AP1::SET + DESC::AP0::SET,
    };

    let exec = if flags.contains(MapFlags::DEVICE) {
        DESC::UXN::SET + DESC::PXN::SET
    } else if !flags.contains(MapFlags::EXEC) {
        DESC::UXN::SET + DESC::PXN::SET
    } else if !flags.contains(MapFlags::USER) {
        DESC::UXN::SET
    } else {
        DESC::UXN::CLEAR
    };

    DESC::ATTR_INDX.val(attr_index)
        + access
        + exec
        + DESC::AF::SET
        + DESC::SH::InnerShareable
        + DESC::VALID::SET
        + DESC::TYPE::TableOrPage
}

/// One 512-entry, page-aligned table.
#[repr(C, align(4096))]
struct Table([InMemoryRegister<u64, DESC::Register>; ENTRIES_PER_TABLE]);

struct AddressSpace {
    /// Physical address of the top-level table (PGD).
    root: usize,
}

// SAFETY: access to the root pointer is always through `KERNEL_SPACE`'s lock.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    fn table_at(&self, physical: usize) -> &'static mut Table {
        // SAFETY: `physical` is always either `self.root` or the output
        // address of a valid, just-allocated `TableOrPage` entry, both of
        // which point to a zeroed, page-aligned `Table`.
        unsafe { &mut *(physical as *mut Table) }
    }

    fn index(virt: usize, level: usize) -> usize {
        let shift = 12 + LEVEL_BITS * (3 - level);
        (virt >> shift) & (ENTRIES_PER_TABLE - 1)
    }

    /// Walks to the level-3 (page) entry for `virt`, creating intermediate
    /// tables as needed.
    fn walk_create(&mut self, virt: usize) -> Result<&'static mut InMemoryRegister<u64, DESC::Register>, KernelError> {
        let mut table_phys = self.root;
        for level in 0..3 {
            let table = self.table_at(table_phys);
            let entry = &table.0[Self::index(virt, level)];
            if entry.matches_all(DESC::VALID::CLEAR) {
                let next = page::alloc(page::PageFlags::ZEROED | page::PageFlags::KERNEL)
                    .map_err(|_| KernelError::NoMemory)?;
                entry.write(
                    DESC::OUTPUT_ADDRESS.val((next >> 12) as u64)
                        + DESC::VALID::SET
                        + DESC::TYPE::TableOrPage,
                );
            } else if entry.matches_all(DESC::TYPE::Block) {
                return Err(KernelError::InvalidMapping);
            }
            table_phys = (entry.read(DESC::OUTPUT_ADDRESS) << 12) as usize;
        }
        let table = self.table_at(table_phys);
        Ok(&mut table.0[Self::index(virt, 3)])
    }

    /// Walks to the level-3 entry for `virt` without creating tables.
    fn walk(&self, virt: usize) -> Result<&'static InMemoryRegister<u64, DESC::Register>, KernelError> {
        let mut table_phys = self.root;
        for level in 0..3 {
            let table = self.table_at(table_phys);
            let entry = &table.0[Self::index(virt, level)];
            if entry.matches_all(DESC::VALID::CLEAR) || !entry.matches_all(DESC::TYPE::TableOrPage) {
                return Err(KernelError::NoMapping);
            }
            table_phys = (entry.read(DESC::OUTPUT_ADDRESS) << 12) as usize;
        }
        let table = self.table_at(table_phys);
        let entry = &table.0[Self::index(virt, 3)];
        if entry.matches_all(DESC::VALID::CLEAR) || !entry.matches_all(DESC::TYPE::TableOrPage) {
            return Err(KernelError::NoMapping);
        }
        Ok(entry)
    }
}

static KERNEL_SPACE: SpinLock<Option<AddressSpace>> = SpinLock::new(None);

fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

fn align_up(value: usize, align: usize) -> usize {
    align_down(value + align - 1, align)
}

/// Invalidates the TLB entry for a single virtual address (`TLBI VAAE1IS`)
/// and orders it against subsequent accesses.
fn invalidate(virt: usize) {
    let page_number = (virt >> 12) as u64;
    // SAFETY: `TLBI VAAE1IS` with a page number operand is architecturally
    // defined and affects only translations for that address.
    unsafe {
        asm!("tlbi vaae1is, {}", in(reg) page_number);
    }
    barrier::dsb(barrier::ISH);
    barrier::isb(barrier::SY);
}

/// Configures MAIR/TCR, allocates the kernel's top-level table, and points
/// `TTBR1_EL1` at it. Does not enable the MMU.
///
/// # Safety
/// Must be called exactly once, after `kernel::page::init`, before `enable`.
pub unsafe fn init(_ram_size: usize) -> Result<(), KernelError> {
    let mut guard = KERNEL_SPACE.lock();
    if guard.is_some() {
        return Err(KernelError::Busy);
    }

    MAIR_EL1.write(
        MAIR_EL1::Attr0_Device::nonGathering_nonReordering_EarlyWriteAck
            + MAIR_EL1::Attr1_Device::nonGathering_Reordering_EarlyWriteAck
            + MAIR_EL1::Attr2_Device::Gathering_Reordering_EarlyWriteAck
            + MAIR_EL1::Attr3_Normal_Inner::NonCacheable
            + MAIR_EL1::Attr3_Normal_Outer::NonCacheable
            + MAIR_EL1::Attr4_Normal_Inner::WriteThrough_Transient_ReadWriteAlloc
            + MAIR_EL1::Attr4_Normal_Outer::WriteThrough_Transient_ReadWriteAlloc
            + MAIR_EL1::Attr5_Normal_Inner::WriteBack_NonTransient_ReadWriteAlloc
            + MAIR_EL1::Attr5_Normal_Outer::WriteBack_NonTransient_ReadWriteAlloc,
    );

    TCR_EL1.write(
        TCR_EL1::TBI0::Used
            + TCR_EL1::IPS::Bits_40
            + TCR_EL1::TG0::KiB_4
            + TCR_EL1::SH0::Inner
            + TCR_EL1::ORGN0::WriteBack_ReadAlloc_WriteAlloc_Cacheable
            + TCR_EL1::IRGN0::WriteBack_ReadAlloc_WriteAlloc_Cacheable
            + TCR_EL1::T0SZ.val(16)
            + TCR_EL1::TG1::KiB_4
            + TCR_EL1::SH1::Inner
            + TCR_EL1::ORGN1::WriteBack_ReadAlloc_WriteAlloc_Cacheable
            + TCR_EL1::IRGN1::WriteBack_ReadAlloc_WriteAlloc_Cacheable
            + TCR_EL1::T1SZ.val(16),
    );

    let root = page::alloc(page::PageFlags::ZEROED | page::PageFlags::KERNEL)
        .map_err(|_| KernelError::NoMemory)?;
    TTBR1_EL1.set_baddr(root as u64);
    TTBR0_EL1.set_baddr(0);

    log!("MMU: configured, PGD at {:#x}", root);
    *guard = Some(AddressSpace { root });
    Ok(())
}

/// Enables the MMU, verifying that `SCTLR_EL1.M` actually took.
///
/// # Safety
/// Must be called after `init`, with identity mappings already in place for
/// the code currently executing.
pub unsafe fn enable() -> Result<(), KernelError> {
    SCTLR_EL1.modify(SCTLR_EL1::M::Enable + SCTLR_EL1::C::Cacheable + SCTLR_EL1::I::Cacheable);
    barrier::dsb(barrier::SY);
    barrier::isb(barrier::SY);
    if SCTLR_EL1.matches_all(SCTLR_EL1::M::Enable) {
        log!("MMU: enabled");
        Ok(())
    } else {
        Err(KernelError::Fault)
    }
}

/// Maps `size` bytes of `phys` at `virt`, one page at a time.
pub fn map(phys: usize, virt: usize, size: usize, flags: MapFlags) -> Result<(), KernelError> {
    if phys % PAGE_SIZE != 0 || virt % PAGE_SIZE != 0 || size == 0 {
        return Err(KernelError::InvalidArg);
    }
    let pages = align_up(size, PAGE_SIZE) / PAGE_SIZE;
    let mut guard = KERNEL_SPACE.lock();
    let space = guard.as_mut().ok_or(KernelError::NotReady)?;

    for index in 0..pages {
        let page_phys = phys + index * PAGE_SIZE;
        let page_virt = virt + index * PAGE_SIZE;
        let entry = space.walk_create(page_virt)?;
        entry.write(leaf_attributes(flags) + DESC::OUTPUT_ADDRESS.val((page_phys >> 12) as u64));
        invalidate(page_virt);
    }
    Ok(())
}

/// `map` with `virt == phys`.
pub fn identity_map(phys: usize, size: usize, flags: MapFlags) -> Result<(), KernelError> {
    map(phys, phys, size, flags)
}

/// Clears the mapping covering `size` bytes starting at `virt`, without
/// creating intermediate tables.
pub fn unmap(virt: usize, size: usize) -> Result<(), KernelError> {
    if virt % PAGE_SIZE != 0 || size == 0 {
        return Err(KernelError::InvalidArg);
    }
    let pages = align_up(size, PAGE_SIZE) / PAGE_SIZE;
    let mut guard = KERNEL_SPACE.lock();
    let space = guard.as_mut().ok_or(KernelError::NotReady)?;

    for index in 0..pages {
        let page_virt = virt + index * PAGE_SIZE;
        if let Ok(entry) = space.walk(page_virt) {
            entry.write(DESC::VALID::CLEAR);
            invalidate(page_virt);
        }
    }
    Ok(())
}

/// Resolves `virt` to its mapped physical address.
pub fn translate(virt: usize) -> Result<usize, KernelError> {
    let guard = KERNEL_SPACE.lock();
    let space = guard.as_ref().ok_or(KernelError::NotReady)?;
    let page_offset = virt % PAGE_SIZE;
    let entry = space.walk(align_down(virt, PAGE_SIZE))?;
    Ok(((entry.read(DESC::OUTPUT_ADDRESS) << 12) as usize) + page_offset)
}

/// Recovers the `MapFlags` a single mapped page was installed with.
pub fn get_flags(virt: usize) -> Result<MapFlags, KernelError> {
    let guard = KERNEL_SPACE.lock();
    let space = guard.as_ref().ok_or(KernelError::NotReady)?;
    let entry = space.walk(align_down(virt, PAGE_SIZE))?;

    let mut flags = MapFlags::NONE;
    if entry.read(DESC::AP1) == 1 {
        flags = flags | MapFlags::USER;
    }
    if entry.read(DESC::AP0) == 0 {
        flags = flags | MapFlags::WRITE;
    }
    if entry.read(DESC::UXN) == 0 {
        flags = flags | MapFlags::EXEC;
    }
    match entry.read(DESC::ATTR_INDX) {
        mair_index::DEVICE_NGNRE => flags = flags | MapFlags::DEVICE,
        mair_index::NORMAL_WT => flags = flags | MapFlags::CACHE_WT,
        mair_index::NORMAL_NC => flags = flags | MapFlags::CACHE_NC,
        _ => {}
    }
    Ok(flags)
}

/// Re-maps the single page at `virt` (to its existing physical frame) with
/// new attributes. Restricted to a single page; multi-page ranges return
/// `INVALID_ARG`.
pub fn set_flags(virt: usize, size: usize, flags: MapFlags) -> Result<(), KernelError> {
    if size != PAGE_SIZE {
        return Err(KernelError::InvalidArg);
    }
    let phys = translate(virt)?;
    unmap(virt, PAGE_SIZE)?;
    map(phys, virt, PAGE_SIZE, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_extracts_correct_bit_field() {
        let virt = 0b_111_222_333_444_usize << 12;
        // Not a meaningful address, just checks shift/mask arithmetic in
        // isolation by round-tripping a single level.
        let level0 = AddressSpace::index(virt, 0);
        assert!(level0 < ENTRIES_PER_TABLE);
    }

    #[test]
    fn leaf_attributes_mark_kernel_writable() {
        let value = leaf_attributes(MapFlags::WRITE);
        let reg: InMemoryRegister<u64, DESC::Register> = InMemoryRegister::new(0);
        reg.write(value);
        assert_eq!(reg.read(DESC::AP1), 0);
        assert_eq!(reg.read(DESC::AP0), 0);
    }

    #[test]
    fn leaf_attributes_mark_user_read_only() {
        let value = leaf_attributes(MapFlags::USER);
        let reg: InMemoryRegister<u64, DESC::Register> = InMemoryRegister::new(0);
        reg.write(value);
        assert_eq!(reg.read(DESC::AP1), 1);
        assert_eq!(reg.read(DESC::AP0), 1);
    }

    #[test]
    fn leaf_attributes_set_uxn_pxn_when_not_exec() {
        let value = leaf_attributes(MapFlags::NONE);
        let reg: InMemoryRegister<u64, DESC::Register> = InMemoryRegister::new(0);
        reg.write(value);
        assert_eq!(reg.read(DESC::UXN), 1);
        assert_eq!(reg.read(DESC::PXN), 1);
    }
}
