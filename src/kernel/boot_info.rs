//! The 32-byte boot handoff record passed to the kernel entry point.
//!
//! Layout (little-endian, fixed offsets): `0..8 magic`, `8..16 arch`,
//! `16..24 ram_size`, `24..32 kernel_size`.

use crate::{error::KernelError, kernel::config::BOOT_INFO_MAGIC};

/// Size in bytes of the boot handoff record.
pub const SIZE: usize = 32;

/// Parsed boot handoff record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// Architecture tag, loader-defined.
    pub arch: u64,
    /// Total installed RAM, in bytes.
    pub ram_size: u64,
    /// Size of the loaded kernel image, in bytes.
    pub kernel_size: u64,
}

impl BootInfo {
    /// Reads and validates a boot handoff record from the given physical
    /// address.
    ///
    /// # Safety
    /// `address` must point to at least [`SIZE`] readable bytes.
    pub unsafe fn read(address: *const u8) -> Result<Self, KernelError> {
        if address.is_null() || !address.cast::<u64>().is_aligned() {
            return Err(KernelError::InvalidArg);
        }

        // SAFETY: delegated to the caller's contract; we only read `SIZE` bytes.
        let words = unsafe { core::slice::from_raw_parts(address.cast::<u64>(), SIZE / 8) };
        let magic = u64::from_le(words[0]);
        if magic != BOOT_INFO_MAGIC {
            return Err(KernelError::InvalidArg);
        }

        Ok(Self {
            arch: u64::from_le(words[1]),
            ram_size: u64::from_le(words[2]),
            kernel_size: u64::from_le(words[3]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(magic: u64, arch: u64, ram_size: u64, kernel_size: u64) -> [u8; SIZE] {
        let mut buffer = [0u8; SIZE];
        buffer[0..8].copy_from_slice(&magic.to_le_bytes());
        buffer[8..16].copy_from_slice(&arch.to_le_bytes());
        buffer[16..24].copy_from_slice(&ram_size.to_le_bytes());
        buffer[24..32].copy_from_slice(&kernel_size.to_le_bytes());
        buffer
    }

    #[test]
    fn accepts_well_formed_record() {
        let buffer = encode(BOOT_INFO_MAGIC, 1, 128 * 1024 * 1024, 4096);
        let info = unsafe { BootInfo::read(buffer.as_ptr()) }.unwrap();
        assert_eq!(info.arch, 1);
        assert_eq!(info.ram_size, 128 * 1024 * 1024);
        assert_eq!(info.kernel_size, 4096);
    }

    #[test]
    fn rejects_bad_magic() {
        let buffer = encode(0, 1, 128 * 1024 * 1024, 4096);
        assert_eq!(
            unsafe { BootInfo::read(buffer.as_ptr()) },
            Err(KernelError::InvalidArg)
        );
    }

    #[test]
    fn rejects_null() {
        assert_eq!(
            unsafe { BootInfo::read(core::ptr::null()) },
            Err(KernelError::InvalidArg)
        );
    }
}
