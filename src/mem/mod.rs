//! Memory related utilities module.
//!
//! The interrupt controllers are programmed through memory-mapped register windows obtained from the kernel memory
//! service. This module defines the contract with that service ([`MemoryService`]) and the register window
//! abstraction ([`RegisterBlock`]) shared by the local and _I/O APIC_ drivers.

use core::fmt::{self, Display, Formatter};
use core::ptr;

use bytemuck::{Pod, Zeroable};

/// Size of a page frame.
pub const PAGE_SIZE: usize = 0x1000;

/// 32-bit physical address, as found in `ACPI` tables and the `IA32_APIC_BASE` MSR.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct PhyAddr32(u32);

impl PhyAddr32 {
    /// Creates a new `PhyAddr32`.
    pub const fn new(address: u32) -> Self {
        Self(address)
    }

    /// Returns the raw address.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the page frame number of this address.
    pub const fn frame(self) -> u32 {
        self.0 >> 12
    }

    /// Returns the address `offset` bytes further.
    pub const fn offset(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}

impl From<u32> for PhyAddr32 {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PhyAddr32> for u32 {
    fn from(value: PhyAddr32) -> Self {
        value.0
    }
}

impl Display for PhyAddr32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Window of 32-bit device registers.
///
/// Offsets are given in bytes from the start of the window.
pub trait RegisterBlock: Sync {
    /// Reads the register at `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Writes the register at `offset`.
    fn write(&self, offset: usize, value: u32);
}

/// Memory service provided by the kernel.
pub trait MemoryService: Sync {
    /// Maps `size` bytes of device memory starting at `address`, and returns the resulting register window.
    ///
    /// Mappings are never released.
    fn map_io(
        &self,
        address: PhyAddr32,
        size: usize,
        cacheable: bool,
    ) -> Option<&'static dyn RegisterBlock>;

    /// Copies `data` to physical memory at `address`.
    ///
    /// # Safety
    ///
    /// The target range must not hold anything still in use.
    unsafe fn write_physical(&self, address: PhyAddr32, data: &[u8]);
}

/// Register window backed by a virtual mapping of device memory.
///
/// Every access is volatile.
#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    base: usize,
}

impl MmioRegion {
    /// Creates a new `MmioRegion` starting at the virtual address `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a valid, uncached mapping of a device register window that stays mapped forever.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl RegisterBlock for MmioRegion {
    fn read(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}
