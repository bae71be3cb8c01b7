//! MSR 'Model-specific registers' related utilities.
//!
//! The processor may provide various MSRs that are used to control and gather information from the
//! processor and several of its features. The MSRs are 64-bits wide registers.
//!
//! # Safety
//!
//! All MSR reading-related instructions can be used safely. Writing to a Model-specific register
//! is obviously a highly unsafe operation that supposes that a valid value was provided. Great
//! care should be taken when updating an MSR.

use modular_bitfield::bitfield;
use modular_bitfield::prelude::{B1, B24, B28, B8};

use crate::mem::PhyAddr32;

/// `IA32_APIC_BASE` MSR address.
pub const IA32_APIC_BASE: u32 = 0x1B;

/// `IA32_APIC_BASE` Model-specific register.
///
/// ```plaintext
/// 63           36 35                     12 11 10  9  8  7          0
/// |xxxxxxxxxxxxxx|   APIC base (frame)     |  |  |xx|  |xxxxxxxxxxxx|
///                                            |  |     |
///                                            |  |      - - - - - - - - BSP flag
///                                            |   - - - - - - - - - - - x2APIC enable
///                                             - - - - - - - - - - - - - xAPIC global enable
/// ```
#[bitfield]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub struct Ia32ApicBase {
    #[skip]
    __: B8,

    /// Set if the processor is the bootstrap processor.
    pub bootstrap_processor: bool,

    #[skip]
    __: B1,

    /// Enables _x2APIC_ mode.
    pub x2apic_enable: bool,

    /// Enables or disables the local _APIC_.
    pub xapic_global_enable: bool,

    /// Page frame number of the local _APIC_ register window.
    pub base_frame: B24,

    #[skip]
    __: B28,
}

impl Ia32ApicBase {
    /// Returns the physical address of the local _APIC_ register window.
    pub fn base_address(&self) -> PhyAddr32 {
        PhyAddr32::new(self.base_frame() << 12)
    }

    /// Sets the physical address of the local _APIC_ register window (must be page aligned).
    pub fn with_base_address(self, address: PhyAddr32) -> Self {
        self.with_base_frame(address.frame())
    }
}

/// Reads the content of an MSR.
///
/// # Safety
///
/// The MSR must exist on the current processor, otherwise a general protection fault is raised.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub unsafe fn msr_read(msr: u32) -> u64 {
    let edx: u32;
    let eax: u32;

    unsafe {
        core::arch::asm!("rdmsr", in("ecx") msr, out("edx") edx, out("eax") eax, options(nostack, nomem));
    }

    (u64::from(edx) << 32) | u64::from(eax)
}

/// Writes to a Model-specific register.
///
/// The `WRMSR` instructions used to update the register is serializing.
///
/// # Safety
///
/// Writing to a Model-specific register is obviously unsafe. This assumes that a valid value
/// for this MSR was provided, and that the update will not cause Undefined Behavior.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub unsafe fn msr_write(msr: u32, value: u64) {
    let [lo_val, hi_val] = [value as u32, (value >> 32) as u32];

    unsafe {
        core::arch::asm!("wrmsr", in("ecx") msr, in("edx") hi_val, in("eax") lo_val, options(nostack, nomem));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apic_base_layout() {
        let msr = Ia32ApicBase::from(0xFEE0_0900_u64);

        assert!(msr.bootstrap_processor());
        assert!(msr.xapic_global_enable());
        assert!(!msr.x2apic_enable());
        assert_eq!(msr.base_address(), PhyAddr32::new(0xFEE0_0000));
    }

    #[test]
    fn apic_base_encoding() {
        let msr = Ia32ApicBase::new()
            .with_xapic_global_enable(true)
            .with_x2apic_enable(true)
            .with_base_address(PhyAddr32::new(0xFEC0_1000));

        assert_eq!(u64::from(msr), 0xFEC0_1000 | (1 << 11) | (1 << 10));
    }
}
