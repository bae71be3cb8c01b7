//! Current processor context.
//!
//! Most of the interrupt subsystem only needs a handful of privileged instructions (`CPUID`, `RDMSR`/`WRMSR`,
//! `CLI`/`STI`, control register and `IDTR` reads). They are grouped behind the [`Processor`] trait, which always
//! acts on the processor executing the call.

use crate::x86::cpuid::CPU_FEAT_APIC;
use crate::x86::msr::{Ia32ApicBase, IA32_APIC_BASE};

/// Snapshot of the control registers the application processors must load before enabling paging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlRegisters {
    /// `CR0`: operating mode.
    pub cr0: usize,

    /// `CR3`: page directory base.
    pub cr3: usize,

    /// `CR4`: architectural extensions.
    pub cr4: usize,
}

/// Content of the `IDTR` / `GDTR` registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTablePointer {
    /// Size of the table in bytes, minus one.
    pub limit: u16,

    /// Linear address of the table.
    pub base: usize,
}

impl DescriptorTablePointer {
    /// Size of the in-memory representation, as loaded by `LGDT` / `LIDT`.
    pub const SIZE: usize = 2 + core::mem::size_of::<usize>();

    /// Returns the in-memory representation (`limit` then `base`, little-endian).
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..2].copy_from_slice(&self.limit.to_le_bytes());
        bytes[2..].copy_from_slice(&self.base.to_le_bytes());
        bytes
    }
}

/// Privileged operations on the processor executing the call.
pub trait Processor: Sync {
    /// Checks a `CPUID` feature flag (see [`crate::x86::cpuid`]).
    fn cpu_feature_support(&self, feature: (u8, u32)) -> bool;

    /// Reads a Model-specific register.
    fn read_msr(&self, msr: u32) -> u64;

    /// Writes a Model-specific register.
    ///
    /// # Safety
    ///
    /// The value must be valid for this MSR, and the update must not break any invariant of the running kernel.
    unsafe fn write_msr(&self, msr: u32, value: u64);

    /// Clears the interrupt flag.
    fn disable_interrupts(&self);

    /// Sets the interrupt flag.
    fn enable_interrupts(&self);

    /// Returns the current control registers.
    fn control_registers(&self) -> ControlRegisters;

    /// Returns the current `IDTR`.
    fn idt_descriptor(&self) -> DescriptorTablePointer;

    /// Reads the `IA32_APIC_BASE` MSR, if the processor has an on-chip _APIC_.
    fn apic_base(&self) -> Option<Ia32ApicBase> {
        if !self.cpu_feature_support(CPU_FEAT_APIC) {
            return None;
        }

        Some(Ia32ApicBase::from(self.read_msr(IA32_APIC_BASE)))
    }
}

/// [`Processor`] implementation executing the actual instructions.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareProcessor;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl Processor for HardwareProcessor {
    fn cpu_feature_support(&self, feature: (u8, u32)) -> bool {
        crate::x86::cpuid::cpu_feature_support(feature).unwrap_or(false)
    }

    fn read_msr(&self, msr: u32) -> u64 {
        unsafe { crate::x86::msr::msr_read(msr) }
    }

    unsafe fn write_msr(&self, msr: u32, value: u64) {
        unsafe { crate::x86::msr::msr_write(msr, value) }
    }

    fn disable_interrupts(&self) {
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
    }

    fn enable_interrupts(&self) {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
    }

    fn control_registers(&self) -> ControlRegisters {
        let (cr0, cr3, cr4): (usize, usize, usize);

        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }

        ControlRegisters { cr0, cr3, cr4 }
    }

    fn idt_descriptor(&self) -> DescriptorTablePointer {
        let mut raw = [0u8; DescriptorTablePointer::SIZE];

        unsafe {
            core::arch::asm!("sidt [{}]", in(reg) raw.as_mut_ptr(), options(nostack, preserves_flags));
        }

        let mut base = [0u8; core::mem::size_of::<usize>()];
        base.copy_from_slice(&raw[2..]);

        DescriptorTablePointer {
            limit: u16::from_le_bytes([raw[0], raw[1]]),
            base: usize::from_le_bytes(base),
        }
    }
}
