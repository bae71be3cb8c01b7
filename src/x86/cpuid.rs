//! `CPUID` related utilities.
//!
//! The `CPUID` instruction, if available, provides valuable information about the processor and
//! its supported features.
//!
//! Only the basic `01h` leaf is used here, to check for the features the interrupt subsystem relies on.
//!
//! # Examples:
//!
//! ```ignore
//! use fzkernel::x86::cpuid;
//!
//! // Make sure that the system has an on-chip APIC.
//! assert!(cpuid::cpu_feature_support(cpuid::CPU_FEAT_APIC).unwrap_or(false));
//! ```

/// Defines a CPU feature retrieved from the 01h leaf in the `ecx` register.
macro_rules! cpu_feature_ecx {
    ($name: tt, $mask: expr, $desc: literal) => {
        #[doc = $desc]
        pub const $name: (u8, u32) = (0, $mask);
    };
}

/// Defines a CPU feature retrieved from the 01h leaf in the `edx` register.
macro_rules! cpu_feature_edx {
    ($name: tt, $mask: expr, $desc: literal) => {
        #[doc = $desc]
        pub const $name: (u8, u32) = (1, $mask);
    };
}

cpu_feature_ecx!(CPU_FEAT_X2APIC, 1 << 21, "CPU supports the x2APIC feature.");

cpu_feature_ecx!(
    CPU_FEAT_TSC_DEADLINE,
    1 << 24,
    "Local APIC timer supports one-shot operation using a TSC deadline value."
);

cpu_feature_edx!(
    CPU_FEAT_MSR,
    1 << 5,
    "Model Specific Registers RDMSR and WDMSR Instructions"
);

cpu_feature_edx!(CPU_FEAT_APIC, 1 << 9, "APIC On-Chip");

/// Checks a feature flag against the `ecx` and `edx` values of the 01h leaf.
pub fn feature_in_leaf(code: (u8, u32), ecx: u32, edx: u32) -> Option<bool> {
    match code.0 {
        0 => Some((ecx & code.1) != 0),
        1 => Some((edx & code.1) != 0),
        _ => None,
    }
}

/// Returns the initial local _APIC_ ID of the current processor, from bits 24-31 of `ebx` in the 01h leaf.
pub fn initial_apic_id(ebx: u32) -> u8 {
    ebx.to_le_bytes()[3]
}

/// Executes `CPUID` for the given leaf, and returns `[eax, ebx, ecx, edx]`.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn cpu_id(eax: u32) -> [u32; 4] {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::__cpuid;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::__cpuid;

    let result = unsafe { __cpuid(eax) };

    [result.eax, result.ebx, result.ecx, result.edx]
}

/// Checks if a CPU feature is supported by the current processor.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn cpu_feature_support(code: (u8, u32)) -> Option<bool> {
    let features = cpu_id(0x1);

    feature_in_leaf(code, features[2], features[3])
}
