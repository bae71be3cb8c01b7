//! x86 architecture support.

pub mod apic;
pub mod cpu;
pub mod cpuid;
pub mod descriptors;
pub mod msr;
