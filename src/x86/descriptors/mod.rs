//! x86 descriptor tables.

pub mod gdt;
