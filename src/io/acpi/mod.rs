//! `ACPI` structures consumed by the interrupt subsystem.

pub mod madt;
