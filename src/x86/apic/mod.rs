//! `APIC` (_Advanced Programmable Interrupt Controller_) implementation.
//!
//! The _APIC_ is an evolution of the older _Intel 8259 PIC_ (programmable interrupt controller).
//! Most notably, it enables the usage of multiprocessor systems.
//!
//! It usually consists of two components:
//!
//! - _Local APIC_: one for each CPU on the system, manages external interrupts for a specific CPU, and are able to
//! accept and generate _IPI_ (interprocessor interrupts).
//!
//! - _I/O APIC_: one or more for each system, it contains a redirection table to route the interrupts received from
//! external buses (_ISA_, _PCI_) to one or more _Local APICs_
//!
//! [`Apic`] ties both together: it is built by the bootstrap processor from the `MADT`, switches the platform into
//! _xAPIC_ mode, and starts the application processors.

use modular_bitfield::BitfieldSpecifier;

pub mod controller;
pub mod error;
pub mod io_apic;
pub mod local_apic;
pub mod smp;
pub mod timer;

pub use controller::{Apic, ApicState};
pub use io_apic::IoApic;
pub use local_apic::{LocalApic, ProcLocalApicID, XApic};
pub use smp::{ApplicationProcessorStates, BringUpReport, StartupStub};
pub use timer::ApicTimer;

/// Used to specify the type of interrupt to be sent to the processor, for local vector table entries, redirection
/// table entries and _IPIs_.
#[repr(u8)]
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
#[bits = 3]
pub enum DeliveryMode {
    /// Delivers the interrupt specified in the `vector` field.
    Fixed = 0,

    /// Delivers the interrupt to the processor executing at the lowest priority.
    LowestPriority = 1,

    /// Delivers an `SMI` (_System Management Interrupt_) to the processor.
    ///
    /// The `vector` field should be clear for that delivery mode.
    SystemManagementInterrupt = 2,

    /// Delivers an `NMI` (_Non-Maskable Interrupt_) to the processor.
    NonMaskableInterrupt = 4,

    /// Delivers an `INIT` request to the processor.
    ///
    /// The `vector` field should be clear for that delivery mode.
    Init = 5,

    /// Sends a _start-up_ _IPI_. The `vector` field holds the page number of the start-up routine.
    StartUp = 6,

    /// The processor will respond to the interrupt as if it came from an externally connected controller.
    ExternalInterrupt = 7,
}

/// Indicates the interrupt source delivery status.
#[repr(u8)]
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// No current activity for this interrupt source.
    Idle = 0,

    /// The interrupt was delivered, but not yet accepted.
    SendPending = 1,
}

/// Polarity of an interrupt input pin.
#[repr(u8)]
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinPolarity {
    /// The pin is active when driven high.
    ActiveHigh = 0,

    /// The pin is active when driven low.
    ActiveLow = 1,
}

/// Trigger mode of an interrupt input pin.
#[repr(u8)]
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    /// The interrupt is signaled on a transition.
    Edge = 0,

    /// The interrupt is signaled while the pin is asserted.
    Level = 1,
}

/// Interpretation of a destination field.
#[repr(u8)]
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
pub enum DestinationMode {
    /// The destination is a local _APIC_ ID.
    Physical = 0,

    /// The destination is a set of processors, matched against the logical destination register.
    Logical = 1,
}
