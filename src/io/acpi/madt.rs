//! `MADT` (_Multiple APIC Description Table_) entries.
//!
//! The table itself is located and validated by the kernel `ACPI` layer. This module only decodes the interrupt
//! controller structures that follow the table header, and exposes the subset used to build the [`Apic`].
//!
//! [`Apic`]: crate::x86::apic::Apic

use alloc::vec::Vec;

use bytemuck::{Pod, Zeroable};

use crate::fzboot::irq::vector::{GlobalSystemInterrupt, InterruptRequest};
use crate::mem::PhyAddr32;
use crate::x86::apic::{PinPolarity, TriggerMode};

/// Entry type of a _Processor Local APIC_ structure.
const MADT_PROCESSOR_LOCAL_APIC: u8 = 0;
/// Entry type of an _I/O APIC_ structure.
const MADT_IO_APIC: u8 = 1;
/// Entry type of an _Interrupt Source Override_ structure.
const MADT_INTERRUPT_SOURCE_OVERRIDE: u8 = 2;
/// Entry type of a _Non-Maskable Interrupt Source_ structure.
const MADT_NMI_SOURCE: u8 = 3;
/// Entry type of a _Local APIC NMI_ structure.
const MADT_LOCAL_APIC_NMI: u8 = 4;

/// Processor UID matching every processor in a [`LocalApicNmi`] entry.
pub const ALL_PROCESSORS: u8 = 0xFF;

/// Header common to every interrupt controller structure.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct EntryHeader {
    entry_type: u8,
    length: u8,
}

/// `MPS INTI` flags, describing the electrical characteristics of an interrupt input.
///
/// ```plaintext
/// 15                  4 3     2 1     0
/// |xxxxxxxxxxxxxxxxxxxx|Trigger|Polarity|
/// ```
///
/// `00` means "conforms to the bus specification" (edge, active high for _ISA_), `01` edge / active high, `11`
/// level / active low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct MpsIntiFlags(u16);

impl MpsIntiFlags {
    const POLARITY_MASK: u16 = 0x3;
    const ACTIVE_LOW: u16 = 0x2;
    const TRIGGER_MASK: u16 = 0xC;
    const LEVEL_TRIGGERED: u16 = 0x8;

    /// Creates a new `MpsIntiFlags`.
    pub const fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Returns the pin polarity, defaulting to active high.
    pub fn polarity(self) -> PinPolarity {
        if self.0 & Self::POLARITY_MASK != 0 && self.0 & Self::ACTIVE_LOW != 0 {
            PinPolarity::ActiveLow
        } else {
            PinPolarity::ActiveHigh
        }
    }

    /// Returns the trigger mode, defaulting to edge.
    pub fn trigger_mode(self) -> TriggerMode {
        if self.0 & Self::TRIGGER_MASK != 0 && self.0 & Self::LEVEL_TRIGGERED != 0 {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        }
    }
}

/// _Processor Local APIC_ structure (type 0).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ProcessorLocalApic {
    acpi_processor_id: u8,
    apic_id: u8,
    flags: [u8; 4],
}

impl ProcessorLocalApic {
    const ENABLED: u32 = 1 << 0;

    /// Creates a new entry.
    pub fn new(acpi_processor_id: u8, apic_id: u8, enabled: bool) -> Self {
        let flags = if enabled { Self::ENABLED } else { 0 };

        Self {
            acpi_processor_id,
            apic_id,
            flags: flags.to_le_bytes(),
        }
    }

    /// `ACPI` processor UID.
    pub fn acpi_processor_id(&self) -> u8 {
        self.acpi_processor_id
    }

    /// Local _APIC_ ID of the processor.
    pub fn apic_id(&self) -> u8 {
        self.apic_id
    }

    /// Returns `true` if the processor is ready for use.
    pub fn is_enabled(&self) -> bool {
        u32::from_le_bytes(self.flags) & Self::ENABLED != 0
    }
}

/// _I/O APIC_ structure (type 1).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct IoApicEntry {
    io_apic_id: u8,
    reserved: u8,
    address: [u8; 4],
    gsi_base: [u8; 4],
}

impl IoApicEntry {
    /// Creates a new entry.
    pub fn new(io_apic_id: u8, address: PhyAddr32, gsi_base: GlobalSystemInterrupt) -> Self {
        Self {
            io_apic_id,
            reserved: 0,
            address: address.as_u32().to_le_bytes(),
            gsi_base: gsi_base.get().to_le_bytes(),
        }
    }

    /// _I/O APIC_ ID.
    pub fn id(&self) -> u8 {
        self.io_apic_id
    }

    /// Physical address of the register window.
    pub fn address(&self) -> PhyAddr32 {
        PhyAddr32::new(u32::from_le_bytes(self.address))
    }

    /// First interrupt handled by this _I/O APIC_.
    pub fn gsi_base(&self) -> GlobalSystemInterrupt {
        GlobalSystemInterrupt::new(u32::from_le_bytes(self.gsi_base))
    }
}

/// _Interrupt Source Override_ structure (type 2).
///
/// Describes an _ISA_ interrupt wired to a different _I/O APIC_ input than its identity mapping.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct InterruptSourceOverride {
    bus: u8,
    source: u8,
    gsi: [u8; 4],
    flags: [u8; 2],
}

impl InterruptSourceOverride {
    /// Creates a new _ISA_ override.
    pub fn new(source: InterruptRequest, gsi: GlobalSystemInterrupt, flags: MpsIntiFlags) -> Self {
        Self {
            bus: 0,
            source: source.line(),
            gsi: gsi.get().to_le_bytes(),
            flags: flags.0.to_le_bytes(),
        }
    }

    /// Bus-relative source, `None` if it is not a legacy interrupt line.
    pub fn source(&self) -> Option<InterruptRequest> {
        InterruptRequest::try_from(self.source).ok()
    }

    /// Interrupt the source is wired to.
    pub fn gsi(&self) -> GlobalSystemInterrupt {
        GlobalSystemInterrupt::new(u32::from_le_bytes(self.gsi))
    }

    /// Electrical characteristics of the input.
    pub fn flags(&self) -> MpsIntiFlags {
        MpsIntiFlags(u16::from_le_bytes(self.flags))
    }
}

/// _Non-Maskable Interrupt Source_ structure (type 3).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct NmiSource {
    flags: [u8; 2],
    gsi: [u8; 4],
}

impl NmiSource {
    /// Creates a new entry.
    pub fn new(gsi: GlobalSystemInterrupt, flags: MpsIntiFlags) -> Self {
        Self {
            flags: flags.0.to_le_bytes(),
            gsi: gsi.get().to_le_bytes(),
        }
    }

    /// Interrupt that should be programmed as `NMI`.
    pub fn gsi(&self) -> GlobalSystemInterrupt {
        GlobalSystemInterrupt::new(u32::from_le_bytes(self.gsi))
    }

    /// Electrical characteristics of the input.
    pub fn flags(&self) -> MpsIntiFlags {
        MpsIntiFlags(u16::from_le_bytes(self.flags))
    }
}

/// _Local APIC NMI_ structure (type 4).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct LocalApicNmi {
    acpi_processor_id: u8,
    flags: [u8; 2],
    lint: u8,
}

impl LocalApicNmi {
    /// Creates a new entry.
    pub fn new(acpi_processor_id: u8, lint: u8, flags: MpsIntiFlags) -> Self {
        Self {
            acpi_processor_id,
            flags: flags.0.to_le_bytes(),
            lint,
        }
    }

    /// `ACPI` processor UID, or [`ALL_PROCESSORS`].
    pub fn acpi_processor_id(&self) -> u8 {
        self.acpi_processor_id
    }

    /// Returns `true` if the entry applies to the processor `uid`.
    pub fn applies_to(&self, uid: u8) -> bool {
        self.acpi_processor_id == ALL_PROCESSORS || self.acpi_processor_id == uid
    }

    /// Local interrupt pin (`LINT0` or `LINT1`) the `NMI` is connected to.
    pub fn lint(&self) -> u8 {
        self.lint
    }

    /// Electrical characteristics of the input.
    pub fn flags(&self) -> MpsIntiFlags {
        MpsIntiFlags(u16::from_le_bytes(self.flags))
    }
}

/// Interrupt controller description extracted from the `MADT`.
#[derive(Debug, Clone, Default)]
pub struct MadtInfo {
    /// Physical address of the local _APIC_ register window.
    pub local_apic_address: PhyAddr32,

    /// Processor local _APIC_ structures.
    pub processors: Vec<ProcessorLocalApic>,

    /// _I/O APIC_ structures.
    pub io_apics: Vec<IoApicEntry>,

    /// _ISA_ interrupt source overrides.
    pub overrides: Vec<InterruptSourceOverride>,

    /// _I/O APIC_ inputs wired to `NMI`.
    pub nmi_sources: Vec<NmiSource>,

    /// Local interrupt pins wired to `NMI`.
    pub local_nmis: Vec<LocalApicNmi>,
}

impl MadtInfo {
    /// Decodes the interrupt controller structures following the `MADT` header.
    ///
    /// Unknown structures are skipped. Decoding stops at the first malformed structure.
    pub fn parse_entries(local_apic_address: PhyAddr32, entries: &[u8]) -> Self {
        let mut info = Self {
            local_apic_address,
            ..Self::default()
        };
        let mut pos = 0;

        while let Some(raw_header) = entries.get(pos..pos + 2) {
            let header: EntryHeader = bytemuck::pod_read_unaligned(raw_header);
            let length = usize::from(header.length);

            let Some(body) = entries.get(pos + 2..pos + length.max(2)) else {
                break;
            };
            if length < 2 {
                break;
            }

            match header.entry_type {
                MADT_PROCESSOR_LOCAL_APIC => push_entry(&mut info.processors, body),
                MADT_IO_APIC => push_entry(&mut info.io_apics, body),
                MADT_INTERRUPT_SOURCE_OVERRIDE => push_entry(&mut info.overrides, body),
                MADT_NMI_SOURCE => push_entry(&mut info.nmi_sources, body),
                MADT_LOCAL_APIC_NMI => push_entry(&mut info.local_nmis, body),
                _ => {}
            }

            pos += length;
        }

        info
    }
}

fn push_entry<T: Pod>(entries: &mut Vec<T>, body: &[u8]) {
    if let Some(raw) = body.get(..core::mem::size_of::<T>()) {
        entries.push(bytemuck::pod_read_unaligned(raw));
    }
}
