//! `I/O APIC` (_I/O Advanced Programmable Interrupt Controller_) implementation.
//!
//! With the [`LocalApic`], they are an evolution of the old `PIC` chip. It manages the interrupt issued by I/O devices.
//! It also provides multiprocessor interrupt management through 24 programmable interrupts (_ISA_, _PCI_, ...)
//!
//! Every input of the `I/O APIC` is identified by a [`GlobalSystemInterrupt`]. Legacy interrupt requests are mapped
//! to the input with the same number, unless the `MADT` provides an _Interrupt Source Override_ for them.
//!
//! [`LocalApic`]: crate::x86::apic::LocalApic

#![allow(clippy::as_conversions)]

use alloc::vec::Vec;

use modular_bitfield::bitfield;
use modular_bitfield::prelude::{B24, B39};
use spin::Mutex;

use crate::fzboot::irq::vector::{GlobalSystemInterrupt, InterruptRequest, InterruptVector};
use crate::io::acpi::madt::{InterruptSourceOverride, IoApicEntry, NmiSource};
use crate::mem::{PhyAddr32, RegisterBlock};
use crate::x86::apic::local_apic::ProcLocalApicID;
use crate::x86::apic::{DeliveryMode, DeliveryStatus, DestinationMode, PinPolarity, TriggerMode};
use crate::{info, warn};

/// Offset of the `IOREGSEL` register in the `I/O APIC` window.
const IOREGSEL: usize = 0x00;

/// Offset of the `IOWIN` register in the `I/O APIC` window.
const IOWIN: usize = 0x10;

/// Index of the `IOAPICID` register.
const IOAPICID_OFFSET: u32 = 0;

/// Index of the `IOAPICVER` register.
const IOAPICVER_OFFSET: u32 = 1;

/// Index of the `IOREDTBL_BASE` register.
const IOREDTBL_BASE_OFFSET: u32 = 0x10;

/// Highest interrupt whose default vector (`GSI + 0x20`) stays below the software exceptions.
const LAST_ROUTABLE_GSI: GlobalSystemInterrupt = GlobalSystemInterrupt::new(0xA7);

/// Contains the `APIC ID`.
///
/// Each `APIC` devices on the `APIC` bus should have a unique identifier. This register must be configured with the
/// proper ID before using the `I/O APIC`.
#[bitfield]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u32)]
pub struct IOApicId {
    #[skip]
    __: B24,
    /// Identifier of the `I/O APIC` on the _APIC_ bus.
    pub io_apic_id: u8,
}

/// Used to identify the `APIC` hardware version.
///
/// Also indicates the maximum number of entries in the I/O redirection table.
#[bitfield]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u32)]
pub struct IOApicVersion {
    /// Implementation version.
    pub io_apic_version: u8,
    #[skip]
    __: u8,
    /// Number of redirection entries minus one.
    pub maximum_redirection_entry: u8,
    #[skip]
    __: u8,
}

/// Redirection table entry for the `I/O APIC`.
///
/// One entry per interrupt signal. Software determines the vector (and thus the priority) for every interrupt input
/// signal, as well as other properties.
/// The redirection table is used to translate the interrupt input signal into an inter-`APIC` message.
///
/// ```plaintext
/// 63        56 55                 17 16 15 14 13 12 11 10     8 7                0
/// |Destination|xxxxxxxxxxxxxxxxxxxxx|  |  |  |  |  |  |        |      Vector      |
///                                     |  |  |  |  |  |     |
///                                     |  |  |  |  |  |      - - - - Delivery Mode
///                                     |  |  |  |  |   - - - - - - - Destination Mode
///                                     |  |  |  |   - - - - - - - - - Delivery Status
///                                     |  |  |   - - - - - - - - - - - Pin Polarity
///                                     |  |   - - - - - - - - - - - - - Remote IRR
///                                     |   - - - - - - - - - - - - - - - Trigger Mode
///                                      - - - - - - - - - - - - - - - - - Mask
/// ```
#[bitfield]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u64)]
pub struct RedTblEntry {
    /// Vector delivered to the destination processor.
    pub vector: InterruptVector,
    /// Type of interrupt delivered.
    pub delivery_mode: DeliveryMode,
    /// Interpretation of the `destination` field.
    pub destination_mode: DestinationMode,
    /// Delivery status (read-only).
    #[skip(setters)]
    pub delivery_status: DeliveryStatus,
    /// Polarity of the input pin.
    pub pin_polarity: PinPolarity,
    /// Remote `IRR` flag (read-only).
    #[skip(setters)]
    pub remote_irr: bool,
    /// Trigger mode of the input pin.
    pub trigger_mode: TriggerMode,
    /// Masks the input.
    pub masked: bool,
    #[skip]
    __: B39,
    /// Target local _APIC_.
    pub destination: u8,
}

impl RedTblEntry {
    /// Splits the entry into its `(high, low)` doublewords.
    fn halves(self) -> (u32, u32) {
        let raw = u64::from(self);

        ((raw >> 32) as u32, raw as u32)
    }
}

/// `I/O APIC` (_I/O Advanced Programmable Interrupt Controller_) implementation main structure.
///
/// It manages the interrupt issued by I/O devices.
/// It also provides multiprocessor interrupt management through 24 programmable interrupts (_ISA_, _PCI_, ...)
///
/// Register accesses are serialized by `register_lock`, because selecting a register and accessing it are two
/// separate operations. Redirection entries are 64-bit wide and span two registers, so every entry access is also
/// serialized by `entry_lock`, always acquired before `register_lock`.
pub struct IoApic {
    id: u8,
    address: PhyAddr32,
    registers: &'static dyn RegisterBlock,
    gsi_base: GlobalSystemInterrupt,
    gsi_max: GlobalSystemInterrupt,
    overrides: Vec<InterruptSourceOverride>,
    nmi_sources: Vec<NmiSource>,
    register_lock: Mutex<()>,
    entry_lock: Mutex<()>,
}

impl IoApic {
    /// Creates a new `IoApic` from its `MADT` entry, and the register window mapped at its address.
    ///
    /// The redirection table is not touched before [`IoApic::initialize`] is called.
    pub fn new(
        entry: &IoApicEntry,
        registers: &'static dyn RegisterBlock,
        overrides: Vec<InterruptSourceOverride>,
        nmi_sources: Vec<NmiSource>,
    ) -> Self {
        Self {
            id: entry.id(),
            address: entry.address(),
            registers,
            gsi_base: entry.gsi_base(),
            gsi_max: entry.gsi_base(),
            overrides,
            nmi_sources,
            register_lock: Mutex::new(()),
            entry_lock: Mutex::new(()),
        }
    }

    /// Identifier of this `I/O APIC` on the _APIC_ bus.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Physical address of the register window.
    pub fn address(&self) -> PhyAddr32 {
        self.address
    }

    /// First interrupt handled by this `I/O APIC`.
    pub fn gsi_base(&self) -> GlobalSystemInterrupt {
        self.gsi_base
    }

    /// Last interrupt handled by this `I/O APIC`.
    pub fn gsi_max(&self) -> GlobalSystemInterrupt {
        self.gsi_max
    }

    /// Returns `true` if `gsi` is an input of this `I/O APIC`.
    pub fn handles(&self, gsi: GlobalSystemInterrupt) -> bool {
        (self.gsi_base..=self.gsi_max).contains(&gsi)
    }

    /// Programs the `I/O APIC` ID, and loads the default redirection table.
    ///
    /// Every input is masked, and routed to `bsp` with the vector `GSI + 0x20`, as edge-triggered active high. Inputs
    /// targeted by an override are delivered on the vector of the overridden interrupt request instead, with the
    /// electrical characteristics of the override. `NMI` inputs are programmed as unmasked `NMI` deliveries.
    pub fn initialize(&mut self, bsp: ProcLocalApicID) {
        self.write_register(
            IOAPICID_OFFSET,
            IOApicId::new().with_io_apic_id(self.id).into(),
        );

        let version = IOApicVersion::from(self.read_register(IOAPICVER_OFFSET));
        let mut gsi_max = GlobalSystemInterrupt::new(
            self.gsi_base.get() + u32::from(version.maximum_redirection_entry()),
        );

        if gsi_max.default_vector().is_none() {
            warn!(
                "ioapic",
                "{} inputs out of the external vector range, limiting to {}",
                gsi_max,
                LAST_ROUTABLE_GSI
            );
            gsi_max = LAST_ROUTABLE_GSI;
        }
        self.gsi_max = gsi_max;

        for raw_gsi in self.gsi_base.get()..=self.gsi_max.get() {
            let gsi = GlobalSystemInterrupt::new(raw_gsi);
            self.write_redirection_entry(gsi, self.default_entry(gsi, bsp));
        }

        for nmi in &self.nmi_sources {
            if !self.handles(nmi.gsi()) {
                continue;
            }

            let entry = RedTblEntry::new()
                .with_vector(InterruptVector::NONE)
                .with_delivery_mode(DeliveryMode::NonMaskableInterrupt)
                .with_destination_mode(DestinationMode::Physical)
                .with_pin_polarity(nmi.flags().polarity())
                .with_trigger_mode(nmi.flags().trigger_mode())
                .with_masked(false)
                .with_destination(bsp.into());

            self.write_redirection_entry(nmi.gsi(), entry);
        }

        info!(
            "ioapic",
            "I/O APIC [{}] at {} handles {} to {}",
            self.id,
            self.address,
            self.gsi_base,
            self.gsi_max
        );
    }

    fn default_entry(&self, gsi: GlobalSystemInterrupt, bsp: ProcLocalApicID) -> RedTblEntry {
        let entry = RedTblEntry::new()
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_destination_mode(DestinationMode::Physical)
            .with_masked(true)
            .with_destination(bsp.into());

        if let Some(over) = self.override_targeting(gsi) {
            let source = over.source().map_or(InterruptVector::NONE, |irq| irq.vector());

            return entry
                .with_vector(source)
                .with_pin_polarity(over.flags().polarity())
                .with_trigger_mode(over.flags().trigger_mode());
        }

        entry
            .with_vector(gsi.default_vector().unwrap_or(InterruptVector::NONE))
            .with_pin_polarity(PinPolarity::ActiveHigh)
            .with_trigger_mode(TriggerMode::Edge)
    }

    /// Unmasks an input.
    ///
    /// # Panics
    ///
    /// Panics if `gsi` is not handled by this `I/O APIC`, or is wired to `NMI`.
    pub fn allow(&self, gsi: GlobalSystemInterrupt) {
        self.check_maskable(gsi);

        let _entry = self.entry_lock.lock();
        let entry = self.read_entry_locked(gsi);
        self.write_entry_locked(gsi, entry.with_masked(false));
    }

    /// Masks an input.
    ///
    /// # Panics
    ///
    /// Panics if `gsi` is not handled by this `I/O APIC`, or is wired to `NMI`.
    pub fn forbid(&self, gsi: GlobalSystemInterrupt) {
        self.check_maskable(gsi);

        let _entry = self.entry_lock.lock();
        let entry = self.read_entry_locked(gsi);
        self.write_entry_locked(gsi, entry.with_masked(true));
    }

    /// Returns `true` if the input is unmasked. `NMI` inputs are always unmasked.
    ///
    /// # Panics
    ///
    /// Panics if `gsi` is not handled by this `I/O APIC`.
    pub fn status(&self, gsi: GlobalSystemInterrupt) -> bool {
        self.check_handled(gsi);

        !self.read_redirection_entry(gsi).masked()
    }

    fn check_handled(&self, gsi: GlobalSystemInterrupt) {
        assert!(
            self.handles(gsi),
            "{gsi} is not handled by I/O APIC {}",
            self.id
        );
    }

    fn check_maskable(&self, gsi: GlobalSystemInterrupt) {
        self.check_handled(gsi);
        assert!(
            !self.is_non_maskable_interrupt(gsi),
            "{gsi} is wired to NMI and cannot be masked"
        );
    }

    /// Returns the interrupt a legacy request is wired to: the override target, or the identity mapping.
    pub fn irq_override(&self, request: InterruptRequest) -> GlobalSystemInterrupt {
        self.override_for(request)
            .map_or_else(|| request.into(), |over| over.gsi())
    }

    /// Returns `true` if an override exists for `request`.
    pub fn has_override(&self, request: InterruptRequest) -> bool {
        self.override_for(request).is_some()
    }

    /// Returns the override whose source is `request`.
    pub fn override_for(&self, request: InterruptRequest) -> Option<&InterruptSourceOverride> {
        self.overrides
            .iter()
            .find(|over| over.source() == Some(request))
    }

    /// Returns `true` if an override targets `gsi`.
    pub fn is_override_target(&self, gsi: GlobalSystemInterrupt) -> bool {
        self.override_targeting(gsi).is_some()
    }

    /// Returns the override whose target is `gsi`.
    pub fn override_targeting(&self, gsi: GlobalSystemInterrupt) -> Option<&InterruptSourceOverride> {
        self.overrides.iter().find(|over| over.gsi() == gsi)
    }

    /// Returns the legacy request delivered through `gsi`: the override source, or the identity mapping.
    pub fn irq_source(&self, gsi: GlobalSystemInterrupt) -> Option<InterruptRequest> {
        if let Some(over) = self.override_targeting(gsi) {
            return over.source();
        }

        u8::try_from(gsi.get())
            .ok()
            .and_then(|line| InterruptRequest::try_from(line).ok())
    }

    /// Returns `true` if `gsi` is wired to `NMI`.
    pub fn is_non_maskable_interrupt(&self, gsi: GlobalSystemInterrupt) -> bool {
        self.nmi_sources.iter().any(|nmi| nmi.gsi() == gsi)
    }

    /// Reads the redirection entry of an input.
    pub fn read_redirection_entry(&self, gsi: GlobalSystemInterrupt) -> RedTblEntry {
        let _entry = self.entry_lock.lock();
        self.read_entry_locked(gsi)
    }

    /// Writes the redirection entry of an input.
    pub fn write_redirection_entry(&self, gsi: GlobalSystemInterrupt, entry: RedTblEntry) {
        let _entry = self.entry_lock.lock();
        self.write_entry_locked(gsi, entry);
    }

    fn redirection_index(&self, gsi: GlobalSystemInterrupt) -> u32 {
        IOREDTBL_BASE_OFFSET + 2 * (gsi.get() - self.gsi_base.get())
    }

    /// Must be called with `entry_lock` held.
    fn read_entry_locked(&self, gsi: GlobalSystemInterrupt) -> RedTblEntry {
        let index = self.redirection_index(gsi);
        let low = self.read_register(index);
        let high = self.read_register(index + 1);

        RedTblEntry::from((u64::from(high) << 32) | u64::from(low))
    }

    /// Must be called with `entry_lock` held.
    ///
    /// The destination (high doubleword) is written first, so that an unmasked entry never points to a stale
    /// destination.
    fn write_entry_locked(&self, gsi: GlobalSystemInterrupt, entry: RedTblEntry) {
        let index = self.redirection_index(gsi);
        let (high, low) = entry.halves();

        self.write_register(index + 1, high);
        self.write_register(index, low);
    }

    /// Reads the content of an `IoApic` register.
    ///
    /// Reads / writes using the memory mapped `IoApic` registers (`IOREGSEL` and `IOWIN`).
    fn read_register(&self, register: u32) -> u32 {
        let _register = self.register_lock.lock();

        self.registers.write(IOREGSEL, register);
        self.registers.read(IOWIN)
    }

    /// Writes the content of an `IoApic` register.
    ///
    /// Reads / writes using the memory mapped `IoApic` registers (`IOREGSEL` and `IOWIN`).
    fn write_register(&self, register: u32, value: u32) {
        let _register = self.register_lock.lock();

        self.registers.write(IOREGSEL, register);
        self.registers.write(IOWIN, value);
    }
}
