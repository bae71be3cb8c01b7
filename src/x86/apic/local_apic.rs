//! `Local APIC` (_Local Advanced Programmable Interrupt Controller_) implementation.
//!
//! The _Local APIC_ manages external interrupts for a specific CPU, and are able to accept and generate
//! _IPIs_ (Interprocessor interrupts).
//!
//! There is one _Local APIC_ per CPU, each is assigned a ID unique for a given system.
//!
//! In _xAPIC_ mode, every processor sees its own _Local APIC_ at the same physical address. Register accesses are
//! therefore done through a single, system-wide [`XApic`] window, and always reach the _Local APIC_ of the
//! processor executing the access. [`LocalApic`] instances only hold the per-processor configuration (`NMI` pins).

#![allow(clippy::as_conversions)]

use alloc::vec::Vec;
use core::fmt::{self, Display, Formatter};

use bytemuck::{Pod, Zeroable};
use modular_bitfield::prelude::{B1, B13, B19, B2, B24, B36, B7};
use modular_bitfield::{bitfield, BitfieldSpecifier};
use spin::Mutex;

use crate::fzboot::irq::vector::InterruptVector;
use crate::mem::{PhyAddr32, RegisterBlock};
use crate::x86::apic::{DeliveryMode, DeliveryStatus, DestinationMode, PinPolarity, TriggerMode};
use crate::x86::cpu::Processor;
use crate::x86::cpuid::{CPU_FEAT_APIC, CPU_FEAT_X2APIC};
use crate::x86::msr::{Ia32ApicBase, IA32_APIC_BASE};

/// Local APIC unique identifier.
///
/// At power up, every `LocalAPIC` on the system is assigned a unique identifier, based on the system topology.
/// This unique identifier is the _local APIC ID_, and is also used as a processor identifier for multi-processor
/// systems.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct ProcLocalApicID(u8);

impl ProcLocalApicID {
    /// This identifier is reserved, and used to indicate every `LocalAPIC` on the system.
    pub const ALL_LAPIC: Self = Self(0xFF);

    /// Returns the identifier as an index in per-processor tables.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl From<ProcLocalApicID> for u8 {
    fn from(value: ProcLocalApicID) -> Self {
        value.0
    }
}

impl From<u8> for ProcLocalApicID {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl Display for ProcLocalApicID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Offset of specific registers in the `LocalAPIC` address space.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LocalAPICRegisterOffset(usize);

impl LocalAPICRegisterOffset {
    /// Local _APIC_ ID.
    pub const ID_REGISTER: Self = Self(0x20);

    /// Version and number of _LVT_ entries.
    pub const VERSION_REGISTER: Self = Self(0x30);

    /// _Task Priority Register_.
    pub const TASK_PRIORITY: Self = Self(0x80);

    /// _End Of Interrupt_ register.
    pub const EOI_REGISTER: Self = Self(0xB0);

    /// _Spurious Vector Register_.
    pub const SVR: Self = Self(0xF0);

    /// First dword of the _In-Service Register_.
    pub const ISR_BASE: Self = Self(0x100);

    /// _Error Status Register_.
    pub const ERROR_REGISTER: Self = Self(0x280);

    /// _LVT_ corrected machine-check interrupt entry.
    pub const CMCI_REGISTER: Self = Self(0x2F0);

    /// Low dword of the _Interrupt Command Register_. Writing it sends the _IPI_.
    pub const ICR_LOW: Self = Self(0x300);

    /// High dword of the _Interrupt Command Register_ (destination).
    pub const ICR_HIGH: Self = Self(0x310);

    /// _LVT_ timer entry.
    pub const TIMER_REGISTER: Self = Self(0x320);

    /// _LVT_ thermal sensor entry.
    pub const THERMAL_MON_REGISTER: Self = Self(0x330);

    /// _LVT_ performance counter entry.
    pub const PERF_COUNT_REGISTER: Self = Self(0x340);

    /// _LVT_ `LINT0` entry.
    pub const LINT0_REGISTER: Self = Self(0x350);

    /// _LVT_ `LINT1` entry.
    pub const LINT1_REGISTER: Self = Self(0x360);

    /// _LVT_ error entry.
    pub const LVT_ERR_REGISTER: Self = Self(0x370);

    /// Timer initial count.
    pub const TIMER_INITIAL_COUNT: Self = Self(0x380);

    /// Timer current count.
    pub const TIMER_CURRENT_COUNT: Self = Self(0x390);

    /// Timer divide configuration.
    pub const TIMER_DIVIDE: Self = Self(0x3E0);

    /// Returns the byte offset of the register.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// `LocalAPIC` version register structure.
///
/// Contains information about the `APIC` version, and the maximum _LVT_ entry available.
#[bitfield]
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LocalAPICVersionRegister {
    /// Version of the local _APIC_ (`0x1X` for integrated _APICs_).
    pub version: u8,
    #[skip]
    __: u8,
    /// Number of _LVT_ entries minus one.
    pub max_lvt_entry: u8,
    /// Set if `EOI` broadcast suppression is supported.
    pub eoi_broadcast_suppr: bool,
    #[skip]
    __: B7,
}

/// `SVR` (_Spurious Vector Register_) structure.
///
/// Indicates the vector number to be delivered to the processor when the `LocalAPIC` generates a spurious vector.
/// Also contains a bit to software enable/disable the `LocalAPIC`.
///
/// ```plaintext
/// 31                 13 12 11 10  9  8 7                0
/// |xxxxxxxxxxxxxxxxxxxx|  |xx xx|  |  |      Vector      |
///                       |        |  |
///                       |        |   - - - - - - - - - - APIC software enable
///                       |         - - - - - - - - - - - - Focus processor checking
///                        - - - - - - - - - - - - - - - - - EOI broadcast suppression
/// ```
#[bitfield]
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LocalAPICSpuriousVectorRegister {
    /// Vector delivered for spurious interrupts.
    pub vector: InterruptVector,
    /// Software enable flag.
    pub soft_enable: bool,
    /// Focus processor checking.
    pub focus_proc_checking: bool,
    #[skip]
    __: B2,
    /// Suppresses `EOI` broadcasts to the _I/O APICs_ for level-triggered interrupts.
    pub eoi_broadcast_suppr: bool,
    #[skip]
    __: B19,
}

/// Timer mode of the _LVT_ timer entry.
#[repr(u8)]
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
#[bits = 2]
pub enum LVTTimerMode {
    /// Counts down once from the initial count.
    OneShot = 0,

    /// Reloads the initial count every time zero is reached.
    Periodic = 1,

    /// Fires when the `TSC` reaches the `IA32_TSC_DEADLINE` MSR value.
    TscDeadline = 2,
}

/// `LocalVectorTableEntry` structure represents an entry in the _Local Vector Table_.
///
/// The same layout is used for every local interrupt source, some fields being reserved for some of them
/// (`timer_mode` is only used by the timer entry, `pin_polarity`, `remote_irr` and `trigger_mode` only by the
/// `LINTn` entries).
///
/// ```plaintext
/// 31                    19 18 17 16 15 14 13 12 11 10     8 7                0
/// |xxxxxxxxxxxxxxxxxxxxxxx|     |  |  |  |  |  |xx|        |      Vector      |
///                          |     |  |  |  |  |     |
///                          |     |  |  |  |  |      - - - - - - - - Delivery Mode
///                          |     |  |  |  |   - - - - - - - - - - - Delivery Status
///                          |     |  |  |   - - - - - - - - - - - - - Pin Polarity
///                          |     |  |   - - - - - - - - - - - - - - - Remote IRR
///                          |     |   - - - - - - - - - - - - - - - - - Trigger Mode
///                          |      - - - - - - - - - - - - - - - - - - - Mask
///                           - - - - - - - - - - - - - - - - - - - - - - - Timer Mode
/// ```
#[bitfield]
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LocalVectorTableEntry {
    /// Vector delivered for this source.
    pub vector: InterruptVector,
    /// Type of interrupt delivered.
    pub delivery_mode: DeliveryMode,
    #[skip]
    __: B1,
    /// Delivery status (read-only).
    #[skip(setters)]
    pub delivery_status: DeliveryStatus,
    /// Polarity of the `LINTn` pin.
    pub pin_polarity: PinPolarity,
    /// Remote `IRR` flag (read-only).
    #[skip(setters)]
    pub remote_irr: bool,
    /// Trigger mode of the `LINTn` pin.
    pub trigger_mode: TriggerMode,
    /// Masks the interrupt source.
    pub masked: bool,
    /// Timer operating mode.
    pub timer_mode: LVTTimerMode,
    #[skip]
    __: B13,
}

/// `LocalAPIC` error register.
///
/// It indicates any error detected during interrupt handling. Must be written to to update its content, before
/// attempting to read its value.
#[bitfield]
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LocalAPICErrorRegister {
    /// Checksum error for a message sent on the _APIC_ bus.
    pub send_chksum_error: bool,

    /// Checksum error for a message received on the _APIC_ bus.
    pub receive_chksum_error: bool,

    /// No `APIC` accepted the message on the _APIC_ bus.
    pub send_accept_error: bool,

    /// The message received was not accept by any `APIC` on the _APIC_ bus, including itself.
    pub receive_accept_error: bool,

    /// The `APIC` detected an attempt to send an _IPI_ with the lowest-priority delivery mode, that is not
    /// supported.
    pub redirectable_ipi: bool,

    /// The `APIC` detected an illegal vector in the message that it is sending (after an _ICR_ write).
    pub send_illegal_vector: bool,

    /// The `APIC` detected an illegal vector in an interrupt it received, or locally generated.
    pub received_illegal_vector: bool,

    /// Software attempted to access a register reserved in the `APIC` address space.
    pub illegal_register_address: bool,
    #[skip]
    __: B24,
}

impl LocalAPICErrorRegister {
    /// Returns `true` if no error bit is set.
    pub fn is_clear(&self) -> bool {
        u32::from(*self) == 0
    }
}

/// Used to select between _INIT level de-assert_ or standard _INIT_ when creating such type of `IPI` message
#[repr(u8)]
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
pub enum IPILevel {
    /// `Level` field must be set to _De-assert_ to perform a _INIT level de-assert_.
    DeAssert = 0,

    /// For most type of deliveries, the corresponding field must be set to `Assert`
    Assert = 1,
}

/// Used to send the `IPI` to special destination, overrides the `destination` field is set.
/// Necessary when issuing self-interrupts or to broadcast interrupts.
#[repr(u8)]
#[derive(BitfieldSpecifier, Copy, Clone, Debug, PartialEq, Eq)]
pub enum IPIDestinationShorthand {
    /// Indicates that the destination is contained in the `destination` field.
    NoShorthand = 0,

    /// Issues a self interrupt.
    SelfInt = 1,

    /// Broadcasts an interrupt, the `IPI` is sent to all processors in the system, _including_ the issuer.
    All = 2,

    /// Broadcasts an interrupt, the `IPI` is sent to all processors in the system, _excluding_ the issuer.
    AllButSelf = 3,
}

/// The APIC `ICR` (_Interrupt Command Register_) enables the sending of `IPIs` (_Interprocessor Interrupts).
///
/// It is a 64-bit register, that allows software to specify _IPIs_ to other processors on the system.
/// Writing to the low doubleword of the `ICR` causes the _IPI_ to be sent.
///
/// ```plaintext
/// 63        56 55                  20 19 18 17 16 15 14 13 12 11 10     8 7                0
/// |Destination|xxxxxxxxxxxxxxxxxxxxxxx|     |xx xx|  |  |xx|  |  |        |      Vector      |
///                                      |           |  |     |  |     |
///                                      |           |  |     |  |      - - - - Delivery Mode
///                                      |           |  |     |   - - - - - - - Destination Mode
///                                      |           |  |      - - - - - - - - - Delivery Status
///                                      |           |   - - - - - - - - - - - - - Level
///                                      |            - - - - - - - - - - - - - - - Trigger Mode
///                                       - - - - - - - - - - - - - - - - - - - - - - Destination Shorthand
/// ```
#[bitfield]
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InterruptCommandRegisterEntry {
    /// Vector of the interrupt, or start-up page for a `SIPI`.
    pub vector: InterruptVector,
    /// Type of `IPI` to be sent.
    pub delivery_mode: DeliveryMode,
    /// Used to select either _Physical_ or _Logical_ addressing mode.
    pub destination_mode: DestinationMode,
    /// Delivery status (read-only).
    #[skip(setters)]
    pub delivery_status: DeliveryStatus,
    #[skip]
    __: B1,
    /// Used to select between _INIT level de-assert_ or standard _INIT_.
    pub level: IPILevel,
    /// Trigger mode, only meaningful for _INIT level de-assert_.
    pub trigger_mode: TriggerMode,
    #[skip]
    __: B2,
    /// Special destination, overrides the `destination` field if set.
    pub destination_shorthand: IPIDestinationShorthand,
    #[skip]
    __: B36,
    /// Target processor.
    pub destination: u8,
}

impl InterruptCommandRegisterEntry {
    /// `INIT` request, asserted or de-asserted, sent to a single processor.
    ///
    /// `INIT` is level-triggered: it must be asserted, then explicitly de-asserted.
    pub fn init(destination: ProcLocalApicID, level: IPILevel) -> Self {
        Self::new()
            .with_vector(InterruptVector::NONE)
            .with_delivery_mode(DeliveryMode::Init)
            .with_destination_mode(DestinationMode::Physical)
            .with_level(level)
            .with_trigger_mode(TriggerMode::Level)
            .with_destination_shorthand(IPIDestinationShorthand::NoShorthand)
            .with_destination(destination.into())
    }

    /// _Start-up_ `IPI`, sent to a single processor.
    ///
    /// The processor starts executing in real mode at `startup_address`, which must be page aligned and below 1 MiB.
    pub fn startup(destination: ProcLocalApicID, startup_address: PhyAddr32) -> Self {
        Self::new()
            .with_vector(InterruptVector::from((startup_address.frame() & 0xFF) as u8))
            .with_delivery_mode(DeliveryMode::StartUp)
            .with_destination_mode(DestinationMode::Physical)
            .with_level(IPILevel::Assert)
            .with_trigger_mode(TriggerMode::Edge)
            .with_destination_shorthand(IPIDestinationShorthand::NoShorthand)
            .with_destination(destination.into())
    }

    /// _INIT level de-assert_ broadcast to every processor, including the issuer.
    ///
    /// Used to synchronize the arbitration IDs of every local _APIC_ on the bus.
    pub fn synchronize_arbitration() -> Self {
        Self::new()
            .with_vector(InterruptVector::NONE)
            .with_delivery_mode(DeliveryMode::Init)
            .with_destination_mode(DestinationMode::Physical)
            .with_level(IPILevel::DeAssert)
            .with_trigger_mode(TriggerMode::Level)
            .with_destination_shorthand(IPIDestinationShorthand::All)
            .with_destination(0)
    }

    /// Fixed interrupt sent to a single processor.
    pub fn fixed(destination: ProcLocalApicID, vector: InterruptVector) -> Self {
        Self::new()
            .with_vector(vector)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_destination_mode(DestinationMode::Physical)
            .with_level(IPILevel::Assert)
            .with_trigger_mode(TriggerMode::Edge)
            .with_destination_shorthand(IPIDestinationShorthand::NoShorthand)
            .with_destination(destination.into())
    }

    /// Splits the entry into its `(high, low)` doublewords.
    pub fn halves(self) -> (u32, u32) {
        let raw = u64::from(self);

        ((raw >> 32) as u32, raw as u32)
    }
}

/// Interrupt sources of the _Local Vector Table_.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocalInterrupt {
    /// Corrected machine-check error interrupt.
    Cmci,
    /// Local timer.
    Timer,
    /// Thermal sensor.
    Thermal,
    /// Performance monitoring counters.
    Performance,
    /// Local interrupt pin 0.
    Lint0,
    /// Local interrupt pin 1.
    Lint1,
    /// Internal error.
    Error,
}

impl LocalInterrupt {
    /// Every local interrupt source, in register order.
    pub const ALL: [Self; 7] = [
        Self::Cmci,
        Self::Timer,
        Self::Thermal,
        Self::Performance,
        Self::Lint0,
        Self::Lint1,
        Self::Error,
    ];

    /// Returns the _LVT_ register of the source.
    pub fn register(self) -> LocalAPICRegisterOffset {
        match self {
            Self::Cmci => LocalAPICRegisterOffset::CMCI_REGISTER,
            Self::Timer => LocalAPICRegisterOffset::TIMER_REGISTER,
            Self::Thermal => LocalAPICRegisterOffset::THERMAL_MON_REGISTER,
            Self::Performance => LocalAPICRegisterOffset::PERF_COUNT_REGISTER,
            Self::Lint0 => LocalAPICRegisterOffset::LINT0_REGISTER,
            Self::Lint1 => LocalAPICRegisterOffset::LINT1_REGISTER,
            Self::Error => LocalAPICRegisterOffset::LVT_ERR_REGISTER,
        }
    }

    /// Returns the vector the source is delivered on.
    pub fn vector(self) -> InterruptVector {
        match self {
            Self::Cmci => InterruptVector::CMCI,
            Self::Timer => InterruptVector::TIMER,
            Self::Thermal => InterruptVector::THERMAL,
            Self::Performance => InterruptVector::PERFORMANCE,
            Self::Lint0 => InterruptVector::LINT0,
            Self::Lint1 => InterruptVector::LINT1,
            Self::Error => InterruptVector::ERROR,
        }
    }

    /// Returns the source delivered on `vector`, if any.
    pub fn from_vector(vector: InterruptVector) -> Option<Self> {
        Self::ALL.into_iter().find(|source| source.vector() == vector)
    }
}

/// Local interrupt pin wired to the processor `NMI` line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalNmiSource {
    /// `LINT0` or `LINT1`.
    pub pin: LocalInterrupt,
    /// Pin polarity.
    pub polarity: PinPolarity,
    /// Pin trigger mode.
    pub trigger_mode: TriggerMode,
}

impl LocalNmiSource {
    /// Architectural default: `LINT1`, edge-triggered, active high.
    pub const DEFAULT: Self = Self {
        pin: LocalInterrupt::Lint1,
        polarity: PinPolarity::ActiveHigh,
        trigger_mode: TriggerMode::Edge,
    };
}

/// _Timer Divide Configuration Register_ values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TimerDivide {
    /// Divide the bus clock by 1.
    By1 = 0b1011,
    /// Divide the bus clock by 2.
    By2 = 0b0000,
    /// Divide the bus clock by 4.
    By4 = 0b0001,
    /// Divide the bus clock by 8.
    By8 = 0b0010,
    /// Divide the bus clock by 16.
    By16 = 0b0011,
    /// Divide the bus clock by 32.
    By32 = 0b1000,
    /// Divide the bus clock by 64.
    By64 = 0b1001,
    /// Divide the bus clock by 128.
    By128 = 0b1010,
}

/// Number of polls of the delivery status before giving up on an `IPI`, during application processors bring-up.
pub const IPI_DISPATCH_POLLS: u32 = 1_000_000;

/// System-wide access to the _xAPIC_ register window.
///
/// Every access reaches the local _APIC_ of the processor executing it. The `ICR` lock is shared by every
/// processor, so that the two halves of different `IPIs` are never interleaved.
pub struct XApic {
    window: &'static dyn RegisterBlock,
    icr_lock: Mutex<()>,
}

impl XApic {
    /// Checks if the processor has an on-chip _xAPIC_.
    pub fn supports_xapic(cpu: &dyn Processor) -> bool {
        cpu.cpu_feature_support(CPU_FEAT_APIC)
    }

    /// Checks if the processor supports _x2APIC_ mode.
    pub fn supports_x2apic(cpu: &dyn Processor) -> bool {
        cpu.cpu_feature_support(CPU_FEAT_X2APIC)
    }

    /// Reads the `IA32_APIC_BASE` MSR of the current processor.
    pub fn read_base_msr(cpu: &dyn Processor) -> Option<Ia32ApicBase> {
        cpu.apic_base()
    }

    /// Writes the `IA32_APIC_BASE` MSR of the current processor.
    ///
    /// # Safety
    ///
    /// Moving or disabling the local _APIC_ invalidates the register window used by the kernel.
    pub unsafe fn write_base_msr(cpu: &dyn Processor, value: Ia32ApicBase) {
        unsafe { cpu.write_msr(IA32_APIC_BASE, value.into()) }
    }

    /// Creates a new `XApic` over a mapped register window.
    pub const fn new(window: &'static dyn RegisterBlock) -> Self {
        Self {
            window,
            icr_lock: Mutex::new(()),
        }
    }

    fn read_reg(&self, register: LocalAPICRegisterOffset) -> u32 {
        self.window.read(register.get())
    }

    fn write_reg(&self, register: LocalAPICRegisterOffset, value: u32) {
        self.window.write(register.get(), value);
    }

    /// Returns the local _APIC_ ID of the current processor.
    pub fn id(&self) -> ProcLocalApicID {
        ProcLocalApicID((self.read_reg(LocalAPICRegisterOffset::ID_REGISTER) >> 24) as u8)
    }

    /// Reads the version register.
    pub fn version(&self) -> LocalAPICVersionRegister {
        self.read_reg(LocalAPICRegisterOffset::VERSION_REGISTER).into()
    }

    /// Reads an _LVT_ entry.
    pub fn read_lvt(&self, source: LocalInterrupt) -> LocalVectorTableEntry {
        self.read_reg(source.register()).into()
    }

    /// Writes an _LVT_ entry.
    pub fn write_lvt(&self, source: LocalInterrupt, entry: LocalVectorTableEntry) {
        self.write_reg(source.register(), entry.into());
    }

    /// Unmasks a local interrupt source.
    pub fn allow(&self, source: LocalInterrupt) {
        let entry = self.read_lvt(source);
        self.write_lvt(source, entry.with_masked(false));
    }

    /// Masks a local interrupt source.
    pub fn forbid(&self, source: LocalInterrupt) {
        let entry = self.read_lvt(source);
        self.write_lvt(source, entry.with_masked(true));
    }

    /// Returns `true` if the local interrupt source is unmasked.
    pub fn status(&self, source: LocalInterrupt) -> bool {
        !self.read_lvt(source).masked()
    }

    /// Reads the _Spurious Vector Register_.
    pub fn read_svr(&self) -> LocalAPICSpuriousVectorRegister {
        self.read_reg(LocalAPICRegisterOffset::SVR).into()
    }

    /// Writes the _Spurious Vector Register_.
    pub fn write_svr(&self, svr: LocalAPICSpuriousVectorRegister) {
        self.write_reg(LocalAPICRegisterOffset::SVR, svr.into());
    }

    /// Updates the `EOI` (_End of Interrupt_) register upon interrupt completion.
    pub fn send_end_of_interrupt(&self) {
        self.write_reg(LocalAPICRegisterOffset::EOI_REGISTER, 0);
    }

    /// Sets the _Task Priority Register_. Interrupts with a priority class lower or equal are blocked.
    pub fn set_task_priority(&self, priority: u8) {
        self.write_reg(LocalAPICRegisterOffset::TASK_PRIORITY, u32::from(priority));
    }

    /// Clears the _Error Status Register_.
    pub fn clear_errors(&self) {
        self.write_reg(LocalAPICRegisterOffset::ERROR_REGISTER, 0);
    }

    /// Reads the [`LocalAPICErrorRegister`] from the corresponding _APIC_ register.
    ///
    /// The register is written first to latch the errors detected since the last read.
    pub fn read_error_register(&self) -> LocalAPICErrorRegister {
        self.write_reg(LocalAPICRegisterOffset::ERROR_REGISTER, 0);
        self.read_reg(LocalAPICRegisterOffset::ERROR_REGISTER).into()
    }

    /// Issues an _IPI_ (_Interprocessor Interrupt_) from the current processor.
    ///
    /// Writes the `ICR` using two 32-bits writes: destination (high doubleword) first, since writing the low
    /// doubleword sends the interrupt.
    pub fn write_icr(&self, icr: InterruptCommandRegisterEntry) {
        let (high, low) = icr.halves();
        let _guard = self.icr_lock.lock();

        self.write_reg(LocalAPICRegisterOffset::ICR_HIGH, high);
        self.write_reg(LocalAPICRegisterOffset::ICR_LOW, low);
    }

    /// Reads the `ICR`.
    pub fn read_icr(&self) -> InterruptCommandRegisterEntry {
        let _guard = self.icr_lock.lock();
        let high = self.read_reg(LocalAPICRegisterOffset::ICR_HIGH);
        let low = self.read_reg(LocalAPICRegisterOffset::ICR_LOW);

        InterruptCommandRegisterEntry::from((u64::from(high) << 32) | u64::from(low))
    }

    /// Sends an `INIT` request (assert or de-assert) to a processor.
    pub fn send_init_ipi(&self, destination: ProcLocalApicID, level: IPILevel) {
        self.write_icr(InterruptCommandRegisterEntry::init(destination, level));
    }

    /// Sends a _start-up_ `IPI` to a processor.
    pub fn send_startup_ipi(&self, destination: ProcLocalApicID, startup_address: PhyAddr32) {
        self.write_icr(InterruptCommandRegisterEntry::startup(
            destination,
            startup_address,
        ));
    }

    /// Broadcasts an _INIT level de-assert_ to synchronize the arbitration IDs, and waits for it to be dispatched.
    pub fn synchronize_arbitration_ids(&self) {
        self.write_icr(InterruptCommandRegisterEntry::synchronize_arbitration());
        self.wait_for_ipi_dispatch();
    }

    fn ipi_pending(&self) -> bool {
        let low = self.read_reg(LocalAPICRegisterOffset::ICR_LOW);

        InterruptCommandRegisterEntry::from(u64::from(low)).delivery_status()
            == DeliveryStatus::SendPending
    }

    /// Spins until the last `IPI` left the local _APIC_.
    ///
    /// This does not mean that the target processor accepted it.
    pub fn wait_for_ipi_dispatch(&self) {
        while self.ipi_pending() {
            core::hint::spin_loop();
        }
    }

    /// Spins until the last `IPI` left the local _APIC_, for at most `polls` reads of the delivery status.
    ///
    /// Returns `false` if the `IPI` is still pending.
    pub fn try_wait_for_ipi_dispatch(&self, polls: u32) -> bool {
        for _ in 0..polls {
            if !self.ipi_pending() {
                return true;
            }
            core::hint::spin_loop();
        }

        !self.ipi_pending()
    }

    /// Programs the timer divide configuration.
    pub fn set_timer_divide(&self, divide: TimerDivide) {
        self.write_reg(LocalAPICRegisterOffset::TIMER_DIVIDE, divide as u32);
    }

    /// Sets the timer initial count, which (re)starts the countdown.
    pub fn set_timer_initial_count(&self, count: u32) {
        self.write_reg(LocalAPICRegisterOffset::TIMER_INITIAL_COUNT, count);
    }

    /// Reads the timer current count.
    pub fn timer_current_count(&self) -> u32 {
        self.read_reg(LocalAPICRegisterOffset::TIMER_CURRENT_COUNT)
    }
}

/// Per-processor _Local APIC_ configuration.
///
/// Register access goes through the [`XApic`] window, so a `LocalApic` must only be initialized by the processor it
/// describes.
#[derive(Debug, Clone)]
pub struct LocalApic {
    cpu_id: ProcLocalApicID,
    acpi_processor_id: u8,
    nmi_sources: Vec<LocalNmiSource>,
}

impl LocalApic {
    /// Creates a new `LocalApic`. Without explicit `NMI` sources, [`LocalNmiSource::DEFAULT`] is used.
    pub fn new(cpu_id: ProcLocalApicID, acpi_processor_id: u8, nmi_sources: Vec<LocalNmiSource>) -> Self {
        let nmi_sources = if nmi_sources.is_empty() {
            alloc::vec![LocalNmiSource::DEFAULT]
        } else {
            nmi_sources
        };

        Self {
            cpu_id,
            acpi_processor_id,
            nmi_sources,
        }
    }

    /// Local _APIC_ ID of the processor.
    pub fn cpu_id(&self) -> ProcLocalApicID {
        self.cpu_id
    }

    /// `ACPI` processor UID.
    pub fn acpi_processor_id(&self) -> u8 {
        self.acpi_processor_id
    }

    /// Local pins wired to `NMI`.
    pub fn nmi_sources(&self) -> &[LocalNmiSource] {
        &self.nmi_sources
    }

    /// Initializes the local _APIC_ of the current processor.
    ///
    /// Masks every _LVT_ entry, programs the `NMI` pins, software enables the _APIC_ with the spurious vector,
    /// clears any pending interrupt, synchronizes arbitration IDs and accepts every interrupt priority.
    pub fn initialize(&self, xapic: &XApic) {
        self.initialize_local_vector_table(xapic);

        for nmi in &self.nmi_sources {
            xapic.write_lvt(
                nmi.pin,
                LocalVectorTableEntry::new()
                    .with_vector(InterruptVector::NONE)
                    .with_delivery_mode(DeliveryMode::NonMaskableInterrupt)
                    .with_pin_polarity(nmi.polarity)
                    .with_trigger_mode(nmi.trigger_mode)
                    .with_masked(false),
            );
        }

        xapic.write_svr(
            LocalAPICSpuriousVectorRegister::new()
                .with_vector(InterruptVector::SPURIOUS)
                .with_soft_enable(true),
        );

        xapic.send_end_of_interrupt();
        xapic.synchronize_arbitration_ids();
        xapic.set_task_priority(0);
    }

    /// Loads the default _Local Vector Table_: every source masked, on its own vector.
    ///
    /// The `CMCI` entry only exists when the _APIC_ reports at least 7 entries.
    fn initialize_local_vector_table(&self, xapic: &XApic) {
        let has_cmci = xapic.version().max_lvt_entry() >= 6;

        for source in LocalInterrupt::ALL {
            if source == LocalInterrupt::Cmci && !has_cmci {
                continue;
            }

            let entry = LocalVectorTableEntry::new()
                .with_vector(source.vector())
                .with_delivery_mode(DeliveryMode::Fixed)
                .with_masked(true);

            xapic.write_lvt(source, entry);
        }
    }
}
