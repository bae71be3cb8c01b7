//! Interrupt numbering shared with the interrupt dispatcher.
//!
//! The 256 processor interrupt vectors are split in fixed ranges that must never collide:
//!
//! ```plaintext
//!  0x00 ..= 0x1F   processor exceptions
//!  0x20 ..= 0x2F   legacy IRQ lines (PIC offsets, default GSI + 32 vectors)
//!  0xC8 ..= 0xF7   software exceptions (system calls, ...)
//!  0xF8 ..= 0xFE   local APIC interrupts (CMCI, timer, thermal, performance, LINT0, LINT1, error)
//!  0xFF            spurious interrupt
//! ```

use core::fmt::{self, Display, Formatter};

use bytemuck::{Pod, Zeroable};
use modular_bitfield::error::{InvalidBitPattern, OutOfBounds};
use modular_bitfield::Specifier;

use crate::errors::InterruptError;

/// Processor interrupt vector (index in the `IDT`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InterruptVector(u8);

impl InterruptVector {
    /// First vector used by legacy interrupt requests.
    pub const IRQ_BASE: Self = Self(0x20);

    /// First software exception vector.
    pub const SOFTWARE_EXCEPTION_BASE: Self = Self(0xC8);

    /// Corrected machine-check interrupt.
    pub const CMCI: Self = Self(0xF8);

    /// Local _APIC_ timer.
    pub const TIMER: Self = Self(0xF9);

    /// Thermal sensor.
    pub const THERMAL: Self = Self(0xFA);

    /// Performance monitoring counters.
    pub const PERFORMANCE: Self = Self(0xFB);

    /// Local interrupt pin 0.
    pub const LINT0: Self = Self(0xFC);

    /// Local interrupt pin 1.
    pub const LINT1: Self = Self(0xFD);

    /// Internal _APIC_ error.
    pub const ERROR: Self = Self(0xFE);

    /// Spurious interrupt vector.
    pub const SPURIOUS: Self = Self(0xFF);

    /// Vector used for synthetic entries (`NMI`, `INIT`) whose vector field is ignored.
    pub const NONE: Self = Self(0);

    /// Returns `true` for processor exception vectors.
    pub fn is_exception(self) -> bool {
        self < Self::IRQ_BASE
    }

    /// Returns `true` if the vector belongs to the local _APIC_ range.
    pub fn is_local_apic(self) -> bool {
        (Self::CMCI..=Self::ERROR).contains(&self)
    }

    /// Returns the legacy interrupt request mapped on this vector, if any.
    pub fn request(self) -> Option<InterruptRequest> {
        let line = self.0.checked_sub(Self::IRQ_BASE.0)?;
        InterruptRequest::try_from(line).ok()
    }

    /// Returns the priority class of the interrupt vector.
    pub fn priority_class(self) -> u8 {
        self.0 >> 4
    }
}

impl From<u8> for InterruptVector {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<InterruptVector> for u8 {
    fn from(value: InterruptVector) -> Self {
        value.0
    }
}

impl From<InterruptRequest> for InterruptVector {
    fn from(value: InterruptRequest) -> Self {
        Self(Self::IRQ_BASE.0 + value as u8)
    }
}

impl Display for InterruptVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl Specifier for InterruptVector {
    const BITS: usize = 8;
    type Bytes = u8;
    type InOut = Self;

    fn into_bytes(input: Self::InOut) -> Result<Self::Bytes, OutOfBounds> {
        Ok(input.0)
    }

    fn from_bytes(bytes: Self::Bytes) -> Result<Self::InOut, InvalidBitPattern<Self::Bytes>> {
        Ok(Self(bytes))
    }
}

/// Legacy _ISA_ interrupt request line.
///
/// Maps 1:1 to a `PIC` pin and to `vector = line + 0x20`, but not necessarily to a [`GlobalSystemInterrupt`]: the
/// _I/O APIC_ override table must be consulted first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum InterruptRequest {
    /// Programmable interval timer.
    Pit = 0,
    /// PS/2 keyboard.
    Keyboard = 1,
    /// Slave `PIC` cascade line.
    Cascade = 2,
    /// Second serial port.
    Com2 = 3,
    /// First serial port.
    Com1 = 4,
    /// Second parallel port.
    Lpt2 = 5,
    /// Floppy disk controller.
    Floppy = 6,
    /// First parallel port, also raised for master spurious interrupts.
    Lpt1 = 7,
    /// Real-time clock.
    Rtc = 8,
    /// Free line.
    Free1 = 9,
    /// Free line.
    Free2 = 10,
    /// Free line.
    Free3 = 11,
    /// PS/2 mouse.
    Mouse = 12,
    /// x87 coprocessor.
    Fpu = 13,
    /// Primary ATA channel.
    PrimaryAta = 14,
    /// Secondary ATA channel, also raised for slave spurious interrupts.
    SecondaryAta = 15,
}

impl InterruptRequest {
    /// Every request line, in pin order.
    pub const ALL: [Self; 16] = [
        Self::Pit,
        Self::Keyboard,
        Self::Cascade,
        Self::Com2,
        Self::Com1,
        Self::Lpt2,
        Self::Floppy,
        Self::Lpt1,
        Self::Rtc,
        Self::Free1,
        Self::Free2,
        Self::Free3,
        Self::Mouse,
        Self::Fpu,
        Self::PrimaryAta,
        Self::SecondaryAta,
    ];

    /// Returns the line number.
    pub fn line(self) -> u8 {
        self as u8
    }

    /// Returns the vector this line is delivered on.
    pub fn vector(self) -> InterruptVector {
        self.into()
    }
}

impl TryFrom<u8> for InterruptRequest {
    type Error = InterruptError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(InterruptError::InvalidRequest(value))
    }
}

impl Display for InterruptRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "IRQ{}", self.line())
    }
}

/// _Global System Interrupt_, the platform-wide _I/O APIC_ input number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct GlobalSystemInterrupt(u32);

impl GlobalSystemInterrupt {
    /// Creates a new `GlobalSystemInterrupt`.
    pub const fn new(gsi: u32) -> Self {
        Self(gsi)
    }

    /// Returns the raw interrupt number.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the default vector for this interrupt (`GSI + 0x20`), if it fits below the software exceptions.
    pub fn default_vector(self) -> Option<InterruptVector> {
        let vector = self.0.checked_add(u32::from(InterruptVector::IRQ_BASE.0))?;

        if vector < u32::from(InterruptVector::SOFTWARE_EXCEPTION_BASE.0) {
            u8::try_from(vector).ok().map(InterruptVector)
        } else {
            None
        }
    }

    /// Returns the interrupt targeted by a vector in the external range (`vector - 0x20`).
    pub fn from_vector(vector: InterruptVector) -> Option<Self> {
        u8::from(vector)
            .checked_sub(InterruptVector::IRQ_BASE.0)
            .map(|gsi| Self(u32::from(gsi)))
    }
}

impl From<InterruptRequest> for GlobalSystemInterrupt {
    fn from(value: InterruptRequest) -> Self {
        Self(u32::from(value.line()))
    }
}

impl From<u32> for GlobalSystemInterrupt {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for GlobalSystemInterrupt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "GSI{}", self.0)
    }
}
