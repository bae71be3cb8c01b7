//! Port-mapped I/O.
//!
//! Legacy devices used during interrupt controller bring-up (8259 `PIC`, `CMOS`, `IMCR`) are reached through the
//! processor I/O address space. Drivers talk to them through the [`PortIo`] trait so the same code runs against
//! the real `in`/`out` instructions ([`HardwarePorts`]) or a simulated bus.

use bytemuck::{Pod, Zeroable};

pub mod acpi;
pub mod cmos;
pub mod pic;

/// I/O port address.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct IOPort(u16);

impl IOPort {
    /// _Interrupt Mode Configuration Register_ address port.
    pub const IMCR_ADDR: Self = Self(0x22);

    /// _Interrupt Mode Configuration Register_ data port.
    pub const IMCR_DATA: Self = Self(0x23);

    /// Unused port, written to in order to wait for an I/O cycle.
    pub const POST: Self = Self(0x80);

    /// Creates a new `IOPort`.
    pub const fn new(port: u16) -> Self {
        Self(port)
    }
}

impl From<u16> for IOPort {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<IOPort> for u16 {
    fn from(value: IOPort) -> Self {
        value.0
    }
}

/// Byte-wide access to the processor I/O address space.
pub trait PortIo: Sync {
    /// Writes a byte to `port`.
    fn outb(&self, port: IOPort, data: u8);

    /// Reads a byte from `port`.
    fn inb(&self, port: IOPort) -> u8;

    /// Waits for roughly one I/O cycle, required between some legacy device commands.
    fn io_delay(&self) {
        self.outb(IOPort::POST, 0);
    }
}

/// Writes to the _Interrupt Mode Configuration Register_ to route `INTR` and `NMI` through the local _APIC_ instead
/// of directly to the processor.
///
/// Only present on systems implementing the _PIC mode_ of the MP specification, harmless otherwise.
pub fn switch_imcr_to_apic(ports: &dyn PortIo) {
    ports.outb(IOPort::IMCR_ADDR, 0x70);
    ports.outb(IOPort::IMCR_DATA, 0x01);
}

/// Writes to the _Interrupt Mode Configuration Register_ to connect `INTR` and `NMI` directly to the processor
/// again, bypassing the local _APIC_.
pub fn switch_imcr_to_pic(ports: &dyn PortIo) {
    ports.outb(IOPort::IMCR_ADDR, 0x70);
    ports.outb(IOPort::IMCR_DATA, 0x00);
}

/// [`PortIo`] implementation using the `in` and `out` instructions.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwarePorts;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PortIo for HardwarePorts {
    fn outb(&self, port: IOPort, data: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") u16::from(port),
            in("al") data,
            options(nomem, nostack, preserves_flags)
            );
        }
    }

    fn inb(&self, port: IOPort) -> u8 {
        let data: u8;
        unsafe {
            core::arch::asm!(
            "in al, dx",
            in("dx") u16::from(port),
            out("al") data,
            options(nomem, nostack, preserves_flags)
            );
        }
        data
    }
}
