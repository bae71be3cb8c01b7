//! `CMOS` memory access.
//!
//! The `CMOS` is reached through an index port (`0x70`) and a data port (`0x71`). Bit 7 of the index port also gates
//! the processor `NMI` line: the chip keeps whatever value was last written, so every register selection must carry
//! the current `NMI` state.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::io::{IOPort, PortIo};

/// `CMOS` index port.
const CMOS_INDEX_PORT: IOPort = IOPort::new(0x70);

/// `CMOS` data port.
const CMOS_DATA_PORT: IOPort = IOPort::new(0x71);

/// Index port bit that masks the `NMI` line when set.
const NMI_DISABLE_BIT: u8 = 1 << 7;

/// Shutdown status byte, read by the `BIOS` after a processor reset.
pub const SHUTDOWN_STATUS_REGISTER: u8 = 0x0F;

/// Shutdown status value requesting a jump through the warm-reset vector at `0x467`.
pub const SHUTDOWN_WARM_RESET: u8 = 0x0A;

/// `CMOS` chip driver.
pub struct Cmos {
    ports: &'static dyn PortIo,
    nmi_disabled: AtomicBool,
}

impl Cmos {
    /// Creates a new `Cmos`, with `NMI` enabled.
    pub const fn new(ports: &'static dyn PortIo) -> Self {
        Self {
            ports,
            nmi_disabled: AtomicBool::new(false),
        }
    }

    fn select(&self, register: u8) {
        let nmi = if self.nmi_disabled.load(Ordering::Acquire) {
            NMI_DISABLE_BIT
        } else {
            0
        };

        self.ports.outb(CMOS_INDEX_PORT, (register & !NMI_DISABLE_BIT) | nmi);
        self.ports.io_delay();
    }

    /// Reads a `CMOS` register.
    pub fn read(&self, register: u8) -> u8 {
        self.select(register);
        self.ports.inb(CMOS_DATA_PORT)
    }

    /// Writes a `CMOS` register.
    pub fn write(&self, register: u8, value: u8) {
        self.select(register);
        self.ports.outb(CMOS_DATA_PORT, value);
    }

    /// Masks the `NMI` line at the chipset level.
    pub fn disable_nmi(&self) {
        self.nmi_disabled.store(true, Ordering::Release);
        self.select(0);
    }

    /// Unmasks the `NMI` line.
    pub fn enable_nmi(&self) {
        self.nmi_disabled.store(false, Ordering::Release);
        self.select(0);
    }

    /// Returns `true` if the `NMI` line is currently masked.
    pub fn nmi_disabled(&self) -> bool {
        self.nmi_disabled.load(Ordering::Acquire)
    }
}
