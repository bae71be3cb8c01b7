//! This module provides utilities to control
//! and configure PIC chip. This chips act as intermediates
//! between hardware interrupts (IRQs) and CPU by remapping those
//! to given CPU interrupts.
//! Usually there are 2 PICs configured as master/slave.
//! Slave interrupts are thus be redirected to the master through one single IRQ.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::fzboot::irq::vector::{InterruptRequest, InterruptVector};
use crate::info;
use crate::io::{IOPort, PortIo};

/// Initialization is made by sending ICW (Initialization Command Words)
/// to both Master and Slave controllers.
///
/// 4 ICWs have to be sent.
///
///  - - -
/// | ICW1 |
///  - - -
///
/// ICW1 tells controllers to start the init protocol and sets a few
/// general settings (CMD port)
///
/// Bindings :
///
/// 0 0 0 1 x 0 x x
///         |   | | _ _ _ _ _ ICW4 present (1) or not (0)
///         |   | _ _ _ _ _ _ Single (1) or cascade mode (0)
///         | _ _ _ _ _ _ _ _ Triggered mode : level (1) or edge (0)
///
///  - - -
/// | ICW2 |
///  - - -
///
/// ICW2 sets the offset of the controller for the IRQ => Interrupts
/// translation. (DATA port)
///
/// Offset is always a multiple of 8, implying that lower 3 bits are null.
///
///  - - -
/// | ICW3 |
///  - - -
///
/// ICW3 tells how master and slave controllers are connected together. (DATA port)
///
/// Master : bitmask for pins that have a slave connected to it.
/// Slave : slave ID (pin number he is connected to).
///
///  - - -
/// | ICW4 |
///  - - -
///
/// ICW4 Set additional settings (8086 mode, automatic EOI, buffering). (DATA port)
const DEFAULT_ICW1: u8 = 0b0001_0001;
const DEFAULT_MASTER_ICW3: u8 = 0b0000_0100;
const DEFAULT_SLAVE_ICW3: u8 = 0b0000_0010;
const DEFAULT_ICW4: u8 = 0b0000_0001;

/// OCW2 : non-specific end of interrupt (CMD port).
///
/// Both slave and master PIC have to be acknowledged for a slave interrupt.
const NON_SPECIFIC_EOI: u8 = 0b0010_0000;

/// OCW3 : next read of the CMD port returns the _In-Service Register_.
const READ_ISR: u8 = 0b0000_1011;

/// Vector offset of the master controller.
pub const PIC_MASTER_OFFSET: u8 = 0x20;

/// Vector offset of the slave controller.
pub const PIC_SLAVE_OFFSET: u8 = 0x28;

/// Pin of the master controller the slave is wired to.
const CASCADE_PIN: u8 = 2;

/// One of the two cascaded 8259 controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chip {
    Master,
    Slave,
}

impl Chip {
    fn of(request: InterruptRequest) -> (Self, u8) {
        let line = request.line();
        if line < 8 {
            (Self::Master, line)
        } else {
            (Self::Slave, line - 8)
        }
    }

    fn command_port(self) -> IOPort {
        match self {
            Self::Master => IOPort::new(0x20),
            Self::Slave => IOPort::new(0xA0),
        }
    }

    fn data_port(self) -> IOPort {
        match self {
            Self::Master => IOPort::new(0x21),
            Self::Slave => IOPort::new(0xA1),
        }
    }
}

/// Dual 8259 `PIC` driver.
///
/// Once initialized, IRQ lines are delivered on vectors `0x20..=0x2F`, and every line is masked except the
/// cascade line.
pub struct Pic {
    ports: &'static dyn PortIo,
    initialized: AtomicBool,
    mask_lock: Mutex<()>,
}

impl Pic {
    /// Creates a new, uninitialized `Pic`.
    pub const fn new(ports: &'static dyn PortIo) -> Self {
        Self {
            ports,
            initialized: AtomicBool::new(false),
            mask_lock: Mutex::new(()),
        }
    }

    /// Runs the initialization sequence, remapping the controllers to [`PIC_MASTER_OFFSET`] and [`PIC_SLAVE_OFFSET`].
    ///
    /// Each write is followed by an I/O delay, as old controllers cannot keep up with back-to-back commands.
    pub fn initialize(&self) {
        let ports = self.ports;
        let (master, slave) = (Chip::Master, Chip::Slave);

        // Start init sequence
        ports.outb(master.command_port(), DEFAULT_ICW1);
        ports.io_delay();
        ports.outb(slave.command_port(), DEFAULT_ICW1);
        ports.io_delay();

        // Set vector offset
        ports.outb(master.data_port(), PIC_MASTER_OFFSET);
        ports.io_delay();
        ports.outb(slave.data_port(), PIC_SLAVE_OFFSET);
        ports.io_delay();

        // Master PIC has slave at IRQ2
        ports.outb(master.data_port(), DEFAULT_MASTER_ICW3);
        ports.io_delay();
        ports.outb(slave.data_port(), DEFAULT_SLAVE_ICW3);
        ports.io_delay();

        ports.outb(master.data_port(), DEFAULT_ICW4);
        ports.io_delay();
        ports.outb(slave.data_port(), DEFAULT_ICW4);
        ports.io_delay();

        ports.outb(master.data_port(), !(1 << CASCADE_PIN));
        ports.outb(slave.data_port(), 0xFF);

        self.initialized.store(true, Ordering::Release);
        info!(
            "pic",
            "remapped to vectors {}..{}",
            InterruptVector::from(PIC_MASTER_OFFSET),
            InterruptVector::from(PIC_SLAVE_OFFSET + 7)
        );
    }

    /// Returns `true` once the initialization sequence was sent.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Unmasks an interrupt line.
    pub fn allow(&self, request: InterruptRequest) {
        let (chip, pin) = Chip::of(request);
        let _guard = self.mask_lock.lock();

        let mask = self.ports.inb(chip.data_port()) & !(1 << pin);
        self.ports.outb(chip.data_port(), mask);
    }

    /// Masks an interrupt line.
    pub fn forbid(&self, request: InterruptRequest) {
        let (chip, pin) = Chip::of(request);
        let _guard = self.mask_lock.lock();

        let mask = self.ports.inb(chip.data_port()) | (1 << pin);
        self.ports.outb(chip.data_port(), mask);
    }

    /// Masks every line, including the cascade.
    pub fn forbid_all(&self) {
        let _guard = self.mask_lock.lock();

        self.ports.outb(Chip::Master.data_port(), 0xFF);
        self.ports.outb(Chip::Slave.data_port(), 0xFF);
    }

    /// Returns `true` if the line is currently unmasked.
    pub fn status(&self, request: InterruptRequest) -> bool {
        let (chip, pin) = Chip::of(request);

        self.ports.inb(chip.data_port()) & (1 << pin) == 0
    }

    /// Acknowledges an interrupt.
    ///
    /// Lines wired to the slave controller need both controllers to be acknowledged, slave first.
    pub fn send_end_of_interrupt(&self, request: InterruptRequest) {
        if Chip::of(request).0 == Chip::Slave {
            self.ports.outb(Chip::Slave.command_port(), NON_SPECIFIC_EOI);
        }

        self.ports.outb(Chip::Master.command_port(), NON_SPECIFIC_EOI);
    }

    fn in_service(&self, chip: Chip) -> u8 {
        self.ports.outb(chip.command_port(), READ_ISR);
        self.ports.inb(chip.command_port())
    }

    /// Checks whether an interrupt on the last line of a controller is spurious.
    ///
    /// A spurious interrupt is raised on the lowest priority line (`IRQ7` or `IRQ15`) without the matching bit set in
    /// the _In-Service Register_, and must not be acknowledged. A spurious `IRQ15` still went through the master, so
    /// the cascade line is acknowledged on the master.
    ///
    /// Always returns `false` for other lines.
    pub fn is_spurious(&self, request: InterruptRequest) -> bool {
        match request {
            InterruptRequest::Lpt1 => self.in_service(Chip::Master) & (1 << 7) == 0,
            InterruptRequest::SecondaryAta => {
                if self.in_service(Chip::Slave) & (1 << 7) == 0 {
                    self.ports.outb(Chip::Master.command_port(), NON_SPECIFIC_EOI);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{leak, MockPorts};

    fn pic() -> (Pic, &'static MockPorts) {
        let ports = leak(MockPorts::default());
        let pic = Pic::new(ports);
        pic.initialize();
        (pic, ports)
    }

    #[test]
    fn initialization_sequence() {
        let ports = leak(MockPorts::default());
        let pic = Pic::new(ports);

        assert!(!pic.is_initialized());
        pic.initialize();
        assert!(pic.is_initialized());

        let writes = ports.writes();
        assert_eq!(
            &writes[..4],
            [
                (IOPort::new(0x20), 0x11),
                (IOPort::POST, 0),
                (IOPort::new(0xA0), 0x11),
                (IOPort::POST, 0),
            ]
        );
        assert_eq!(
            ports.writes_without_delays(),
            [
                (IOPort::new(0x20), 0x11),
                (IOPort::new(0xA0), 0x11),
                (IOPort::new(0x21), 0x20),
                (IOPort::new(0xA1), 0x28),
                (IOPort::new(0x21), 0x04),
                (IOPort::new(0xA1), 0x02),
                (IOPort::new(0x21), 0x01),
                (IOPort::new(0xA1), 0x01),
                (IOPort::new(0x21), 0xFB),
                (IOPort::new(0xA1), 0xFF),
            ]
        );
    }

    #[test]
    fn every_line_but_cascade_masked_after_init() {
        let (pic, _) = pic();

        for request in InterruptRequest::ALL {
            assert_eq!(pic.status(request), request == InterruptRequest::Cascade);
        }
    }

    #[test]
    fn allow_and_forbid_every_line() {
        let (pic, _) = pic();

        for request in InterruptRequest::ALL {
            pic.allow(request);
            assert!(pic.status(request), "{request} should be allowed");
            pic.forbid(request);
            assert!(!pic.status(request), "{request} should be forbidden");
        }
    }

    #[test]
    fn allow_only_touches_owning_chip() {
        let (pic, ports) = pic();

        pic.allow(InterruptRequest::Mouse);

        assert_eq!(ports.value(IOPort::new(0x21)), 0xFB);
        assert_eq!(ports.value(IOPort::new(0xA1)), 0xEF);
    }

    #[test]
    fn slave_interrupt_acknowledges_both_chips() {
        let (pic, ports) = pic();
        ports.clear_writes();

        pic.send_end_of_interrupt(InterruptRequest::Rtc);
        pic.send_end_of_interrupt(InterruptRequest::Keyboard);

        assert_eq!(
            ports.writes(),
            [
                (IOPort::new(0xA0), 0x20),
                (IOPort::new(0x20), 0x20),
                (IOPort::new(0x20), 0x20),
            ]
        );
    }

    #[test]
    fn spurious_master_interrupt_is_not_acknowledged() {
        let (pic, ports) = pic();
        ports.set_in_service(0, 0);
        ports.clear_writes();

        assert!(pic.is_spurious(InterruptRequest::Lpt1));
        assert_eq!(ports.writes(), [(IOPort::new(0x20), 0x0B)]);
    }

    #[test]
    fn real_master_interrupt_is_not_spurious() {
        let (pic, ports) = pic();
        ports.set_in_service(1 << 7, 0);

        assert!(!pic.is_spurious(InterruptRequest::Lpt1));
    }

    #[test]
    fn spurious_slave_interrupt_acknowledges_cascade() {
        let (pic, ports) = pic();
        ports.set_in_service(1 << 2, 0);
        ports.clear_writes();

        assert!(pic.is_spurious(InterruptRequest::SecondaryAta));
        assert_eq!(
            ports.writes(),
            [(IOPort::new(0xA0), 0x0B), (IOPort::new(0x20), 0x20)]
        );
    }

    #[test]
    fn real_slave_interrupt_is_not_spurious() {
        let (pic, ports) = pic();
        ports.set_in_service(1 << 2, 1 << 7);
        ports.clear_writes();

        assert!(!pic.is_spurious(InterruptRequest::SecondaryAta));
        assert_eq!(ports.writes(), [(IOPort::new(0xA0), 0x0B)]);
    }

    #[test]
    fn other_lines_are_never_spurious() {
        let (pic, ports) = pic();
        ports.clear_writes();

        assert!(!pic.is_spurious(InterruptRequest::Keyboard));
        assert!(ports.writes().is_empty());
    }
}
