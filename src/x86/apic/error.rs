//! Local _APIC_ error interrupt.
//!
//! When the local _APIC_ detects an error (illegal vector, rejected message on the bus, ...), it latches it in the
//! _Error Status Register_ and raises [`InterruptVector::ERROR`] through its `ERROR` _LVT_ entry.
//!
//! [`InterruptVector::ERROR`]: crate::fzboot::irq::vector::InterruptVector::ERROR

use crate::error;
use crate::x86::apic::local_apic::{LocalAPICErrorRegister, LocalInterrupt, XApic};

/// Error interrupt handler shared by every processor.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalApicErrorHandler;

impl LocalApicErrorHandler {
    /// Creates a new `LocalApicErrorHandler`.
    pub const fn new() -> Self {
        Self
    }

    /// Arms the error interrupt on the current processor, and discards errors latched so far.
    pub fn enable_current(&self, xapic: &XApic) {
        xapic.clear_errors();
        xapic.allow(LocalInterrupt::Error);
    }

    /// Handles an error interrupt raised on the current processor.
    ///
    /// Logs every error bit set, and returns the register content.
    pub fn handle(&self, xapic: &XApic) -> LocalAPICErrorRegister {
        let esr = xapic.read_error_register();
        let cpu = xapic.id();

        let errors = [
            (esr.send_chksum_error(), "send checksum error"),
            (esr.receive_chksum_error(), "receive checksum error"),
            (esr.send_accept_error(), "send accept error"),
            (esr.receive_accept_error(), "receive accept error"),
            (esr.redirectable_ipi(), "redirectable IPI"),
            (esr.send_illegal_vector(), "send illegal vector"),
            (esr.received_illegal_vector(), "received illegal vector"),
            (esr.illegal_register_address(), "illegal register address"),
        ];

        for (_, description) in errors.iter().filter(|(set, _)| *set) {
            error!("lapic", "CPU [{}] local APIC error: {}", cpu, description);
        }

        esr
    }
}
