//! The `InterruptService` hides which interrupt controller is in use.
//!
//! Device drivers and the interrupt dispatcher only deal with [`InterruptRequest`] lines and [`InterruptVector`]s.
//! The service forwards them to the active backend: the legacy [`Pic`], or the [`Apic`] once the platform was
//! switched to _xAPIC_ mode.
//!
//! The system service should be registered once with [`register_interrupt_service`], and retrieved with
//! [`interrupt_service`].
//!
//! # Examples
//!
//! ```ignore
//! let service = InterruptService::select(pic, apic);
//! register_interrupt_service(service);
//!
//! interrupt_service().unwrap().allow(InterruptRequest::Keyboard);
//! ```

use conquer_once::spin::OnceCell;

use crate::errors::ApicError;
use crate::fzboot::irq::vector::{InterruptRequest, InterruptVector};
use crate::io::pic::Pic;
use crate::x86::apic::Apic;
use crate::{info, warn};

/// System interrupt service.
static INTERRUPT_SERVICE: OnceCell<InterruptService> = OnceCell::uninit();

/// Registers the system `InterruptService`.
///
/// Returns `false` if a service was already registered, in which case the previous one is kept.
pub fn register_interrupt_service(service: InterruptService) -> bool {
    INTERRUPT_SERVICE.try_init_once(|| service).is_ok()
}

/// Returns the system `InterruptService`, if it was registered.
pub fn interrupt_service() -> Option<&'static InterruptService> {
    INTERRUPT_SERVICE.get()
}

/// Interrupt controller backing an [`InterruptService`].
#[derive(Clone, Copy)]
enum Backend {
    Pic(&'static Pic),
    Apic(&'static Apic),
}

/// Uniform interface over the active interrupt controller.
#[derive(Clone, Copy)]
pub struct InterruptService {
    backend: Backend,
}

impl InterruptService {
    /// Creates a new `InterruptService` backed by the legacy `PIC`.
    pub fn with_pic(pic: &'static Pic) -> Self {
        Self {
            backend: Backend::Pic(pic),
        }
    }

    /// Creates a new `InterruptService` backed by the _APIC_.
    pub fn with_apic(apic: &'static Apic) -> Self {
        Self {
            backend: Backend::Apic(apic),
        }
    }

    /// Picks the _APIC_ if it was successfully initialized, and falls back to the `PIC` otherwise.
    pub fn select(pic: &'static Pic, apic: Result<&'static Apic, ApicError>) -> Self {
        match apic {
            Ok(apic) => {
                info!("irq", "using APIC backend");
                Self::with_apic(apic)
            }
            Err(err) => {
                warn!("irq", "APIC unavailable ({:?}), using PIC backend", err);
                if !pic.is_initialized() {
                    pic.initialize();
                }
                Self::with_pic(pic)
            }
        }
    }

    /// Returns `true` if the _APIC_ is the active backend.
    pub fn uses_apic(&self) -> bool {
        matches!(self.backend, Backend::Apic(_))
    }

    /// Unmasks an interrupt request line.
    ///
    /// # Panics
    ///
    /// With the _APIC_ backend, panics if the line is wired to `NMI`.
    pub fn allow(&self, request: InterruptRequest) {
        match self.backend {
            Backend::Pic(pic) => pic.allow(request),
            Backend::Apic(apic) => apic.allow(request),
        }
    }

    /// Masks an interrupt request line.
    ///
    /// # Panics
    ///
    /// With the _APIC_ backend, panics if the line is wired to `NMI`.
    pub fn forbid(&self, request: InterruptRequest) {
        match self.backend {
            Backend::Pic(pic) => pic.forbid(request),
            Backend::Apic(apic) => apic.forbid(request),
        }
    }

    /// Returns `true` if the interrupt request line is unmasked.
    pub fn status(&self, request: InterruptRequest) -> bool {
        match self.backend {
            Backend::Pic(pic) => pic.status(request),
            Backend::Apic(apic) => apic.status(request),
        }
    }

    /// Acknowledges an interrupt. Must be called exactly once for every dispatched interrupt.
    pub fn send_end_of_interrupt(&self, vector: InterruptVector) {
        match self.backend {
            Backend::Pic(pic) => {
                if let Some(request) = vector.request() {
                    pic.send_end_of_interrupt(request);
                }
            }
            Backend::Apic(apic) => apic.send_end_of_interrupt(vector),
        }
    }

    /// Returns `true` if the interrupt is spurious, and must be ignored without acknowledgement.
    pub fn check_spurious_interrupt(&self, vector: InterruptVector) -> bool {
        match self.backend {
            Backend::Pic(pic) => vector
                .request()
                .is_some_and(|request| pic.is_spurious(request)),
            Backend::Apic(apic) => apic.is_spurious(vector),
        }
    }
}
