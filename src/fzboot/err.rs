use core::fmt::Debug;

/// `BaseError` is a common trait implemented by every error type defined in the kernel.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are dealing with errors.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and don't need to return
/// anything.
///
/// For instance, it could be used when checking if a functionnality / feature is available on the
/// system, or when initializing a component.
///
/// # Examples:
///
/// ```
/// use fzkernel::errors::CanFail;
///
/// #[derive(Debug)]
/// struct InitError;
///
/// fn init_component() -> CanFail<InitError> {
///     Ok(())
/// }
/// ```
pub type CanFail<T> = Result<(), T>;

/// `ApicError` defines the failures that abort the bring-up of the _APIC_ backend.
///
/// Any of these leaves the legacy `PIC` as the active interrupt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicError {
    /// The processor does not report an on-chip _xAPIC_, or no `MADT` is available.
    NotAvailable,

    /// The caller is not the bootstrap processor.
    NotBootstrapProcessor,

    /// The `MADT` does not list any enabled processor local _APIC_.
    NoLocalApic,

    /// The `MADT` does not list any _I/O APIC_.
    NoIoApic,

    /// More than one _I/O APIC_ was found, which is not supported.
    UnsupportedIoApicCount(usize),

    /// The memory service could not map an _APIC_ register window.
    MappingFailed,

    /// The local _APIC_ of the current core did not match the `MADT`.
    SelfTestFailed,

    /// The application processor startup code does not fit in a single page.
    StartupCodeTooLarge(usize),

    /// The local _APIC_ timer could not be calibrated.
    Calibration,
}

impl BaseError for ApicError {}

/// `InterruptError` defines errors raised when converting raw interrupt numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptError {
    /// The value does not name one of the 16 legacy interrupt request lines.
    InvalidRequest(u8),
}

impl BaseError for InterruptError {}
