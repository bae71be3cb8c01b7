#![warn(missing_copy_implementations)]
#![warn(missing_docs)]
#![warn(trivial_casts)]
#![warn(trivial_numeric_casts)]
#![warn(unused_crate_dependencies)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![cfg_attr(not(test), no_std)]

//! Interrupt routing and multiprocessor bring-up for the FrozenBoot x86 kernel.
//!
//! Interrupt requests are routed through the legacy 8259 [`Pic`](io::pic::Pic) until the platform is switched to
//! _xAPIC_ mode by [`Apic`](x86::apic::Apic), which also starts the application processors. The rest of the kernel
//! goes through the [`InterruptService`](fzboot::irq::service::InterruptService), which hides the active backend.

extern crate alloc;

pub mod fzboot;
pub mod io;
pub mod mem;
pub mod x86;

#[cfg(test)]
mod testing;

pub use crate::fzboot::*;
