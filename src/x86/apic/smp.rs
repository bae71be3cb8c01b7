//! Application processors bring-up.
//!
//! Application processors are started one at a time by the bootstrap processor, using the _INIT-SIPI-SIPI_
//! sequence. They wake up in real mode, at the start-up code copied to [`STARTUP_CODE_ADDRESS`]. This code is an
//! opaque blob provided by the kernel ([`StartupStub`]), patched with the values every processor needs to reach
//! the kernel: `IDT` descriptor, control registers, per-processor `GDT` and stack, and the entry point.
//!
//! The per-processor `GDT` and stack arrays are indexed by local _APIC_ ID: the start-up code reads its own ID to
//! pick its slot.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use conquer_once::spin::OnceCell;

use crate::errors::ApicError;
use crate::fzboot::time::wait_for;
use crate::io::cmos::{Cmos, SHUTDOWN_STATUS_REGISTER, SHUTDOWN_WARM_RESET};
use crate::mem::{PhyAddr32, PAGE_SIZE};
use crate::x86::apic::controller::{Apic, ApicState};
use crate::x86::apic::local_apic::{IPILevel, ProcLocalApicID, IPI_DISPATCH_POLLS};
use crate::x86::cpu::{ControlRegisters, DescriptorTablePointer};
use crate::x86::descriptors::gdt::ProcessorDescriptorTables;
use crate::{error, info};

/// Physical address the start-up code is copied to. Must be page aligned and below 1 MiB.
pub const STARTUP_CODE_ADDRESS: PhyAddr32 = PhyAddr32::new(0x8000);

/// Size of the stack given to every application processor.
pub const AP_STACK_SIZE: usize = 16 * 1024;

/// Interval between two checks of an application processor running flag.
pub const AP_BOOT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Number of checks of an application processor running flag before giving up on it.
pub const AP_BOOT_POLLS: u32 = 10;

/// Delay between the _INIT_ de-assert and the first _start-up_ `IPI`.
pub const INIT_DEASSERT_DELAY: Duration = Duration::from_millis(10);

/// Delay after each _start-up_ `IPI`.
pub const STARTUP_DELAY: Duration = Duration::from_micros(200);

/// Stack of an application processor. The top of the stack is 16-byte aligned.
#[repr(C, align(16))]
struct ApplicationProcessorStack([u8; AP_STACK_SIZE]);

/// Physical address of the _BIOS_ warm-reset vector (`40:67`).
const WARM_RESET_VECTOR: PhyAddr32 = PhyAddr32::new(0x467);

/// Maximum number of local _APICs_ addressable in _xAPIC_ mode.
const MAX_PROCESSORS: usize = 256;

/// System [`Apic`] and application processors main function, used by the start-up code entry point.
static SYSTEM_APIC: OnceCell<(&'static Apic, fn() -> !)> = OnceCell::uninit();

/// Registers the system [`Apic`], and the function application processors run once parallel computing is allowed.
///
/// Must be done before [`Apic::startup_application_processors`]. Returns `false` if a system `Apic` was already
/// registered.
pub fn register_system_apic(apic: &'static Apic, ap_main: fn() -> !) -> bool {
    SYSTEM_APIC.try_init_once(|| (apic, ap_main)).is_ok()
}

/// Running state of the application processors.
///
/// Every running flag has a single writer (the processor itself, once) and a single reader (the bootstrap
/// processor, while bringing that processor up).
pub struct ApplicationProcessorStates {
    running: [AtomicBool; MAX_PROCESSORS],
    parallel_computing_allowed: AtomicBool,
}

impl ApplicationProcessorStates {
    /// Creates a new `ApplicationProcessorStates`, with no processor running.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const NOT_RUNNING: AtomicBool = AtomicBool::new(false);

        Self {
            running: [NOT_RUNNING; MAX_PROCESSORS],
            parallel_computing_allowed: AtomicBool::new(false),
        }
    }

    /// Marks a processor as running.
    pub fn mark_running(&self, id: ProcLocalApicID) {
        self.running[id.index()].store(true, Ordering::Release);
    }

    /// Returns `true` if the processor marked itself as running.
    pub fn is_running(&self, id: ProcLocalApicID) -> bool {
        self.running[id.index()].load(Ordering::Acquire)
    }

    /// Lets every application processor leave its start-up routine.
    pub fn allow_parallel_computing(&self) {
        self.parallel_computing_allowed.store(true, Ordering::Release);
    }

    /// Returns `true` once application processors may run kernel code.
    pub fn is_parallel_computing_allowed(&self) -> bool {
        self.parallel_computing_allowed.load(Ordering::Acquire)
    }
}

impl Default for ApplicationProcessorStates {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte offsets, in the start-up code, of the values filled before starting the application processors.
///
/// `idt` receives an `IDTR` image, every other field a native-endian `usize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupPatchPoints {
    /// `IDTR` image loaded by every processor.
    pub idt: usize,
    /// `CR0` value.
    pub cr0: usize,
    /// `CR3` value.
    pub cr3: usize,
    /// `CR4` value.
    pub cr4: usize,
    /// Address of the array of `GDTR` image addresses, indexed by local _APIC_ ID.
    pub gdts: usize,
    /// Address of the array of stack tops, indexed by local _APIC_ ID.
    pub stacks: usize,
    /// Address of the kernel entry point.
    pub entry: usize,
}

/// Values written to the start-up code patch points.
#[derive(Debug, Clone, Copy)]
pub struct StartupValues {
    /// Current `IDTR`.
    pub idt: DescriptorTablePointer,
    /// Current control registers.
    pub control: ControlRegisters,
    /// Address of the `GDTR` image addresses array.
    pub gdts: usize,
    /// Address of the stack tops array.
    pub stacks: usize,
    /// Address of the entry point.
    pub entry: usize,
}

/// Application processors start-up code.
#[derive(Debug, Clone, Copy)]
pub struct StartupStub {
    code: &'static [u8],
    patch: StartupPatchPoints,
}

impl StartupStub {
    /// Creates a new `StartupStub`.
    ///
    /// # Panics
    ///
    /// Panics if a patch point does not fit in `code`.
    pub fn new(code: &'static [u8], patch: StartupPatchPoints) -> Self {
        let word = core::mem::size_of::<usize>();
        let fits = |offset: usize, size: usize| offset.checked_add(size).is_some_and(|end| end <= code.len());

        assert!(
            fits(patch.idt, DescriptorTablePointer::SIZE)
                && [patch.cr0, patch.cr3, patch.cr4, patch.gdts, patch.stacks, patch.entry]
                    .into_iter()
                    .all(|offset| fits(offset, word)),
            "start-up code patch point out of bounds"
        );

        Self { code, patch }
    }

    /// Size of the start-up code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns `true` if the start-up code is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Returns a copy of the start-up code, with every patch point filled.
    pub fn patched(&self, values: &StartupValues) -> Vec<u8> {
        let mut code = self.code.to_vec();

        let mut put = |offset: usize, bytes: &[u8]| {
            code[offset..offset + bytes.len()].copy_from_slice(bytes);
        };

        put(self.patch.idt, &values.idt.to_bytes());
        put(self.patch.cr0, &values.control.cr0.to_ne_bytes());
        put(self.patch.cr3, &values.control.cr3.to_ne_bytes());
        put(self.patch.cr4, &values.control.cr4.to_ne_bytes());
        put(self.patch.gdts, &values.gdts.to_ne_bytes());
        put(self.patch.stacks, &values.stacks.to_ne_bytes());
        put(self.patch.entry, &values.entry.to_ne_bytes());

        code
    }
}

/// Outcome of the application processors bring-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BringUpReport {
    /// Processors that marked themselves as running.
    pub online: Vec<ProcLocalApicID>,

    /// Processors that did not respond in time.
    pub failed: Vec<ProcLocalApicID>,
}

/// Kernel entry point of the application processors, called by the start-up code once in protected mode.
extern "C" fn application_processor_entry() -> ! {
    if let Some(&(apic, ap_main)) = SYSTEM_APIC.get() {
        apic.enter_application_processor();
        ap_main();
    }

    loop {
        core::hint::spin_loop();
    }
}

impl Apic {
    /// Starts every enabled application processor, one at a time.
    ///
    /// Processors that do not mark themselves as running in time are reported as failed; the remaining ones are
    /// still started.
    pub fn startup_application_processors(&self, stub: &StartupStub) -> Result<BringUpReport, ApicError> {
        if stub.len() > PAGE_SIZE {
            return Err(ApicError::StartupCodeTooLarge(stub.len()));
        }

        let bsp = self.xapic.id();
        let application_processors: Vec<ProcLocalApicID> =
            self.processor_ids().filter(|&id| id != bsp).collect();

        self.set_state(ApicState::ApsBootstrapping);
        self.prepare_startup_code(stub, &application_processors);
        self.prepare_warm_reset();

        let cpu = self.platform.cpu;
        let cmos = Cmos::new(self.platform.ports);

        cpu.disable_interrupts();
        cmos.disable_nmi();

        info!("smp", "CPU [{}] is the bootstrap processor", bsp);

        let mut report = BringUpReport::default();
        for id in application_processors {
            if self.boot_application_processor(id) {
                info!("smp", "CPU [{}] is now online", id);
                report.online.push(id);
            } else {
                report.failed.push(id);
            }
        }

        cmos.enable_nmi();
        cpu.enable_interrupts();

        self.set_state(ApicState::FullyOnline);

        Ok(report)
    }

    /// Allocates the per-processor `GDT` and stack, then copies the patched start-up code to its physical address.
    fn prepare_startup_code(&self, stub: &StartupStub, application_processors: &[ProcLocalApicID]) {
        let gdts: &'static mut [usize; MAX_PROCESSORS] = Box::leak(Box::new([0; MAX_PROCESSORS]));
        let stacks: &'static mut [usize; MAX_PROCESSORS] = Box::leak(Box::new([0; MAX_PROCESSORS]));

        for &id in application_processors {
            let tables = ProcessorDescriptorTables::allocate();
            let stack: &'static mut ApplicationProcessorStack =
                Box::leak(Box::new(ApplicationProcessorStack([0; AP_STACK_SIZE])));

            gdts[id.index()] = tables.gdtr_address();
            stacks[id.index()] = stack.0.as_ptr() as usize + AP_STACK_SIZE;
        }

        let entry: extern "C" fn() -> ! = application_processor_entry;
        let values = StartupValues {
            idt: self.platform.cpu.idt_descriptor(),
            control: self.platform.cpu.control_registers(),
            gdts: gdts.as_ptr() as usize,
            stacks: stacks.as_ptr() as usize,
            entry: entry as usize,
        };

        // The start-up page is reserved by the kernel for that purpose.
        unsafe {
            self.platform
                .memory
                .write_physical(STARTUP_CODE_ADDRESS, &stub.patched(&values));
        }
    }

    /// Programs the _BIOS_ warm-reset vector and the `CMOS` shutdown status, for processors with a discrete _APIC_.
    fn prepare_warm_reset(&self) {
        Cmos::new(self.platform.ports).write(SHUTDOWN_STATUS_REGISTER, SHUTDOWN_WARM_RESET);

        let segment = (STARTUP_CODE_ADDRESS.as_u32() >> 4) as u16;
        let offset = (STARTUP_CODE_ADDRESS.as_u32() & 0xF) as u16;
        let mut vector = [0u8; 4];
        vector[..2].copy_from_slice(&offset.to_le_bytes());
        vector[2..].copy_from_slice(&segment.to_le_bytes());

        // The BIOS data area is not used by the kernel.
        unsafe {
            self.platform.memory.write_physical(WARM_RESET_VECTOR, &vector);
        }
    }

    /// Runs the _INIT-SIPI-SIPI_ sequence on a single processor, and waits for it to mark itself as running.
    fn boot_application_processor(&self, id: ProcLocalApicID) -> bool {
        let timer = self.platform.timer;

        self.xapic.clear_errors();
        self.xapic.send_init_ipi(id, IPILevel::Assert);
        if !self.xapic.try_wait_for_ipi_dispatch(IPI_DISPATCH_POLLS) {
            error!("smp", "CPU [{}] INIT was not dispatched", id);
            return false;
        }

        self.xapic.send_init_ipi(id, IPILevel::DeAssert);
        if !self.xapic.try_wait_for_ipi_dispatch(IPI_DISPATCH_POLLS) {
            error!("smp", "CPU [{}] INIT de-assert was not dispatched", id);
            return false;
        }
        timer.busy_wait(INIT_DEASSERT_DELAY);

        // A single start-up IPI may be lost with an xAPIC.
        for _ in 0..2 {
            self.xapic.clear_errors();
            self.xapic.send_startup_ipi(id, STARTUP_CODE_ADDRESS);
            if !self.xapic.try_wait_for_ipi_dispatch(IPI_DISPATCH_POLLS) {
                error!("smp", "CPU [{}] start-up IPI was not dispatched", id);
                return false;
            }
            timer.busy_wait(STARTUP_DELAY);
        }

        let running = wait_for(timer, AP_BOOT_POLL_INTERVAL, AP_BOOT_POLLS, || {
            self.ap_states.is_running(id)
        });

        if !running {
            error!(
                "smp",
                "CPU [{}] did not mark itself as running, it could be in undefined state", id
            );
        }

        running
    }

    /// Application processor side of the bring-up, called by the processor being started.
    ///
    /// Marks the processor as running, initializes its local _APIC_ and error interrupt, and waits until parallel
    /// computing is allowed.
    ///
    /// # Panics
    ///
    /// Panics if the processor is not listed in the `MADT`.
    pub fn enter_application_processor(&self) {
        let lapic = self.current_local_apic();

        self.ap_states.mark_running(lapic.cpu_id());
        lapic.initialize(&self.xapic);
        self.error_handler.enable_current(&self.xapic);

        while !self.ap_states.is_parallel_computing_allowed() {
            core::hint::spin_loop();
        }
    }

    /// Lets the application processors leave [`Apic::enter_application_processor`].
    pub fn allow_parallel_computing(&self) {
        self.ap_states.allow_parallel_computing();
    }
}
