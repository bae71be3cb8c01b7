//! Simulated hardware used by the unit tests.
//!
//! Every mock records what the driver under test did to it, and exposes knobs to reproduce the hardware behaviors
//! the drivers must cope with (stuck `IPIs`, stalled timer, latched errors, ...).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use spin::Mutex;

use crate::fzboot::log::{format_record, register_sink, LogLevel, LogSink};
use crate::fzboot::time::WaitTimer;
use crate::io::{IOPort, PortIo};
use crate::mem::{MemoryService, PhyAddr32, RegisterBlock};
use crate::x86::apic::local_apic::{InterruptCommandRegisterEntry, LocalAPICRegisterOffset};
use crate::x86::apic::smp::ApplicationProcessorStates;
use crate::x86::apic::DeliveryMode;
use crate::x86::cpu::{ControlRegisters, DescriptorTablePointer, Processor};
use crate::x86::cpuid::CPU_FEAT_APIC;
use crate::x86::msr::IA32_APIC_BASE;

/// Moves a value to the heap for the rest of the test run.
pub(crate) fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

static LOG_RECORDS: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct CaptureSink;

impl LogSink for CaptureSink {
    fn log(&self, level: LogLevel, context: &str, args: fmt::Arguments<'_>) {
        let mut record = String::new();
        if format_record(&mut record, level, context, args).is_ok() {
            LOG_RECORDS.lock().push(record);
        }
    }
}

static CAPTURE_SINK: CaptureSink = CaptureSink;

/// Routes the log macros to an in-memory record list. Can be called by every test.
pub(crate) fn install_log_capture() {
    register_sink(&CAPTURE_SINK);
}

/// Returns `true` if a record identical to `line` was emitted by any test.
pub(crate) fn logged(line: &str) -> bool {
    LOG_RECORDS.lock().iter().any(|record| record == line)
}

/// Simulated I/O port bus.
///
/// Reads return the last byte written to the same port, except for the `PIC` command ports once
/// [`MockPorts::set_in_service`] was called.
#[derive(Default)]
pub(crate) struct MockPorts {
    writes: Mutex<Vec<(IOPort, u8)>>,
    values: Mutex<BTreeMap<IOPort, u8>>,
    in_service: Mutex<Option<(u8, u8)>>,
}

impl MockPorts {
    pub(crate) fn writes(&self) -> Vec<(IOPort, u8)> {
        self.writes.lock().clone()
    }

    /// Writes, without the ones made to the `POST` port by `io_delay`.
    pub(crate) fn writes_without_delays(&self) -> Vec<(IOPort, u8)> {
        self.writes
            .lock()
            .iter()
            .copied()
            .filter(|&(port, _)| port != IOPort::POST)
            .collect()
    }

    pub(crate) fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Last value written to `port`.
    pub(crate) fn value(&self, port: IOPort) -> u8 {
        self.values.lock().get(&port).copied().unwrap_or(0)
    }

    /// Sets the _In-Service Registers_ returned by the master and slave `PIC` command ports.
    pub(crate) fn set_in_service(&self, master: u8, slave: u8) {
        *self.in_service.lock() = Some((master, slave));
    }
}

impl PortIo for MockPorts {
    fn outb(&self, port: IOPort, data: u8) {
        self.writes.lock().push((port, data));
        self.values.lock().insert(port, data);
    }

    fn inb(&self, port: IOPort) -> u8 {
        match (*self.in_service.lock(), u16::from(port)) {
            (Some((master, _)), 0x20) => master,
            (Some((_, slave)), 0xA0) => slave,
            _ => self.value(port),
        }
    }
}

/// Busy-wait service that returns immediately and sums the requested durations.
#[derive(Default)]
pub(crate) struct MockTimer {
    waited: Mutex<Duration>,
}

impl MockTimer {
    pub(crate) fn total_waited(&self) -> Duration {
        *self.waited.lock()
    }
}

impl WaitTimer for MockTimer {
    fn busy_wait(&self, duration: Duration) {
        *self.waited.lock() += duration;
    }
}

/// Ticks consumed by the simulated local timer between two reads of the current count.
const MOCK_TIMER_TICKS: u32 = 10_000;

/// Delivery status bit of the `ICR` low doubleword.
const ICR_SEND_PENDING: u32 = 1 << 12;

/// Simulated local _APIC_ register window.
pub(crate) struct MockLocalApic {
    registers: Mutex<BTreeMap<usize, u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
    ipis: Mutex<Vec<InterruptCommandRegisterEntry>>,
    states: Mutex<Option<&'static ApplicationProcessorStates>>,
    responsive: Mutex<Vec<u8>>,
    latched_errors: Mutex<u32>,
    ipi_stuck: Mutex<bool>,
    stuck_destinations: Mutex<Vec<u8>>,
    timer_stalled: Mutex<bool>,
}

impl MockLocalApic {
    /// Creates the window of the local _APIC_ `cpu`, with 7 _LVT_ entries, all masked.
    pub(crate) fn new(cpu: u8) -> Self {
        let mut registers = BTreeMap::new();
        registers.insert(
            LocalAPICRegisterOffset::ID_REGISTER.get(),
            u32::from(cpu) << 24,
        );
        registers.insert(LocalAPICRegisterOffset::VERSION_REGISTER.get(), 0x0006_0014);
        for lvt in [
            LocalAPICRegisterOffset::CMCI_REGISTER,
            LocalAPICRegisterOffset::TIMER_REGISTER,
            LocalAPICRegisterOffset::THERMAL_MON_REGISTER,
            LocalAPICRegisterOffset::PERF_COUNT_REGISTER,
            LocalAPICRegisterOffset::LINT0_REGISTER,
            LocalAPICRegisterOffset::LINT1_REGISTER,
            LocalAPICRegisterOffset::LVT_ERR_REGISTER,
        ] {
            registers.insert(lvt.get(), 1 << 16);
        }

        Self {
            registers: Mutex::new(registers),
            writes: Mutex::new(Vec::new()),
            ipis: Mutex::new(Vec::new()),
            states: Mutex::new(None),
            responsive: Mutex::new(Vec::new()),
            latched_errors: Mutex::new(0),
            ipi_stuck: Mutex::new(false),
            stuck_destinations: Mutex::new(Vec::new()),
            timer_stalled: Mutex::new(false),
        }
    }

    /// Makes the window answer as the local _APIC_ of another processor.
    pub(crate) fn set_current_cpu(&self, cpu: u8) {
        self.registers
            .lock()
            .insert(LocalAPICRegisterOffset::ID_REGISTER.get(), u32::from(cpu) << 24);
    }

    pub(crate) fn set_max_lvt_entry(&self, max: u8) {
        self.registers.lock().insert(
            LocalAPICRegisterOffset::VERSION_REGISTER.get(),
            0x14 | (u32::from(max) << 16),
        );
    }

    /// Raw content of a register, as last written.
    pub(crate) fn register(&self, offset: usize) -> u32 {
        self.registers.lock().get(&offset).copied().unwrap_or(0)
    }

    pub(crate) fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Every `IPI` sent so far, decoded from the `ICR` writes.
    pub(crate) fn ipis(&self) -> Vec<InterruptCommandRegisterEntry> {
        self.ipis.lock().clone()
    }

    pub(crate) fn clear_ipis(&self) {
        self.ipis.lock().clear();
    }

    /// Running states updated by the simulated application processors.
    pub(crate) fn attach_states(&self, states: &'static ApplicationProcessorStates) {
        *self.states.lock() = Some(states);
    }

    /// Processors that mark themselves as running when they receive a _start-up_ `IPI`.
    pub(crate) fn respond_to_startup(&self, ids: &[u8]) {
        self.responsive.lock().extend_from_slice(ids);
    }

    /// Keeps the `ICR` delivery status pending forever.
    pub(crate) fn set_ipi_stuck(&self, stuck: bool) {
        *self.ipi_stuck.lock() = stuck;
    }

    /// Keeps the `ICR` delivery status pending while it targets one of `ids`.
    pub(crate) fn set_ipi_stuck_for(&self, ids: &[u8]) {
        self.stuck_destinations.lock().extend_from_slice(ids);
    }

    /// Freezes the timer current count at its initial value.
    pub(crate) fn set_timer_stalled(&self, stalled: bool) {
        *self.timer_stalled.lock() = stalled;
    }

    /// Errors detected by the local _APIC_, visible in the `ESR` after its next write.
    pub(crate) fn latch_errors(&self, errors: u32) {
        *self.latched_errors.lock() |= errors;
    }

    fn send_ipi(&self, low: u32) {
        let high = self.register(LocalAPICRegisterOffset::ICR_HIGH.get());
        let ipi = InterruptCommandRegisterEntry::from((u64::from(high) << 32) | u64::from(low));
        self.ipis.lock().push(ipi);

        if ipi.delivery_mode() != DeliveryMode::StartUp {
            return;
        }

        if self.responsive.lock().contains(&ipi.destination()) {
            if let Some(states) = *self.states.lock() {
                states.mark_running(ipi.destination().into());
            }
        }
    }
}

impl RegisterBlock for MockLocalApic {
    fn read(&self, offset: usize) -> u32 {
        let value = self.register(offset);

        if offset == LocalAPICRegisterOffset::ICR_LOW.get() {
            let destination = (self.register(LocalAPICRegisterOffset::ICR_HIGH.get()) >> 24) as u8;
            if *self.ipi_stuck.lock() || self.stuck_destinations.lock().contains(&destination) {
                value | ICR_SEND_PENDING
            } else {
                value & !ICR_SEND_PENDING
            }
        } else if offset == LocalAPICRegisterOffset::TIMER_CURRENT_COUNT.get() {
            let initial = self.register(LocalAPICRegisterOffset::TIMER_INITIAL_COUNT.get());
            if *self.timer_stalled.lock() {
                initial
            } else {
                initial.saturating_sub(MOCK_TIMER_TICKS)
            }
        } else {
            value
        }
    }

    fn write(&self, offset: usize, value: u32) {
        self.writes.lock().push((offset, value));

        if offset == LocalAPICRegisterOffset::ERROR_REGISTER.get() {
            let errors = core::mem::take(&mut *self.latched_errors.lock());
            self.registers.lock().insert(offset, errors);
            return;
        }

        self.registers.lock().insert(offset, value);

        if offset == LocalAPICRegisterOffset::ICR_LOW.get() {
            self.send_ipi(value);
        }
    }
}

/// Simulated _I/O APIC_ register window (`IOREGSEL` at `0x00`, `IOWIN` at `0x10`).
pub(crate) struct MockIoApic {
    select: Mutex<u32>,
    registers: Mutex<BTreeMap<u32, u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
    version: u32,
}

impl MockIoApic {
    /// Creates an _I/O APIC_ with `max_entry + 1` redirection entries.
    pub(crate) fn new(max_entry: u8) -> Self {
        Self {
            select: Mutex::new(0),
            registers: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            version: 0x11 | (u32::from(max_entry) << 16),
        }
    }

    /// Content of the indirect register `index`.
    pub(crate) fn register(&self, index: u32) -> u32 {
        if index == 1 {
            return self.version;
        }

        self.registers.lock().get(&index).copied().unwrap_or(0)
    }

    pub(crate) fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.writes.lock().clear();
    }
}

impl RegisterBlock for MockIoApic {
    fn read(&self, offset: usize) -> u32 {
        match offset {
            0x00 => *self.select.lock(),
            0x10 => self.register(*self.select.lock()),
            _ => 0,
        }
    }

    fn write(&self, offset: usize, value: u32) {
        self.writes.lock().push((offset, value));

        match offset {
            0x00 => *self.select.lock() = value,
            0x10 => {
                let index = *self.select.lock();
                if index != 1 {
                    self.registers.lock().insert(index, value);
                }
            }
            _ => {}
        }
    }
}

/// Simulated processor: `CPUID`, `IA32_APIC_BASE` and the interrupt flag.
pub(crate) struct MockProcessor {
    xapic_supported: Mutex<bool>,
    msrs: Mutex<BTreeMap<u32, u64>>,
    interrupt_log: Mutex<Vec<bool>>,
}

impl MockProcessor {
    /// Bootstrap processor with an enabled _xAPIC_ at the architectural address.
    pub(crate) fn bootstrap() -> Self {
        let mut msrs = BTreeMap::new();
        msrs.insert(IA32_APIC_BASE, 0xFEE0_0900);

        Self {
            xapic_supported: Mutex::new(true),
            msrs: Mutex::new(msrs),
            interrupt_log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_xapic_supported(&self, supported: bool) {
        *self.xapic_supported.lock() = supported;
    }

    /// Sets or clears the `BSP` flag of `IA32_APIC_BASE`.
    pub(crate) fn set_bootstrap(&self, bootstrap: bool) {
        let mut msrs = self.msrs.lock();
        let base = msrs.entry(IA32_APIC_BASE).or_insert(0);
        if bootstrap {
            *base |= 1 << 8;
        } else {
            *base &= !(1 << 8);
        }
    }

    /// Interrupt flag updates, `false` for `CLI` and `true` for `STI`.
    pub(crate) fn interrupt_log(&self) -> Vec<bool> {
        self.interrupt_log.lock().clone()
    }

    pub(crate) fn clear_interrupt_log(&self) {
        self.interrupt_log.lock().clear();
    }
}

impl Processor for MockProcessor {
    fn cpu_feature_support(&self, feature: (u8, u32)) -> bool {
        feature == CPU_FEAT_APIC && *self.xapic_supported.lock()
    }

    fn read_msr(&self, msr: u32) -> u64 {
        self.msrs.lock().get(&msr).copied().unwrap_or(0)
    }

    unsafe fn write_msr(&self, msr: u32, value: u64) {
        self.msrs.lock().insert(msr, value);
    }

    fn disable_interrupts(&self) {
        self.interrupt_log.lock().push(false);
    }

    fn enable_interrupts(&self) {
        self.interrupt_log.lock().push(true);
    }

    fn control_registers(&self) -> ControlRegisters {
        ControlRegisters {
            cr0: 0x8000_0011,
            cr3: 0x0010_0000,
            cr4: 0x0000_0020,
        }
    }

    fn idt_descriptor(&self) -> DescriptorTablePointer {
        DescriptorTablePointer {
            limit: 0x07FF,
            base: 0x0012_3000,
        }
    }
}

/// Simulated memory service, with a fixed set of mappable register windows.
#[derive(Default)]
pub(crate) struct MockMemory {
    windows: Mutex<Vec<(PhyAddr32, &'static dyn RegisterBlock)>>,
    physical_writes: Mutex<Vec<(PhyAddr32, Vec<u8>)>>,
}

impl MockMemory {
    /// Makes `window` the result of mapping `address`.
    pub(crate) fn add_window(&self, address: PhyAddr32, window: &'static dyn RegisterBlock) {
        self.windows.lock().push((address, window));
    }

    pub(crate) fn physical_writes(&self) -> Vec<(PhyAddr32, Vec<u8>)> {
        self.physical_writes.lock().clone()
    }
}

impl MemoryService for MockMemory {
    fn map_io(
        &self,
        address: PhyAddr32,
        _size: usize,
        _cacheable: bool,
    ) -> Option<&'static dyn RegisterBlock> {
        self.windows
            .lock()
            .iter()
            .find(|(base, _)| *base == address)
            .map(|&(_, window)| window)
    }

    unsafe fn write_physical(&self, address: PhyAddr32, data: &[u8]) {
        self.physical_writes.lock().push((address, data.to_vec()));
    }
}
