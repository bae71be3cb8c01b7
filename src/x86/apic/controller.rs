//! System-wide _APIC_ controller.
//!
//! [`Apic`] is built once by the bootstrap processor, from the `MADT`. It owns the per-processor [`LocalApic`]
//! configurations, the single supported [`IoApic`], the error handler and the per-processor timers.
//!
//! ```plaintext
//! NotPresent -> Detected -> BspInitialized -> ApsBootstrapping -> FullyOnline
//! ```

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use crate::errors::ApicError;
use crate::fzboot::irq::vector::{GlobalSystemInterrupt, InterruptRequest, InterruptVector};
use crate::fzboot::time::WaitTimer;
use crate::io::acpi::madt::MadtInfo;
use crate::io::pic::Pic;
use crate::io::{switch_imcr_to_apic, switch_imcr_to_pic, PortIo};
use crate::mem::{MemoryService, PAGE_SIZE};
use crate::x86::apic::error::LocalApicErrorHandler;
use crate::x86::apic::io_apic::IoApic;
use crate::x86::apic::local_apic::{
    LocalAPICErrorRegister, LocalApic, LocalInterrupt, LocalNmiSource, LocalVectorTableEntry, ProcLocalApicID,
    XApic,
};
use crate::x86::apic::smp::ApplicationProcessorStates;
use crate::x86::apic::timer::{ApicTimer, DEFAULT_TICK_INTERVAL, DEFAULT_YIELD_INTERVAL};
use crate::x86::apic::DeliveryMode;
use crate::x86::cpu::Processor;
use crate::{error, info, warn};

/// Hardware access services used by the interrupt controllers.
#[derive(Clone, Copy)]
pub struct Platform {
    /// Processor executing the calls.
    pub cpu: &'static dyn Processor,

    /// Port I/O.
    pub ports: &'static dyn PortIo,

    /// Register window mapping and physical memory writes.
    pub memory: &'static dyn MemoryService,

    /// Busy waits.
    pub timer: &'static dyn WaitTimer,
}

/// Bring-up progress of the _APIC_ subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApicState {
    /// No _APIC_ is in use.
    NotPresent,

    /// The local and _I/O APICs_ were built from the `MADT`.
    Detected,

    /// The bootstrap processor local _APIC_ and the _I/O APIC_ are programmed, the timer is running.
    BspInitialized,

    /// Application processors are being started.
    ApsBootstrapping,

    /// Every application processor was attempted.
    FullyOnline,
}

/// System-wide _APIC_ controller.
pub struct Apic {
    pub(super) platform: Platform,
    pub(super) xapic: XApic,
    pub(super) local_apics: BTreeMap<ProcLocalApicID, LocalApic>,
    pub(super) timers: Mutex<HashMap<ProcLocalApicID, &'static ApicTimer>>,
    pub(super) ticks_per_millisecond: u32,
    pub(super) io_apic: IoApic,
    pub(super) error_handler: LocalApicErrorHandler,
    pub(super) ap_states: &'static ApplicationProcessorStates,
    pub(super) bsp_id: ProcLocalApicID,
    pub(super) state: Mutex<ApicState>,
}

impl Apic {
    /// Checks if the _APIC_ backend can be used: the processor has an on-chip _xAPIC_, and `ACPI` provides a `MADT`.
    pub fn is_available(cpu: &dyn Processor, madt: Option<&MadtInfo>) -> bool {
        XApic::supports_xapic(cpu) && madt.is_some()
    }

    /// Builds the _APIC_ controller, switches the platform to _xAPIC_ mode, and initializes the bootstrap processor
    /// local _APIC_, the _I/O APIC_, the error interrupt and the local timer.
    ///
    /// Must be called by the bootstrap processor. The legacy `PIC` stays connected until the local _APIC_ passed its
    /// self-test, and is restored if the timer calibration fails afterwards, so every error leaves `legacy` as a
    /// usable interrupt controller.
    pub fn initialize(
        platform: Platform,
        madt: &MadtInfo,
        legacy: &Pic,
        ap_states: &'static ApplicationProcessorStates,
    ) -> Result<Self, ApicError> {
        if !Self::is_available(platform.cpu, Some(madt)) {
            return Err(ApicError::NotAvailable);
        }

        let base = XApic::read_base_msr(platform.cpu).ok_or(ApicError::NotAvailable)?;
        if !base.bootstrap_processor() {
            return Err(ApicError::NotBootstrapProcessor);
        }

        let local_apics = Self::local_apics_from_madt(madt);
        if local_apics.is_empty() {
            return Err(ApicError::NoLocalApic);
        }

        let io_apic_entry = match madt.io_apics.as_slice() {
            [] => return Err(ApicError::NoIoApic),
            [entry] => entry,
            entries => return Err(ApicError::UnsupportedIoApicCount(entries.len())),
        };

        let io_apic_window = platform
            .memory
            .map_io(io_apic_entry.address(), PAGE_SIZE, false)
            .ok_or(ApicError::MappingFailed)?;
        let mut io_apic = IoApic::new(
            io_apic_entry,
            io_apic_window,
            madt.overrides.clone(),
            madt.nmi_sources.clone(),
        );

        let xapic = Self::enable_xapic(platform, madt)?;

        let bsp_id = xapic.id();
        let Some(bsp) = local_apics.get(&bsp_id) else {
            error!("apic", "current CPU [{}] is not listed in the MADT", bsp_id);
            return Err(ApicError::SelfTestFailed);
        };

        Self::route_through_apic(platform, legacy);

        info!(
            "apic",
            "detected {} local APIC(s), I/O APIC [{}]",
            local_apics.len(),
            io_apic.id()
        );

        bsp.initialize(&xapic);
        io_apic.initialize(bsp_id);

        let error_handler = LocalApicErrorHandler::new();
        error_handler.enable_current(&xapic);

        let ticks_per_millisecond = match ApicTimer::calibrate(&xapic, platform.timer) {
            Ok(ticks) => ticks,
            Err(err) => {
                Self::restore_legacy_routing(platform, &xapic, legacy);
                return Err(err);
            }
        };

        let apic = Self {
            platform,
            xapic,
            local_apics,
            timers: Mutex::new(HashMap::new()),
            ticks_per_millisecond,
            io_apic,
            error_handler,
            ap_states,
            bsp_id,
            state: Mutex::new(ApicState::Detected),
        };

        apic.start_current_timer();
        apic.set_state(ApicState::BspInitialized);

        info!(
            "apic",
            "CPU [{}] initialized, timer runs at {} ticks/ms",
            bsp_id,
            ticks_per_millisecond
        );

        Ok(apic)
    }

    /// Builds the per-processor configuration of every enabled processor listed in the `MADT`.
    fn local_apics_from_madt(madt: &MadtInfo) -> BTreeMap<ProcLocalApicID, LocalApic> {
        let mut local_apics = BTreeMap::new();

        for processor in madt.processors.iter().filter(|proc| proc.is_enabled()) {
            let uid = processor.acpi_processor_id();
            let nmi_sources: Vec<LocalNmiSource> = madt
                .local_nmis
                .iter()
                .filter(|nmi| nmi.applies_to(uid))
                .filter_map(|nmi| {
                    let pin = match nmi.lint() {
                        0 => LocalInterrupt::Lint0,
                        1 => LocalInterrupt::Lint1,
                        lint => {
                            warn!("apic", "ignoring NMI on invalid local pin LINT{}", lint);
                            return None;
                        }
                    };

                    Some(LocalNmiSource {
                        pin,
                        polarity: nmi.flags().polarity(),
                        trigger_mode: nmi.flags().trigger_mode(),
                    })
                })
                .collect();

            let id = ProcLocalApicID::from(processor.apic_id());
            local_apics.insert(id, LocalApic::new(id, uid, nmi_sources));
        }

        local_apics
    }

    /// Maps the local _APIC_ window and globally enables the local _APIC_.
    ///
    /// Interrupts still reach the processor through the legacy `PIC` until [`Self::route_through_apic`] is called.
    fn enable_xapic(platform: Platform, madt: &MadtInfo) -> Result<XApic, ApicError> {
        let window = platform
            .memory
            .map_io(madt.local_apic_address, PAGE_SIZE, false)
            .ok_or(ApicError::MappingFailed)?;

        let base = XApic::read_base_msr(platform.cpu).ok_or(ApicError::NotAvailable)?;
        let enabled = base
            .with_xapic_global_enable(true)
            .with_x2apic_enable(false)
            .with_base_address(madt.local_apic_address);

        // The window was mapped at the address the MSR now points to.
        unsafe { XApic::write_base_msr(platform.cpu, enabled) };

        info!("apic", "xAPIC enabled at {}", madt.local_apic_address);

        Ok(XApic::new(window))
    }

    /// Masks the legacy `PIC` and routes interrupts away from it.
    fn route_through_apic(platform: Platform, legacy: &Pic) {
        legacy.forbid_all();
        switch_imcr_to_apic(platform.ports);
    }

    /// Reconnects the legacy `PIC` after a failed switch to _xAPIC_ mode.
    ///
    /// `LINT0` is set up as a virtual wire, for chipsets without an `IMCR`.
    fn restore_legacy_routing(platform: Platform, xapic: &XApic, legacy: &Pic) {
        xapic.forbid(LocalInterrupt::Error);
        xapic.forbid(LocalInterrupt::Timer);
        xapic.write_lvt(
            LocalInterrupt::Lint0,
            LocalVectorTableEntry::new()
                .with_vector(InterruptVector::NONE)
                .with_delivery_mode(DeliveryMode::ExternalInterrupt)
                .with_masked(false),
        );

        switch_imcr_to_pic(platform.ports);
        legacy.initialize();

        warn!("apic", "xAPIC mode aborted, interrupts routed through the PIC again");
    }

    pub(super) fn set_state(&self, state: ApicState) {
        *self.state.lock() = state;
    }

    /// Current bring-up progress.
    pub fn state(&self) -> ApicState {
        *self.state.lock()
    }

    /// System-wide access to the local _APIC_ registers.
    pub fn xapic(&self) -> &XApic {
        &self.xapic
    }

    /// The _I/O APIC_.
    pub fn io_apic(&self) -> &IoApic {
        &self.io_apic
    }

    /// Local _APIC_ ID of the bootstrap processor.
    pub fn bootstrap_processor_id(&self) -> ProcLocalApicID {
        self.bsp_id
    }

    /// Returns `true` if more than one processor is enabled.
    pub fn is_symmetric_multiprocessing_supported(&self) -> bool {
        self.local_apics.len() > 1
    }

    /// Number of enabled processors.
    pub fn core_count(&self) -> usize {
        self.local_apics.len()
    }

    /// Local _APIC_ IDs of every enabled processor, in ascending order.
    pub fn processor_ids(&self) -> impl Iterator<Item = ProcLocalApicID> + '_ {
        self.local_apics.keys().copied()
    }

    /// Returns the configuration of the processor executing the call.
    ///
    /// # Panics
    ///
    /// Panics if the processor is not listed in the `MADT`.
    pub fn current_local_apic(&self) -> &LocalApic {
        let id = self.xapic.id();

        match self.local_apics.get(&id) {
            Some(lapic) => lapic,
            None => panic!("no local APIC for CPU [{id}]"),
        }
    }

    /// Unmasks a legacy interrupt request, on the interrupt it is wired to.
    ///
    /// # Panics
    ///
    /// Panics if the request is wired to `NMI`, or to an interrupt not handled by the _I/O APIC_.
    pub fn allow(&self, request: InterruptRequest) {
        self.io_apic.allow(self.io_apic.irq_override(request));
    }

    /// Masks a legacy interrupt request, on the interrupt it is wired to.
    ///
    /// # Panics
    ///
    /// Panics if the request is wired to `NMI`, or to an interrupt not handled by the _I/O APIC_.
    pub fn forbid(&self, request: InterruptRequest) {
        self.io_apic.forbid(self.io_apic.irq_override(request));
    }

    /// Returns `true` if the interrupt a legacy request is wired to is unmasked.
    ///
    /// # Panics
    ///
    /// Panics if the request is wired to an interrupt not handled by the _I/O APIC_.
    pub fn status(&self, request: InterruptRequest) -> bool {
        self.io_apic.status(self.io_apic.irq_override(request))
    }

    /// Returns the interrupt a legacy request is wired to.
    pub fn irq_override(&self, request: InterruptRequest) -> GlobalSystemInterrupt {
        self.io_apic.irq_override(request)
    }

    /// Returns the legacy request delivered through an interrupt, if any.
    pub fn irq_source(&self, gsi: GlobalSystemInterrupt) -> Option<InterruptRequest> {
        self.io_apic.irq_source(gsi)
    }

    /// Highest interrupt that can be routed to a processor.
    pub fn max_interrupt_target(&self) -> GlobalSystemInterrupt {
        self.io_apic.gsi_max()
    }

    /// Returns `true` if the vector is raised by a local _APIC_ source.
    pub fn is_local_interrupt(&self, vector: InterruptVector) -> bool {
        vector.is_local_apic()
    }

    /// Returns `true` if the vector is raised by an _I/O APIC_ input.
    pub fn is_external_interrupt(&self, vector: InterruptVector) -> bool {
        GlobalSystemInterrupt::from_vector(vector).is_some_and(|gsi| self.io_apic.handles(gsi))
    }

    /// Acknowledges an interrupt on the local _APIC_ of the current processor.
    ///
    /// External interrupts only need a local `EOI`, which the local _APIC_ broadcasts to the _I/O APIC_ for
    /// level-triggered inputs. Other vectors (exceptions, spurious) are not acknowledged, and neither are local pins
    /// delivered as `NMI`.
    pub fn send_end_of_interrupt(&self, vector: InterruptVector) {
        if self.delivers_nmi(vector) {
            return;
        }

        if self.is_local_interrupt(vector) || self.is_external_interrupt(vector) {
            self.xapic.send_end_of_interrupt();
        }
    }

    /// Returns `true` if the local source of `vector` is programmed to deliver an `NMI`.
    fn delivers_nmi(&self, vector: InterruptVector) -> bool {
        LocalInterrupt::from_vector(vector).is_some_and(|source| {
            self.xapic.read_lvt(source).delivery_mode() == DeliveryMode::NonMaskableInterrupt
        })
    }

    /// Returns `true` if the vector is the spurious interrupt vector.
    pub fn is_spurious(&self, vector: InterruptVector) -> bool {
        vector == InterruptVector::SPURIOUS
    }

    /// Handles an error interrupt on the current processor.
    pub fn handle_error(&self) -> LocalAPICErrorRegister {
        self.error_handler.handle(&self.xapic)
    }

    /// Creates and starts the timer of the current processor, with the calibration done by the bootstrap
    /// processor.
    pub fn start_current_timer(&self) -> &'static ApicTimer {
        let id = self.xapic.id();
        let mut timers = self.timers.lock();

        if let Some(timer) = timers.get(&id) {
            return timer;
        }

        let timer: &'static ApicTimer = alloc::boxed::Box::leak(alloc::boxed::Box::new(ApicTimer::new(
            id,
            self.ticks_per_millisecond,
            DEFAULT_TICK_INTERVAL,
            DEFAULT_YIELD_INTERVAL,
        )));
        timer.start(&self.xapic);
        timers.insert(id, timer);

        timer
    }

    /// Returns the timer of the current processor, if it was started.
    pub fn current_timer(&self) -> Option<&'static ApicTimer> {
        self.timers.lock().get(&self.xapic.id()).copied()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::acpi::madt::{
        InterruptSourceOverride, IoApicEntry, LocalApicNmi, MpsIntiFlags, NmiSource, ProcessorLocalApic,
    };
    use crate::mem::PhyAddr32;
    use crate::fzboot::irq::service::InterruptService;
    use crate::testing::{
        install_log_capture, leak, logged, MockIoApic, MockLocalApic, MockMemory, MockPorts, MockProcessor, MockTimer,
    };
    use crate::x86::apic::{PinPolarity, TriggerMode};

    pub(crate) const LAPIC_ADDRESS: PhyAddr32 = PhyAddr32::new(0xFEE0_0000);
    pub(crate) const IOAPIC_ADDRESS: PhyAddr32 = PhyAddr32::new(0xFEC0_0000);

    /// Simulated machine the controller is built on.
    pub(crate) struct TestMachine {
        pub(crate) platform: Platform,
        pub(crate) cpu: &'static MockProcessor,
        pub(crate) ports: &'static MockPorts,
        pub(crate) memory: &'static MockMemory,
        pub(crate) lapic: &'static MockLocalApic,
        pub(crate) ioapic: &'static MockIoApic,
        pub(crate) states: &'static ApplicationProcessorStates,
        pub(crate) pic: &'static Pic,
    }

    impl TestMachine {
        pub(crate) fn new() -> Self {
            let cpu = leak(MockProcessor::bootstrap());
            let ports = leak(MockPorts::default());
            let lapic = leak(MockLocalApic::new(0));
            let ioapic = leak(MockIoApic::new(23));
            let memory = leak(MockMemory::default());
            memory.add_window(LAPIC_ADDRESS, lapic);
            memory.add_window(IOAPIC_ADDRESS, ioapic);

            let states = leak(ApplicationProcessorStates::new());
            lapic.attach_states(states);

            let pic = leak(Pic::new(ports));
            pic.initialize();

            Self {
                platform: Platform {
                    cpu,
                    ports,
                    memory,
                    timer: leak(MockTimer::default()),
                },
                cpu,
                ports,
                memory,
                lapic,
                ioapic,
                states,
                pic,
            }
        }

        pub(crate) fn apic(&self, madt: &MadtInfo) -> Result<Apic, ApicError> {
            Apic::initialize(self.platform, madt, self.pic, self.states)
        }
    }

    pub(crate) fn madt(cores: u8) -> MadtInfo {
        MadtInfo {
            local_apic_address: LAPIC_ADDRESS,
            processors: (0..cores)
                .map(|id| ProcessorLocalApic::new(id, id, true))
                .collect(),
            io_apics: alloc::vec![IoApicEntry::new(
                cores,
                IOAPIC_ADDRESS,
                GlobalSystemInterrupt::new(0)
            )],
            overrides: alloc::vec![InterruptSourceOverride::new(
                InterruptRequest::Pit,
                GlobalSystemInterrupt::new(2),
                MpsIntiFlags::new(0),
            )],
            ..MadtInfo::default()
        }
    }

    #[test]
    fn availability_requires_xapic_and_madt() {
        let machine = TestMachine::new();

        assert!(Apic::is_available(machine.cpu, Some(&madt(1))));
        assert!(!Apic::is_available(machine.cpu, None));

        machine.cpu.set_xapic_supported(false);
        assert!(!Apic::is_available(machine.cpu, Some(&madt(1))));
        assert_eq!(machine.apic(&madt(1)).err(), Some(ApicError::NotAvailable));
    }

    #[test]
    fn only_bootstrap_processor_initializes() {
        let machine = TestMachine::new();
        machine.cpu.set_bootstrap(false);

        assert_eq!(
            machine.apic(&madt(1)).err(),
            Some(ApicError::NotBootstrapProcessor)
        );
    }

    #[test]
    fn detection_failures() {
        let machine = TestMachine::new();

        let mut no_core = madt(2);
        no_core.processors = alloc::vec![ProcessorLocalApic::new(0, 0, false)];
        assert_eq!(machine.apic(&no_core).err(), Some(ApicError::NoLocalApic));

        let mut no_io = madt(1);
        no_io.io_apics.clear();
        assert_eq!(machine.apic(&no_io).err(), Some(ApicError::NoIoApic));

        let mut two_io = madt(1);
        two_io.io_apics.push(two_io.io_apics[0]);
        assert_eq!(
            machine.apic(&two_io).err(),
            Some(ApicError::UnsupportedIoApicCount(2))
        );

        let mut unmapped = madt(1);
        unmapped.io_apics = alloc::vec![IoApicEntry::new(
            1,
            PhyAddr32::new(0xFEC1_0000),
            GlobalSystemInterrupt::new(0)
        )];
        assert_eq!(machine.apic(&unmapped).err(), Some(ApicError::MappingFailed));
    }

    #[test]
    fn self_test_requires_current_core_in_madt() {
        let machine = TestMachine::new();
        machine.lapic.set_current_cpu(9);

        assert_eq!(machine.apic(&madt(2)).err(), Some(ApicError::SelfTestFailed));
    }

    #[test]
    fn failed_self_test_keeps_pic_connected() {
        let machine = TestMachine::new();
        machine.lapic.set_current_cpu(9);
        machine.ports.clear_writes();

        assert_eq!(machine.apic(&madt(2)).err(), Some(ApicError::SelfTestFailed));
        assert!(machine
            .ports
            .writes()
            .iter()
            .all(|&(port, _)| port != crate::io::IOPort::IMCR_DATA));
        assert!(machine.pic.status(InterruptRequest::Cascade));

        let service = InterruptService::select(machine.pic, Err(ApicError::SelfTestFailed));
        service.allow(InterruptRequest::Keyboard);

        assert!(!service.uses_apic());
        assert!(service.status(InterruptRequest::Keyboard));
    }

    #[test]
    fn failed_calibration_restores_pic_routing() {
        install_log_capture();
        let machine = TestMachine::new();
        machine.lapic.set_timer_stalled(true);

        assert_eq!(machine.apic(&madt(2)).err(), Some(ApicError::Calibration));

        assert_eq!(machine.ports.value(crate::io::IOPort::IMCR_DATA), 0x00);
        assert!(machine.pic.status(InterruptRequest::Cascade));
        assert!(!machine.pic.status(InterruptRequest::Keyboard));

        let lint0 = LocalVectorTableEntry::from(
            machine.lapic.register(LocalInterrupt::Lint0.register().get()),
        );
        assert_eq!(lint0.delivery_mode(), DeliveryMode::ExternalInterrupt);
        assert!(!lint0.masked());
        assert!(logged("[warn] apic : xAPIC mode aborted, interrupts routed through the PIC again"));
    }

    #[test]
    fn disabled_processors_are_excluded() {
        let machine = TestMachine::new();
        let mut table = madt(3);
        table.processors[1] = ProcessorLocalApic::new(1, 1, false);

        let apic = machine.apic(&table).unwrap();

        assert_eq!(apic.core_count(), 2);
        assert_eq!(
            apic.processor_ids().collect::<Vec<_>>(),
            [ProcLocalApicID::from(0), ProcLocalApicID::from(2)]
        );
    }

    #[test]
    fn initialization_switches_platform_to_xapic() {
        let machine = TestMachine::new();

        let apic = machine.apic(&madt(4)).unwrap();

        assert_eq!(apic.state(), ApicState::BspInitialized);
        assert!(apic.is_symmetric_multiprocessing_supported());
        assert_eq!(apic.bootstrap_processor_id(), ProcLocalApicID::from(0));

        let msr = XApic::read_base_msr(machine.cpu).unwrap();
        assert!(msr.xapic_global_enable());
        assert!(!msr.x2apic_enable());
        assert_eq!(msr.base_address(), LAPIC_ADDRESS);

        assert_eq!(machine.ports.value(crate::io::IOPort::IMCR_DATA), 0x01);
        for request in InterruptRequest::ALL {
            assert!(!machine.pic.status(request));
        }

        assert!(apic.xapic().read_svr().soft_enable());
        assert!(apic.xapic().status(LocalInterrupt::Error));
        assert!(apic.xapic().status(LocalInterrupt::Timer));
        assert!(apic.current_timer().is_some());
        assert_eq!(apic.current_timer().unwrap().ticks_per_millisecond(), 1000);
    }

    #[test]
    fn io_apic_entries_masked_after_initialization() {
        let machine = TestMachine::new();
        let apic = machine.apic(&madt(1)).unwrap();

        assert_eq!(apic.max_interrupt_target(), GlobalSystemInterrupt::new(23));
        for raw in 0..=23 {
            assert!(apic
                .io_apic()
                .read_redirection_entry(GlobalSystemInterrupt::new(raw))
                .masked());
        }
    }

    #[test]
    fn requests_follow_overrides() {
        let machine = TestMachine::new();
        let apic = machine.apic(&madt(1)).unwrap();

        assert_eq!(
            apic.irq_override(InterruptRequest::Pit),
            GlobalSystemInterrupt::new(2)
        );
        assert_eq!(
            apic.irq_override(InterruptRequest::Rtc),
            GlobalSystemInterrupt::new(8)
        );
        assert_eq!(
            apic.irq_source(GlobalSystemInterrupt::new(2)),
            Some(InterruptRequest::Pit)
        );

        apic.allow(InterruptRequest::Pit);
        assert!(!apic
            .io_apic()
            .read_redirection_entry(GlobalSystemInterrupt::new(2))
            .masked());
        assert!(apic
            .io_apic()
            .read_redirection_entry(GlobalSystemInterrupt::new(0))
            .masked());
    }

    #[test]
    fn every_request_can_be_toggled() {
        let machine = TestMachine::new();
        let apic = machine.apic(&madt(1)).unwrap();

        for request in InterruptRequest::ALL {
            apic.allow(request);
            assert!(apic.status(request), "{request} should be allowed");
            apic.forbid(request);
            assert!(!apic.status(request), "{request} should be forbidden");
        }
    }

    #[test]
    #[should_panic]
    fn request_wired_to_nmi_cannot_be_masked() {
        let machine = TestMachine::new();
        let mut table = madt(1);
        table.nmi_sources = alloc::vec![NmiSource::new(
            GlobalSystemInterrupt::new(9),
            MpsIntiFlags::new(0)
        )];
        let apic = machine.apic(&table).unwrap();

        apic.forbid(InterruptRequest::Free1);
    }

    #[test]
    fn local_nmi_entries_configure_lint_pins() {
        let machine = TestMachine::new();
        let mut table = madt(2);
        table.local_nmis = alloc::vec![LocalApicNmi::new(0xFF, 0, MpsIntiFlags::new(0b1111))];
        let apic = machine.apic(&table).unwrap();

        let lint0 = apic.xapic().read_lvt(LocalInterrupt::Lint0);
        assert_eq!(lint0.delivery_mode(), DeliveryMode::NonMaskableInterrupt);
        assert_eq!(lint0.pin_polarity(), PinPolarity::ActiveLow);
        assert_eq!(lint0.trigger_mode(), TriggerMode::Level);
        assert!(!lint0.masked());
        assert!(!apic.xapic().status(LocalInterrupt::Lint1));
        assert_eq!(apic.current_local_apic().nmi_sources().len(), 1);
    }

    #[test]
    fn end_of_interrupt_for_local_and_external_vectors() {
        install_log_capture();
        let machine = TestMachine::new();
        let apic = machine.apic(&madt(1)).unwrap();
        let eoi = crate::x86::apic::local_apic::LocalAPICRegisterOffset::EOI_REGISTER.get();

        machine.lapic.clear_writes();
        apic.send_end_of_interrupt(InterruptVector::TIMER);
        apic.send_end_of_interrupt(InterruptVector::from(0x21));
        apic.send_end_of_interrupt(InterruptVector::from(0x37));
        assert_eq!(
            machine.lapic.writes(),
            [(eoi, 0), (eoi, 0), (eoi, 0)]
        );

        machine.lapic.clear_writes();
        apic.send_end_of_interrupt(InterruptVector::SPURIOUS);
        apic.send_end_of_interrupt(InterruptVector::from(0x38));
        apic.send_end_of_interrupt(InterruptVector::from(0x0E));
        assert!(machine.lapic.writes().is_empty());
    }

    #[test]
    fn nmi_pins_are_not_acknowledged() {
        let machine = TestMachine::new();
        let mut table = madt(1);
        table.local_nmis = alloc::vec![LocalApicNmi::new(0xFF, 1, MpsIntiFlags::new(0))];
        let apic = machine.apic(&table).unwrap();
        let eoi = crate::x86::apic::local_apic::LocalAPICRegisterOffset::EOI_REGISTER.get();

        machine.lapic.clear_writes();
        apic.send_end_of_interrupt(InterruptVector::LINT1);
        assert!(machine.lapic.writes().is_empty());

        apic.send_end_of_interrupt(InterruptVector::LINT0);
        apic.send_end_of_interrupt(InterruptVector::TIMER);
        assert_eq!(machine.lapic.writes(), [(eoi, 0), (eoi, 0)]);
    }

    #[test]
    fn spurious_vector_detection() {
        let machine = TestMachine::new();
        let apic = machine.apic(&madt(1)).unwrap();

        assert!(apic.is_spurious(InterruptVector::SPURIOUS));
        assert!(!apic.is_spurious(InterruptVector::ERROR));
        assert!(apic.is_local_interrupt(InterruptVector::ERROR));
        assert!(apic.is_external_interrupt(InterruptVector::from(0x20)));
        assert!(!apic.is_external_interrupt(InterruptVector::from(0x1F)));
    }
}
