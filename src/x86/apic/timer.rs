//! Local _APIC_ timer.
//!
//! Each processor owns a timer inside its local _APIC_, clocked by the bus (or core crystal) frequency. That
//! frequency is unknown, so the timer is first calibrated against the kernel [`WaitTimer`], then programmed in
//! periodic mode to raise [`InterruptVector::TIMER`] every `tick_interval`.
//!
//! The timer keeps a millisecond timestamp, and signals when the current thread should yield the processor.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use crate::errors::ApicError;
use crate::fzboot::irq::vector::InterruptVector;
use crate::fzboot::time::WaitTimer;
use crate::x86::apic::local_apic::{
    LVTTimerMode, LocalInterrupt, LocalVectorTableEntry, ProcLocalApicID, TimerDivide, XApic,
};
use crate::x86::apic::DeliveryMode;

/// Default interval between two timer interrupts.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Default interval between two scheduler yields.
pub const DEFAULT_YIELD_INTERVAL: Duration = Duration::from_millis(10);

/// Length of the calibration countdown.
pub const CALIBRATION_WINDOW: Duration = Duration::from_millis(10);

/// Divider used both for calibration and operation.
const TIMER_DIVIDE: TimerDivide = TimerDivide::By16;

/// Periodic local _APIC_ timer of a single processor.
#[derive(Debug)]
pub struct ApicTimer {
    cpu_id: ProcLocalApicID,
    ticks_per_millisecond: u32,
    tick_interval: Duration,
    yield_interval: Duration,
    elapsed_millis: AtomicU64,
    last_yield_millis: AtomicU64,
}

impl ApicTimer {
    /// Measures the number of timer ticks per millisecond, with the timer divided by 16.
    ///
    /// Runs a masked one-shot countdown from `u32::MAX` for [`CALIBRATION_WINDOW`], and reads the consumed ticks.
    pub fn calibrate(xapic: &XApic, timer: &dyn WaitTimer) -> Result<u32, ApicError> {
        xapic.set_timer_divide(TIMER_DIVIDE);
        xapic.write_lvt(
            LocalInterrupt::Timer,
            LocalVectorTableEntry::new()
                .with_vector(InterruptVector::TIMER)
                .with_delivery_mode(DeliveryMode::Fixed)
                .with_timer_mode(LVTTimerMode::OneShot)
                .with_masked(true),
        );

        xapic.set_timer_initial_count(u32::MAX);
        timer.busy_wait(CALIBRATION_WINDOW);
        let remaining = xapic.timer_current_count();
        xapic.set_timer_initial_count(0);

        let window = u32::try_from(CALIBRATION_WINDOW.as_millis()).map_err(|_| ApicError::Calibration)?;
        let ticks_per_millisecond = (u32::MAX - remaining) / window;

        if ticks_per_millisecond == 0 {
            return Err(ApicError::Calibration);
        }

        Ok(ticks_per_millisecond)
    }

    /// Creates a new, stopped, `ApicTimer`.
    pub fn new(
        cpu_id: ProcLocalApicID,
        ticks_per_millisecond: u32,
        tick_interval: Duration,
        yield_interval: Duration,
    ) -> Self {
        Self {
            cpu_id,
            ticks_per_millisecond,
            tick_interval,
            yield_interval,
            elapsed_millis: AtomicU64::new(0),
            last_yield_millis: AtomicU64::new(0),
        }
    }

    /// Local _APIC_ ID of the processor owning this timer.
    pub fn cpu_id(&self) -> ProcLocalApicID {
        self.cpu_id
    }

    /// Calibrated tick rate.
    pub fn ticks_per_millisecond(&self) -> u32 {
        self.ticks_per_millisecond
    }

    /// Interval between two timer interrupts.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Interval between two scheduler yields.
    pub fn yield_interval(&self) -> Duration {
        self.yield_interval
    }

    /// Initial count loaded in the timer, saturating on overflow.
    pub fn initial_count(&self) -> u32 {
        let millis = u32::try_from(self.tick_interval.as_millis()).unwrap_or(u32::MAX);

        self.ticks_per_millisecond.saturating_mul(millis.max(1))
    }

    /// Starts the periodic countdown. Must be called on the processor owning this timer.
    pub fn start(&self, xapic: &XApic) {
        xapic.set_timer_divide(TIMER_DIVIDE);
        xapic.write_lvt(
            LocalInterrupt::Timer,
            LocalVectorTableEntry::new()
                .with_vector(InterruptVector::TIMER)
                .with_delivery_mode(DeliveryMode::Fixed)
                .with_timer_mode(LVTTimerMode::Periodic)
                .with_masked(false),
        );
        xapic.set_timer_initial_count(self.initial_count());
    }

    /// Accounts for one timer interrupt.
    ///
    /// Returns `true` when at least `yield_interval` elapsed since the last time it did.
    pub fn on_interrupt(&self) -> bool {
        let tick = u64::try_from(self.tick_interval.as_millis()).unwrap_or(u64::MAX);
        let now = self.elapsed_millis.fetch_add(tick, Ordering::Relaxed) + tick;
        let yield_every = u64::try_from(self.yield_interval.as_millis()).unwrap_or(u64::MAX);
        let last = self.last_yield_millis.load(Ordering::Relaxed);

        if now - last >= yield_every {
            self.last_yield_millis.store(now, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Time elapsed since the timer was started, as counted by its interrupts.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_millis.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{leak, MockLocalApic, MockTimer};
    use crate::x86::apic::local_apic::LocalAPICRegisterOffset;

    #[test]
    fn calibration_counts_ticks_over_window() {
        let mock = leak(MockLocalApic::new(0));
        let xapic = XApic::new(mock);
        let timer = MockTimer::default();

        let rate = ApicTimer::calibrate(&xapic, &timer).unwrap();

        assert_eq!(rate, 1000);
        assert_eq!(timer.total_waited(), CALIBRATION_WINDOW);
        assert!(mock
            .writes()
            .contains(&(LocalAPICRegisterOffset::TIMER_DIVIDE.get(), 0b0011)));
    }

    #[test]
    fn stalled_timer_fails_calibration() {
        let mock = leak(MockLocalApic::new(0));
        mock.set_timer_stalled(true);
        let xapic = XApic::new(mock);

        assert_eq!(
            ApicTimer::calibrate(&xapic, &MockTimer::default()),
            Err(ApicError::Calibration)
        );
    }

    #[test]
    fn start_programs_periodic_countdown() {
        let mock = leak(MockLocalApic::new(0));
        let xapic = XApic::new(mock);
        let timer = ApicTimer::new(
            ProcLocalApicID::from(0),
            1000,
            Duration::from_millis(2),
            DEFAULT_YIELD_INTERVAL,
        );

        timer.start(&xapic);

        let lvt = xapic.read_lvt(LocalInterrupt::Timer);
        assert_eq!(lvt.timer_mode(), LVTTimerMode::Periodic);
        assert_eq!(lvt.vector(), InterruptVector::TIMER);
        assert!(!lvt.masked());
        assert_eq!(
            mock.register(LocalAPICRegisterOffset::TIMER_INITIAL_COUNT.get()),
            2000
        );
    }

    #[test]
    fn yield_is_reported_every_yield_interval() {
        let timer = ApicTimer::new(
            ProcLocalApicID::from(0),
            1000,
            DEFAULT_TICK_INTERVAL,
            DEFAULT_YIELD_INTERVAL,
        );

        let yields: alloc::vec::Vec<bool> = (0..20).map(|_| timer.on_interrupt()).collect();

        assert_eq!(yields.iter().filter(|&&y| y).count(), 2);
        assert!(yields[9] && yields[19]);
        assert_eq!(timer.elapsed(), Duration::from_millis(20));
    }

    #[test]
    fn initial_count_saturates() {
        let timer = ApicTimer::new(
            ProcLocalApicID::from(0),
            u32::MAX / 2,
            Duration::from_millis(4),
            DEFAULT_YIELD_INTERVAL,
        );

        assert_eq!(timer.initial_count(), u32::MAX);
    }
}
